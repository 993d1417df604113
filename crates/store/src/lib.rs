//! Berth store: record-store and credential seams, an in-memory store with a
//! change feed, and the key-coalescing queue the dispatcher drains.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

use async_trait::async_trait;
use berth_core::{ChangeKind, EngineError, Kind, Notification, ObjectRef, Record, SecretKeyRef};
use chrono::Utc;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// Stored object cannot be read as a record; only an edit fixes it.
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => EngineError::NotFound(m),
            StoreError::Conflict(m) => EngineError::Conflict(m),
            StoreError::Invalid(m) => EngineError::Validation(m),
            StoreError::Backend(m) => EngineError::Transient(m),
        }
    }
}

/// Durable key-addressed records with optimistic concurrency.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, target: &ObjectRef) -> Result<Option<Record>, StoreError>;

    async fn list(&self, kind: Kind, namespace: &str) -> Result<Vec<Record>, StoreError>;

    /// Write metadata and spec. A stale `resource_version` yields `Conflict`.
    async fn update(&self, record: &Record) -> Result<Record, StoreError>;

    /// Write the status substructure only. A stale `resource_version` yields `Conflict`.
    async fn update_status(&self, record: &Record) -> Result<Record, StoreError>;
}

/// Secret material lookup.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn get(&self, namespace: &str, secret: &SecretKeyRef) -> Result<Vec<u8>, StoreError>;

    async fn get_string(&self, namespace: &str, secret: &SecretKeyRef) -> Result<String, StoreError> {
        let bytes = self.get(namespace, secret).await?;
        String::from_utf8(bytes).map_err(|_| {
            StoreError::Backend(format!("secret {}/{} key {} is not utf-8", namespace, secret.name, secret.key))
        })
    }
}

/// Coalescing queue keyed by identity with FIFO order.
///
/// A key pushed while already queued keeps its original position. Capacity is
/// advisory: producers check `is_full` and stop feeding instead of dropping.
pub struct Coalescer<K> {
    queued: FxHashSet<K>,
    order: VecDeque<K>,
    cap: usize,
}

impl<K: Hash + Eq + Clone> Coalescer<K> {
    pub fn with_capacity(cap: usize) -> Self {
        Self { queued: FxHashSet::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
    pub fn is_full(&self) -> bool { self.order.len() >= self.cap }
    pub fn contains(&self, k: &K) -> bool { self.queued.contains(k) }

    /// Returns false when the key was already queued.
    pub fn push(&mut self, k: K) -> bool {
        if !self.queued.insert(k.clone()) { return false; }
        self.order.push_back(k);
        true
    }

    /// Pop the oldest key accepted by `ready`; rejected keys keep their place.
    pub fn pop_where(&mut self, mut ready: impl FnMut(&K) -> bool) -> Option<K> {
        let idx = self.order.iter().position(|k| ready(k))?;
        let k = self.order.remove(idx)?;
        self.queued.remove(&k);
        Some(k)
    }
}

#[derive(Default)]
struct Inner {
    records: FxHashMap<ObjectRef, Record>,
    secrets: FxHashMap<(String, String), BTreeMap<String, Vec<u8>>>,
    next_rv: u64,
    updates: u64,
    status_writes: u64,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

/// In-memory record store and credential resolver.
///
/// External-actor operations (`put`, `request_delete`) and metadata writes emit
/// change notifications; status writes do not.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    feed: Option<mpsc::UnboundedSender<Notification>>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self { Self { inner: Mutex::new(Inner::default()), feed: None } }

    /// Store wired to a change feed.
    pub fn with_feed() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { inner: Mutex::new(Inner::default()), feed: Some(tx) }, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn notify(&self, target: ObjectRef, change: ChangeKind) {
        if let Some(tx) = &self.feed {
            let _ = tx.send(Notification { target, change });
        }
    }

    /// Create or edit a record's desired state as an external actor would.
    /// Status, finalizers and deletion intent of an existing record are preserved.
    pub fn put(&self, mut record: Record) -> Record {
        let target = record.object_ref();
        let stored = {
            let mut g = self.lock();
            let rv = g.bump();
            match g.records.get(&target) {
                Some(prev) => {
                    let spec_changed = prev.spec != record.spec;
                    let gen = prev.metadata.generation.unwrap_or(1);
                    record.metadata.generation = Some(if spec_changed { gen + 1 } else { gen });
                    record.metadata.finalizers = prev.metadata.finalizers.clone();
                    record.metadata.deletion_timestamp = prev.metadata.deletion_timestamp;
                    record.metadata.uid = prev.metadata.uid.clone();
                    record.status = prev.status.clone();
                }
                None => {
                    record.metadata.generation = Some(1);
                    record.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
                }
            }
            record.metadata.resource_version = Some(rv);
            g.records.insert(target.clone(), record.clone());
            record
        };
        self.notify(target, ChangeKind::Applied);
        stored
    }

    /// Record deletion intent. Without finalizers the record is removed at once.
    pub fn request_delete(&self, target: &ObjectRef) -> bool {
        let change = {
            let mut g = self.lock();
            let rv = g.bump();
            let Some(rec) = g.records.get_mut(target) else { return false };
            if rec.metadata.finalizers.is_empty() {
                g.records.remove(target);
                ChangeKind::Removed
            } else {
                if rec.metadata.deletion_timestamp.is_none() {
                    rec.metadata.deletion_timestamp = Some(Utc::now());
                }
                rec.metadata.resource_version = Some(rv);
                ChangeKind::DeleteRequested
            }
        };
        self.notify(target.clone(), change);
        true
    }

    pub fn put_secret(&self, namespace: &str, name: &str, key: &str, value: impl Into<Vec<u8>>) {
        let mut g = self.lock();
        g.secrets
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Current copy of a record, bypassing the async seam.
    pub fn snapshot(&self, target: &ObjectRef) -> Option<Record> { self.lock().records.get(target).cloned() }

    pub fn contains(&self, target: &ObjectRef) -> bool { self.lock().records.contains_key(target) }

    /// Number of accepted metadata writes.
    pub fn update_count(&self) -> u64 { self.lock().updates }

    /// Number of accepted status writes.
    pub fn status_write_count(&self) -> u64 { self.lock().status_writes }

    fn check_rv(stored: &Record, incoming: &Record) -> Result<(), StoreError> {
        if incoming.metadata.resource_version.is_some()
            && incoming.metadata.resource_version != stored.metadata.resource_version
        {
            return Err(StoreError::Conflict(format!(
                "{}: resource version {:?} is stale (current {:?})",
                incoming.object_ref(),
                incoming.metadata.resource_version,
                stored.metadata.resource_version
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, target: &ObjectRef) -> Result<Option<Record>, StoreError> {
        Ok(self.lock().records.get(target).cloned())
    }

    async fn list(&self, kind: Kind, namespace: &str) -> Result<Vec<Record>, StoreError> {
        let g = self.lock();
        let mut out: Vec<Record> = g
            .records
            .iter()
            .filter(|(k, _)| k.kind == kind && k.namespace == namespace)
            .map(|(_, r)| r.clone())
            .collect();
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(out)
    }

    async fn update(&self, record: &Record) -> Result<Record, StoreError> {
        let target = record.object_ref();
        let (stored, change) = {
            let mut g = self.lock();
            let rv = g.bump();
            let stored = g.records.get_mut(&target).ok_or_else(|| StoreError::NotFound(target.to_string()))?;
            Self::check_rv(stored, record)?;
            stored.metadata.finalizers = record.metadata.finalizers.clone();
            stored.metadata.labels = record.metadata.labels.clone();
            stored.metadata.annotations = record.metadata.annotations.clone();
            stored.spec = record.spec.clone();
            stored.metadata.resource_version = Some(rv);
            let out = stored.clone();
            let removable = out.is_deleting() && out.metadata.finalizers.is_empty();
            if removable {
                g.records.remove(&target);
            }
            g.updates += 1;
            (out, if removable { ChangeKind::Removed } else { ChangeKind::Applied })
        };
        counter!("store_updates_total", 1u64);
        debug!(target = %target, removed = matches!(change, ChangeKind::Removed), "store: update");
        self.notify(target, change);
        Ok(stored)
    }

    async fn update_status(&self, record: &Record) -> Result<Record, StoreError> {
        let target = record.object_ref();
        let mut g = self.lock();
        let rv = g.bump();
        let stored = g.records.get_mut(&target).ok_or_else(|| StoreError::NotFound(target.to_string()))?;
        Self::check_rv(stored, record)?;
        stored.status = record.status.clone();
        stored.metadata.resource_version = Some(rv);
        let out = stored.clone();
        g.status_writes += 1;
        Ok(out)
    }
}

#[async_trait]
impl CredentialResolver for MemoryStore {
    async fn get(&self, namespace: &str, secret: &SecretKeyRef) -> Result<Vec<u8>, StoreError> {
        let g = self.lock();
        g.secrets
            .get(&(namespace.to_string(), secret.name.clone()))
            .and_then(|data| data.get(&secret.key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("secret {}/{} key {}", namespace, secret.name, secret.key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{RecordMeta, RegistrySpec, Spec};

    fn registry(name: &str) -> Record {
        Record::new(
            RecordMeta::new("ns", name),
            Spec::Registry(RegistrySpec { parent: "inst1".into(), url: "https://r".into(), ..Default::default() }),
        )
    }

    #[test]
    fn undecodable_records_stay_validation_errors() {
        assert!(EngineError::from(StoreError::Invalid("Registry/ns/r1: bad spec".into())).is_permanent());
        assert!(!EngineError::from(StoreError::Backend("etcd timeout".into())).is_permanent());
    }

    #[test]
    fn coalescer_dedups_and_keeps_fifo() {
        let mut q = Coalescer::with_capacity(2);
        assert!(q.push("a"));
        assert!(q.push("b"));
        assert!(!q.push("a"));
        assert!(q.is_full());
        assert_eq!(q.pop_where(|k| *k != "a"), Some("b"));
        assert_eq!(q.pop_where(|_| true), Some("a"));
        assert!(q.is_empty());
        assert!(!q.contains(&"a"));
    }

    #[tokio::test]
    async fn stale_writes_conflict() {
        let store = MemoryStore::new();
        let rec = store.put(registry("r1"));
        let mut a = rec.clone();
        a.metadata.add_finalizer("x");
        store.update(&a).await.unwrap();
        let mut b = rec.clone();
        b.status.message = "late".into();
        assert!(matches!(store.update_status(&b).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn finalizers_hold_deletion_until_cleared() {
        let (store, mut feed) = MemoryStore::with_feed();
        let mut rec = store.put(registry("r1"));
        rec.metadata.add_finalizer("berth");
        store.update(&rec).await.unwrap();
        let target = rec.object_ref();
        assert!(store.request_delete(&target));
        let mut held = RecordStore::get(&store, &target).await.unwrap().unwrap();
        assert!(held.is_deleting());
        held.metadata.remove_finalizer("berth");
        store.update(&held).await.unwrap();
        assert!(!store.contains(&target));
        let mut changes = Vec::new();
        while let Ok(n) = feed.try_recv() { changes.push(n.change); }
        assert_eq!(
            changes,
            vec![ChangeKind::Applied, ChangeKind::Applied, ChangeKind::DeleteRequested, ChangeKind::Removed]
        );
    }

    #[tokio::test]
    async fn put_preserves_engine_owned_state() {
        let store = MemoryStore::new();
        let mut rec = store.put(registry("r1"));
        rec.status.external_id = Some(7);
        let rec = store.update_status(&rec).await.unwrap();
        let mut edited = registry("r1");
        if let Spec::Registry(s) = &mut edited.spec { s.insecure = Some(true); }
        let stored = store.put(edited);
        assert_eq!(stored.status.external_id, Some(7));
        assert_eq!(stored.metadata.generation, Some(2));
        assert_eq!(stored.metadata.uid, rec.metadata.uid);
    }

    #[tokio::test]
    async fn secrets_resolve_by_key() {
        let store = MemoryStore::new();
        store.put_secret("ns", "admin", "password", "hunter2");
        let key = SecretKeyRef { name: "admin".into(), key: "password".into() };
        assert_eq!(store.get_string("ns", &key).await.unwrap(), "hunter2");
        let missing = SecretKeyRef { name: "admin".into(), key: "nope".into() };
        assert!(matches!(CredentialResolver::get(&store, "ns", &missing).await, Err(StoreError::NotFound(_))));
    }
}
