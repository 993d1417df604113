//! Berth core types: records, status, phases and the engine error taxonomy.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod error;
pub mod spec;

pub use error::{EngineError, EngineResult};
pub use spec::*;

/// API group all berth custom resources are served under.
pub const API_GROUP: &str = "registries.berth.dev";
pub const API_VERSION: &str = "v1alpha1";

/// Managed resource kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Instance,
    ChartRepository,
    Registry,
    Project,
    Replication,
    Retention,
    User,
}

impl Kind {
    pub const ALL: [Kind; 7] = [
        Kind::Instance,
        Kind::ChartRepository,
        Kind::Registry,
        Kind::Project,
        Kind::Replication,
        Kind::Retention,
        Kind::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Instance => "Instance",
            Kind::ChartRepository => "ChartRepository",
            Kind::Registry => "Registry",
            Kind::Project => "Project",
            Kind::Replication => "Replication",
            Kind::Retention => "Retention",
            Kind::User => "User",
        }
    }

    /// Lowercase plural used for the REST resource path.
    pub fn plural(&self) -> &'static str {
        match self {
            Kind::Instance => "instances",
            Kind::ChartRepository => "chartrepositories",
            Kind::Registry => "registries",
            Kind::Project => "projects",
            Kind::Replication => "replications",
            Kind::Retention => "retentions",
            Kind::User => "users",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Kind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s) || k.plural() == s)
            .ok_or_else(|| EngineError::Validation(format!("unknown kind: {}", s)))
    }
}

/// Stable identity of a record: kind + namespace + name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Store-owned metadata of a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Optimistic-concurrency token; writes carrying a stale value are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    /// Deletion intent; set once by the store when deletion is requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finalizers: SmallVec<[String; 2]>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl RecordMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into(), ..Default::default() }
    }

    pub fn has_finalizer(&self, token: &str) -> bool { self.finalizers.iter().any(|f| f == token) }

    /// Adds `token` unless already present. Returns true when the set changed.
    pub fn add_finalizer(&mut self, token: &str) -> bool {
        if self.has_finalizer(token) { return false; }
        self.finalizers.push(token.to_string());
        true
    }

    /// Removes only `token`; finalizers owned by other actors stay untouched.
    pub fn remove_finalizer(&mut self, token: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != token);
        before != self.finalizers.len()
    }
}

/// Coarse reconciliation state. Each kind uses a subset, see the per-kind phase graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    #[default]
    Unknown,
    Creating,
    Ready,
    Completed,
    ExecutionRunning,
    ExecutionFinished,
    ExecutionFailed,
    Terminating,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Unknown => "Unknown",
            Phase::Creating => "Creating",
            Phase::Ready => "Ready",
            Phase::Completed => "Completed",
            Phase::ExecutionRunning => "ExecutionRunning",
            Phase::ExecutionFinished => "ExecutionFinished",
            Phase::ExecutionFailed => "ExecutionFailed",
            Phase::Terminating => "Terminating",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Per-project retention policy reference aggregated into a Retention status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChildStatus {
    pub project: String,
    pub policy_id: i64,
}

/// Engine-owned observed state written back onto each record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<DateTime<Utc>>,
    /// Identifier assigned by the remote system once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<i64>,
    /// Content hash of the last successfully applied resolved configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_revision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Status {
    /// Moves to `to` with a message. The transition timestamp only moves when the phase does.
    pub fn transition(&mut self, to: Phase, message: impl Into<String>) {
        if self.phase != to {
            self.phase = to;
            self.last_transition = Some(Utc::now());
        }
        self.message = message.into();
    }
}

/// A persisted desired-state record plus its engine-owned status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub metadata: RecordMeta,
    pub spec: Spec,
    #[serde(default)]
    pub status: Status,
}

impl Record {
    pub fn new(metadata: RecordMeta, spec: Spec) -> Self {
        Self { metadata, spec, status: Status::default() }
    }

    /// Build a record from loosely typed manifest parts (`spec` and `status` as JSON).
    pub fn from_parts(
        kind: Kind,
        metadata: RecordMeta,
        spec: serde_json::Value,
        status: Option<serde_json::Value>,
    ) -> EngineResult<Self> {
        let spec = Spec::from_json(kind, spec)?;
        let status = match status {
            Some(serde_json::Value::Null) | None => Status::default(),
            Some(v) => serde_json::from_value(v)
                .map_err(|e| EngineError::Validation(format!("{}/{}: invalid status: {}", kind, metadata.name, e)))?,
        };
        Ok(Self { metadata, spec, status })
    }

    pub fn kind(&self) -> Kind { self.spec.kind() }
    pub fn name(&self) -> &str { &self.metadata.name }
    pub fn namespace(&self) -> &str { &self.metadata.namespace }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind(), self.metadata.namespace.clone(), self.metadata.name.clone())
    }

    pub fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    /// Parent record this one is gated on, if any.
    pub fn parent_ref(&self) -> Option<ObjectRef> {
        self.spec
            .parent()
            .map(|p| ObjectRef::new(Kind::Instance, self.metadata.namespace.clone(), p))
    }

    /// Every record identity this one references (parent and siblings).
    pub fn references(&self) -> Vec<ObjectRef> {
        let ns = &self.metadata.namespace;
        let mut out: Vec<ObjectRef> = self.parent_ref().into_iter().collect();
        out.extend(self.spec.sibling_refs().into_iter().map(|(k, n)| ObjectRef::new(k, ns.clone(), n)));
        out
    }

    pub fn references_target(&self, target: &ObjectRef) -> bool {
        self.references().iter().any(|r| r == target)
    }
}

/// Outcome of one reconcile run, consumed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueNow,
    RequeueAfter(Duration),
}

/// Kind of change observed on the change feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Applied,
    DeleteRequested,
    Removed,
}

/// One change-feed entry. Carries only the identity: runs always re-fetch the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub target: ObjectRef,
    pub change: ChangeKind,
}

pub mod prelude {
    pub use super::{
        Action, ChangeKind, ChildStatus, EngineError, EngineResult, Kind, Notification, ObjectRef, Phase, Record,
        RecordMeta, Spec, Status,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(parent: &str) -> Record {
        let spec = Spec::Registry(RegistrySpec {
            parent: parent.into(),
            url: "https://hub.docker.com".into(),
            ..Default::default()
        });
        Record::new(RecordMeta::new("ns", "r1"), spec)
    }

    #[test]
    fn finalizers_leave_foreign_tokens_alone() {
        let mut m = RecordMeta::new("ns", "x");
        m.finalizers.push("other.io/keep".into());
        assert!(m.add_finalizer("berth"));
        assert!(!m.add_finalizer("berth"));
        assert!(m.remove_finalizer("berth"));
        assert!(!m.remove_finalizer("berth"));
        assert_eq!(m.finalizers.as_slice(), &["other.io/keep".to_string()]);
    }

    #[test]
    fn transition_only_stamps_on_phase_change() {
        let mut s = Status::default();
        s.transition(Phase::Creating, "a");
        let first = s.last_transition;
        assert!(first.is_some());
        s.transition(Phase::Creating, "b");
        assert_eq!(s.last_transition, first);
        assert_eq!(s.message, "b");
    }

    #[test]
    fn parent_is_an_instance_in_the_same_namespace() {
        let r = registry("inst1");
        assert_eq!(r.parent_ref(), Some(ObjectRef::new(Kind::Instance, "ns", "inst1")));
        assert!(r.references_target(&ObjectRef::new(Kind::Instance, "ns", "inst1")));
        assert!(!r.references_target(&ObjectRef::new(Kind::Instance, "other", "inst1")));
    }

    #[test]
    fn kind_parses_names_and_plurals() {
        assert_eq!("registry".parse::<Kind>().unwrap(), Kind::Registry);
        assert_eq!("chartrepositories".parse::<Kind>().unwrap(), Kind::ChartRepository);
        assert!("Pod".parse::<Kind>().is_err());
    }

    #[test]
    fn from_parts_rejects_mismatched_spec() {
        let err = Record::from_parts(Kind::Registry, RecordMeta::new("ns", "r"), serde_json::json!({"url": 5}), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
