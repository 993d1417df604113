//! Berth kubehub: Kubernetes-backed record store, secret resolver and change feed.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::Result;
use berth_core::{
    ChangeKind, EngineError, EngineResult, Kind, Notification, ObjectRef, Record, RecordMeta, SecretKeyRef, API_GROUP, API_VERSION,
};
use berth_store::{CredentialResolver, RecordStore, StoreError};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub fn api_resource(kind: Kind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(API_GROUP, API_VERSION, kind.as_str());
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

fn map_kube_err(what: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(format!("{}: {}", what, ae.message)),
        other => StoreError::Backend(format!("{}: {}", what, other)),
    }
}

/// Build a record from a served object.
pub fn record_from_object(kind: Kind, obj: &DynamicObject) -> EngineResult<Record> {
    let m = &obj.metadata;
    let meta = RecordMeta {
        name: m.name.clone().unwrap_or_default(),
        namespace: m.namespace.clone().unwrap_or_default(),
        uid: m.uid.clone(),
        resource_version: m.resource_version.clone(),
        generation: m.generation,
        deletion_timestamp: m.deletion_timestamp.as_ref().map(|t| t.0),
        finalizers: m.finalizers.clone().unwrap_or_default().into_iter().collect(),
        labels: m.labels.clone().unwrap_or_default(),
        annotations: m.annotations.clone().unwrap_or_default(),
    };
    let spec = obj.data.get("spec").cloned().unwrap_or(serde_json::Value::Null);
    let status = obj.data.get("status").cloned();
    Record::from_parts(kind, meta, spec, status)
}

/// Inverse of [`record_from_object`].
pub fn object_from_record(record: &Record) -> DynamicObject {
    let m = &record.metadata;
    let opt_map = |b: &BTreeMap<String, String>| if b.is_empty() { None } else { Some(b.clone()) };
    let metadata = ObjectMeta {
        name: Some(m.name.clone()),
        namespace: Some(m.namespace.clone()),
        uid: m.uid.clone(),
        resource_version: m.resource_version.clone(),
        generation: m.generation,
        deletion_timestamp: m.deletion_timestamp.map(Time),
        finalizers: Some(m.finalizers.iter().cloned().collect()),
        labels: opt_map(&m.labels),
        annotations: opt_map(&m.annotations),
        ..Default::default()
    };
    let mut obj = DynamicObject::new(&m.name, &api_resource(record.kind())).within(&m.namespace);
    obj.metadata = metadata;
    obj.data = serde_json::json!({
        "spec": record.spec.to_json(),
        "status": serde_json::to_value(&record.status).unwrap_or(serde_json::Value::Null),
    });
    obj
}

/// Records served as custom resources under the berth API group.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, kind: Kind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(kind))
    }

    fn decode(kind: Kind, obj: &DynamicObject) -> Result<Record, StoreError> {
        let name = obj.metadata.name.as_deref().unwrap_or_default();
        record_from_object(kind, obj).map_err(|e| match e {
            EngineError::Validation(m) => StoreError::Invalid(format!("{} {}: {}", kind, name, m)),
            other => StoreError::Backend(format!("decoding {} {}: {}", kind, name, other)),
        })
    }
}

#[async_trait::async_trait]
impl RecordStore for KubeStore {
    async fn get(&self, target: &ObjectRef) -> Result<Option<Record>, StoreError> {
        let obj = self
            .api(target.kind, &target.namespace)
            .get_opt(&target.name)
            .await
            .map_err(|e| map_kube_err(&target.to_string(), e))?;
        obj.map(|o| Self::decode(target.kind, &o)).transpose()
    }

    async fn list(&self, kind: Kind, namespace: &str) -> Result<Vec<Record>, StoreError> {
        let list = self
            .api(kind, namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_err(&format!("{}/{}", kind, namespace), e))?;
        let mut out = Vec::with_capacity(list.items.len());
        for o in &list.items {
            match Self::decode(kind, o) {
                Ok(r) => out.push(r),
                // one malformed object must not hide its siblings
                Err(e) => warn!(kind = %kind, name = ?o.metadata.name, error = %e, "kubehub: skipping undecodable object"),
            }
        }
        Ok(out)
    }

    async fn update(&self, record: &Record) -> Result<Record, StoreError> {
        let target = record.object_ref();
        let obj = object_from_record(record);
        let stored = self
            .api(target.kind, &target.namespace)
            .replace(&target.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(&target.to_string(), e))?;
        Self::decode(target.kind, &stored)
    }

    async fn update_status(&self, record: &Record) -> Result<Record, StoreError> {
        let target = record.object_ref();
        let body = serde_json::to_vec(&object_from_record(record))
            .map_err(|e| StoreError::Backend(format!("encoding {}: {}", target, e)))?;
        let stored = self
            .api(target.kind, &target.namespace)
            .replace_status(&target.name, &PostParams::default(), body)
            .await
            .map_err(|e| map_kube_err(&target.to_string(), e))?;
        Self::decode(target.kind, &stored)
    }
}

#[async_trait::async_trait]
impl CredentialResolver for KubeStore {
    async fn get(&self, namespace: &str, secret: &SecretKeyRef) -> Result<Vec<u8>, StoreError> {
        let what = format!("secret {}/{}", namespace, secret.name);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let s = api.get_opt(&secret.name).await.map_err(|e| map_kube_err(&what, e))?;
        let s = s.ok_or_else(|| StoreError::NotFound(what.clone()))?;
        s.data
            .and_then(|mut d| d.remove(&secret.key))
            .map(|b| b.0)
            .ok_or_else(|| StoreError::NotFound(format!("{} key {}", what, secret.key)))
    }
}

/// Change-feed entries for one watch event.
pub fn notifications_from(kind: Kind, ev: &Event<DynamicObject>) -> Vec<Notification> {
    let note = |o: &DynamicObject, change: ChangeKind| {
        let target = ObjectRef::new(
            kind,
            o.metadata.namespace.clone().unwrap_or_default(),
            o.metadata.name.clone().unwrap_or_default(),
        );
        Notification { target, change }
    };
    let applied = |o: &DynamicObject| {
        if o.metadata.deletion_timestamp.is_some() { ChangeKind::DeleteRequested } else { ChangeKind::Applied }
    };
    match ev {
        Event::Applied(o) => vec![note(o, applied(o))],
        Event::Deleted(o) => vec![note(o, ChangeKind::Removed)],
        Event::Restarted(list) => list.iter().map(|o| note(o, applied(o))).collect(),
    }
}

async fn watch_kind(client: Client, kind: Kind, namespace: Option<String>, tx: mpsc::UnboundedSender<Notification>) {
    let ar = api_resource(kind);
    let api: Api<DynamicObject> = match namespace.as_deref() {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(ev) => {
                if let Event::Restarted(list) = &ev {
                    debug!(kind = %kind, count = list.len(), "watch restart");
                }
                for n in notifications_from(kind, &ev) {
                    if tx.send(n).is_err() {
                        info!(kind = %kind, "watcher: feed closed");
                        return;
                    }
                }
            }
            Err(e) => {
                counter!("watch_errors_total", 1u64, "kind" => kind.as_str());
                warn!(kind = %kind, error = %e, "watcher error");
            }
        }
    }
    warn!(kind = %kind, "watcher stream ended");
}

/// Start one list+watch per kind feeding `tx`. Tasks stop when the receiver is dropped.
pub fn start_watchers(
    client: Client,
    namespace: Option<&str>,
    tx: mpsc::UnboundedSender<Notification>,
) -> Vec<JoinHandle<()>> {
    Kind::ALL
        .iter()
        .map(|&kind| tokio::spawn(watch_kind(client.clone(), kind, namespace.map(str::to_string), tx.clone())))
        .collect()
}

/// Connect using the ambient kubeconfig or in-cluster environment.
pub async fn connect() -> Result<Client> {
    Ok(Client::try_default().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{RegistrySpec, Spec};

    fn object() -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "registries.berth.dev/v1alpha1",
            "kind": "Registry",
            "metadata": {
                "name": "hub",
                "namespace": "ns",
                "uid": "8e1b7c1a-0000-4000-8000-000000000001",
                "resourceVersion": "17",
                "generation": 2,
                "finalizers": ["registries.berth.dev/finalizer"]
            },
            "spec": {"parent": "inst1", "url": "https://hub.docker.com", "type": "docker-hub"},
            "status": {"phase": "Ready", "externalId": 4}
        }))
        .unwrap()
    }

    #[test]
    fn api_resource_uses_group_and_plural() {
        let ar = api_resource(Kind::ChartRepository);
        assert_eq!(ar.group, "registries.berth.dev");
        assert_eq!(ar.plural, "chartrepositories");
        assert_eq!(ar.api_version, "registries.berth.dev/v1alpha1");
    }

    #[test]
    fn objects_convert_to_records_and_back() {
        let rec = record_from_object(Kind::Registry, &object()).unwrap();
        assert_eq!(rec.object_ref(), ObjectRef::new(Kind::Registry, "ns", "hub"));
        assert_eq!(rec.metadata.resource_version.as_deref(), Some("17"));
        assert!(rec.metadata.has_finalizer("registries.berth.dev/finalizer"));
        assert_eq!(rec.status.external_id, Some(4));
        let Spec::Registry(RegistrySpec { registry_type, .. }) = &rec.spec else { panic!("wrong spec") };
        assert_eq!(registry_type.as_deref(), Some("docker-hub"));

        let back = object_from_record(&rec);
        assert_eq!(back.metadata.resource_version.as_deref(), Some("17"));
        assert_eq!(back.data["spec"]["url"], "https://hub.docker.com");
        assert_eq!(back.data["status"]["externalId"], 4);
        assert_eq!(record_from_object(Kind::Registry, &back).unwrap(), rec);
    }

    #[test]
    fn malformed_specs_decode_as_invalid() {
        let mut o = object();
        o.data["spec"]["insecure"] = serde_json::json!("sometimes");
        match KubeStore::decode(Kind::Registry, &o) {
            Err(StoreError::Invalid(m)) => assert!(m.contains("Registry hub"), "{}", m),
            other => panic!("expected Invalid, got {:?}", other.map(|r| r.object_ref())),
        }
        assert!(KubeStore::decode(Kind::Registry, &object()).is_ok());
    }

    #[test]
    fn deleting_objects_surface_as_delete_requests() {
        let mut o = object();
        let n = notifications_from(Kind::Registry, &Event::Applied(o.clone()));
        assert_eq!(n[0].change, ChangeKind::Applied);
        o.metadata.deletion_timestamp = Some(Time(chrono_now()));
        let n = notifications_from(Kind::Registry, &Event::Applied(o.clone()));
        assert_eq!(n[0].change, ChangeKind::DeleteRequested);
        let n = notifications_from(Kind::Registry, &Event::Deleted(o));
        assert_eq!(n[0].change, ChangeKind::Removed);
        assert_eq!(n[0].target.to_string(), "Registry/ns/hub");
    }

    fn chrono_now() -> chrono::DateTime<chrono::Utc> { chrono::Utc::now() }
}
