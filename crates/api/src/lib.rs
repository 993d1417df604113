//! Berth registry-platform adapter.
//!
//! This crate defines the typed surface the engine talks to: remote entity
//! shapes, a `RegistryApi` trait with get/create/update/delete per entity plus
//! a liveness probe, and the connector that builds a client per instance.
//! Implementations: Harbor v2.0 REST (`HarborClient`) and an in-memory mock.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_core::EngineError;
use serde::{Deserialize, Serialize};

mod harbor;
mod mock;

pub use harbor::{HarborClient, HarborConnector};
pub use mock::{MockConnector, MockRegistry};

/// Adapter errors. "Not found" is its own variant so callers never inspect messages.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("decode: {0}")]
    Decode(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

impl From<RemoteError> for EngineError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotFound(m) => EngineError::NotFound(m),
            // A remote name clash is retried like a transient failure; the next
            // run finds the entity by name and converges it.
            RemoteError::Conflict(m) => EngineError::Transient(format!("remote conflict: {}", m)),
            RemoteError::Transient(m) => EngineError::Transient(m),
            RemoteError::Rejected { status, message } if status == 400 || status == 422 => {
                EngineError::Validation(format!("remote rejected request ({}): {}", status, message))
            }
            RemoteError::Rejected { status, message } => {
                EngineError::Transient(format!("remote rejected request ({}): {}", status, message))
            }
            RemoteError::Decode(m) => EngineError::Internal(format!("remote payload: {}", m)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteCredential {
    #[serde(rename = "type")]
    pub credential_type: String,
    pub access_key: String,
    pub access_secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteRegistry {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub registry_type: String,
    pub url: String,
    pub description: String,
    pub insecure: bool,
    pub credential: Option<RemoteCredential>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteProject {
    pub id: i64,
    pub name: String,
    pub public: bool,
    pub auto_scan: bool,
    pub prevent_vulnerable: bool,
    pub severity: String,
    /// Retention policy bound to this project; managed by the platform.
    pub retention_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteMember {
    pub id: i64,
    pub username: String,
    pub role_id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteFilter {
    #[serde(rename = "type")]
    pub filter_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteTrigger {
    #[serde(rename = "type")]
    pub trigger_type: String,
    pub cron: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteReplication {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub src_registry_id: Option<i64>,
    pub dest_registry_id: Option<i64>,
    pub dest_namespace: String,
    pub filters: Vec<RemoteFilter>,
    pub trigger: RemoteTrigger,
    pub deletion: bool,
    #[serde(rename = "override")]
    pub override_existing: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionStatus {
    InProgress,
    Succeed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteExecution {
    pub id: i64,
    pub status: ExecutionStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteSelector {
    pub kind: String,
    pub decoration: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteRetentionRule {
    pub disabled: bool,
    pub template: String,
    pub params: BTreeMap<String, serde_json::Value>,
    pub tag_selectors: Vec<RemoteSelector>,
    pub repository_selectors: Vec<RemoteSelector>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteRetention {
    pub id: i64,
    pub algorithm: String,
    pub rules: Vec<RemoteRetentionRule>,
    pub cron: String,
    pub project_id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteUser {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub realname: String,
    pub comment: String,
    pub admin: bool,
}

/// Typed client for one registry-platform instance. Stateless translation layer.
#[async_trait::async_trait]
pub trait RegistryApi: Send + Sync {
    /// Liveness probe; `Ok(false)` means reachable but unhealthy.
    async fn health(&self) -> RemoteResult<bool>;

    async fn get_registry(&self, name: &str) -> RemoteResult<Option<RemoteRegistry>>;
    async fn create_registry(&self, want: &RemoteRegistry) -> RemoteResult<i64>;
    async fn update_registry(&self, want: &RemoteRegistry) -> RemoteResult<()>;
    async fn delete_registry(&self, id: i64) -> RemoteResult<()>;

    async fn get_project(&self, name: &str) -> RemoteResult<Option<RemoteProject>>;
    async fn create_project(&self, want: &RemoteProject) -> RemoteResult<i64>;
    async fn update_project(&self, want: &RemoteProject) -> RemoteResult<()>;
    async fn delete_project(&self, name: &str) -> RemoteResult<()>;

    async fn list_members(&self, project: &str) -> RemoteResult<Vec<RemoteMember>>;
    async fn add_member(&self, project: &str, username: &str, role_id: i64) -> RemoteResult<()>;
    async fn update_member(&self, project: &str, member_id: i64, role_id: i64) -> RemoteResult<()>;
    async fn remove_member(&self, project: &str, member_id: i64) -> RemoteResult<()>;

    async fn get_replication(&self, name: &str) -> RemoteResult<Option<RemoteReplication>>;
    async fn create_replication(&self, want: &RemoteReplication) -> RemoteResult<i64>;
    async fn update_replication(&self, want: &RemoteReplication) -> RemoteResult<()>;
    async fn delete_replication(&self, id: i64) -> RemoteResult<()>;
    async fn trigger_execution(&self, policy_id: i64) -> RemoteResult<i64>;
    async fn get_execution(&self, id: i64) -> RemoteResult<RemoteExecution>;

    async fn get_retention(&self, id: i64) -> RemoteResult<Option<RemoteRetention>>;
    async fn create_retention(&self, want: &RemoteRetention) -> RemoteResult<i64>;
    async fn update_retention(&self, want: &RemoteRetention) -> RemoteResult<()>;
    async fn delete_retention(&self, id: i64) -> RemoteResult<()>;

    async fn get_user(&self, username: &str) -> RemoteResult<Option<RemoteUser>>;
    async fn create_user(&self, want: &RemoteUser, password: &str) -> RemoteResult<i64>;
    async fn update_user_profile(&self, want: &RemoteUser) -> RemoteResult<()>;
    async fn set_user_admin(&self, id: i64, admin: bool) -> RemoteResult<()>;
    async fn set_user_password(&self, id: i64, password: &str) -> RemoteResult<()>;
    async fn delete_user(&self, id: i64) -> RemoteResult<()>;
}

/// Address and admin credentials of one instance.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryEndpoint {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RegistryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEndpoint").field("url", &self.url).field("username", &self.username).finish()
    }
}

/// Builds a client for an instance endpoint.
pub trait RegistryConnector: Send + Sync {
    fn connect(&self, endpoint: &RegistryEndpoint) -> RemoteResult<Arc<dyn RegistryApi>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_map_onto_engine_taxonomy() {
        assert!(matches!(EngineError::from(RemoteError::NotFound("x".into())), EngineError::NotFound(_)));
        assert!(matches!(
            EngineError::from(RemoteError::Rejected { status: 400, message: "bad".into() }),
            EngineError::Validation(_)
        ));
        assert!(matches!(
            EngineError::from(RemoteError::Rejected { status: 401, message: "auth".into() }),
            EngineError::Transient(_)
        ));
    }

    #[test]
    fn endpoint_debug_hides_password() {
        let ep = RegistryEndpoint { url: "https://h".into(), username: "admin".into(), password: "s3cret".into() };
        assert!(!format!("{:?}", ep).contains("s3cret"));
    }
}
