//! Berth Ops: package-deployment adapter.
//! Drives the helm CLI (repository entries, index refresh, releases) behind the
//! `ChartOps` trait. An in-memory `MockCharts` backs tests.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use berth_core::EngineError;
use serde::{Deserialize, Serialize};

mod helm;
mod mock;

pub use helm::HelmCli;
pub use mock::MockCharts;

/// Package-deployment failures, classified once inside the adapter.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum OpsError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("failed: {0}")]
    Failed(String),
}

pub type OpsResult<T> = Result<T, OpsError>;

impl From<OpsError> for EngineError {
    fn from(e: OpsError) -> Self {
        match e {
            OpsError::NotFound(m) => EngineError::NotFound(m),
            OpsError::Timeout(m) => EngineError::Transient(format!("helm timed out: {}", m)),
            OpsError::Failed(m) => EngineError::Transient(format!("helm: {}", m)),
        }
    }
}

/// Paths and context handed to the helm binary on every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelmConfig {
    pub binary: PathBuf,
    pub repository_cache: Option<PathBuf>,
    pub repository_config: Option<PathBuf>,
    pub kube_context: Option<String>,
}

impl Default for HelmConfig {
    fn default() -> Self {
        Self { binary: PathBuf::from("helm"), repository_cache: None, repository_config: None, kube_context: None }
    }
}

impl HelmConfig {
    /// Read `BERTH_HELM_BIN`, `BERTH_HELM_REPOSITORY_CACHE`, `BERTH_HELM_REPOSITORY_CONFIG`, `BERTH_HELM_KUBE_CONTEXT`.
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|s| !s.trim().is_empty());
        Self {
            binary: var("BERTH_HELM_BIN").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("helm")),
            repository_cache: var("BERTH_HELM_REPOSITORY_CACHE").map(PathBuf::from),
            repository_config: var("BERTH_HELM_REPOSITORY_CONFIG").map(PathBuf::from),
            kube_context: var("BERTH_HELM_KUBE_CONTEXT"),
        }
    }
}

/// One entry of the local repository configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct RepositoryEntry {
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for RepositoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryEntry")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .finish()
    }
}

/// A configured repository as helm reports it; credentials are not listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedRepository {
    pub name: String,
    pub url: String,
}

/// Fully resolved install/upgrade request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSpec {
    pub name: String,
    pub namespace: String,
    /// `repository/chart`
    pub chart: String,
    pub version: Option<String>,
    pub values: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub status: String,
}

impl Release {
    pub fn is_deployed(&self) -> bool { self.status == "deployed" }
}

#[async_trait::async_trait]
pub trait ChartOps: Send + Sync {
    /// Refresh the local index of every configured repository.
    async fn update_repository_index(&self) -> OpsResult<()>;
    /// Add or overwrite a repository entry.
    async fn add_repository(&self, entry: &RepositoryEntry) -> OpsResult<()>;
    async fn remove_repository(&self, name: &str) -> OpsResult<()>;
    /// Entries currently in the repository configuration.
    async fn list_repositories(&self) -> OpsResult<Vec<ListedRepository>>;
    /// Current release, `None` when it was never installed.
    async fn status(&self, release: &str, namespace: &str) -> OpsResult<Option<Release>>;
    async fn install_or_upgrade(&self, spec: &ReleaseSpec, timeout: Duration) -> OpsResult<Release>;
    async fn rollback(&self, release: &str, namespace: &str, revision: u32, timeout: Duration) -> OpsResult<()>;
    async fn uninstall(&self, release: &str, namespace: &str) -> OpsResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_stays_distinguishable() {
        assert!(matches!(EngineError::from(OpsError::NotFound("release".into())), EngineError::NotFound(_)));
        assert!(matches!(EngineError::from(OpsError::Timeout("x".into())), EngineError::Transient(_)));
    }

    #[test]
    fn repository_entry_debug_hides_password() {
        let e = RepositoryEntry {
            name: "harbor".into(),
            url: "https://helm.goharbor.io".into(),
            username: Some("u".into()),
            password: Some("hunter2".into()),
        };
        assert!(!format!("{:?}", e).contains("hunter2"));
    }
}
