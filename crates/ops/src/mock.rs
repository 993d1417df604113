//! In-memory chart operations used by tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::{ChartOps, ListedRepository, OpsError, OpsResult, Release, ReleaseSpec, RepositoryEntry};

#[derive(Default)]
struct State {
    repositories: BTreeMap<String, RepositoryEntry>,
    index_updates: usize,
    /// (namespace, release) -> revision history, oldest first.
    releases: BTreeMap<(String, String), Vec<(Release, serde_json::Value)>>,
    failures: HashMap<String, OpsError>,
    calls: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockCharts {
    state: Arc<Mutex<State>>,
}

impl MockCharts {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enter(&self, op: &str) -> OpsResult<MutexGuard<'_, State>> {
        let mut st = self.lock();
        st.calls.push(op.to_string());
        match st.failures.remove(op) {
            Some(e) => Err(e),
            None => Ok(st),
        }
    }

    /// Fail the next call named `op` (`install_or_upgrade`, `rollback`, ...).
    pub fn fail_next(&self, op: &str, err: OpsError) { self.lock().failures.insert(op.to_string(), err); }
    pub fn calls(&self) -> Vec<String> { self.lock().calls.clone() }
    pub fn count(&self, op: &str) -> usize { self.lock().calls.iter().filter(|c| c.as_str() == op).count() }
    pub fn index_updates(&self) -> usize { self.lock().index_updates }
    pub fn repository(&self, name: &str) -> Option<RepositoryEntry> { self.lock().repositories.get(name).cloned() }

    /// Drop an entry behind the engine's back, as a lost repository config would.
    pub fn forget_repository(&self, name: &str) -> bool { self.lock().repositories.remove(name).is_some() }

    pub fn current(&self, release: &str, namespace: &str) -> Option<Release> {
        let st = self.lock();
        st.releases.get(&(namespace.to_string(), release.to_string())).and_then(|h| h.last()).map(|(r, _)| r.clone())
    }

    pub fn current_values(&self, release: &str, namespace: &str) -> Option<serde_json::Value> {
        let st = self.lock();
        st.releases.get(&(namespace.to_string(), release.to_string())).and_then(|h| h.last()).map(|(_, v)| v.clone())
    }
}

#[async_trait::async_trait]
impl ChartOps for MockCharts {
    async fn update_repository_index(&self) -> OpsResult<()> {
        self.enter("update_repository_index")?.index_updates += 1;
        Ok(())
    }

    async fn add_repository(&self, entry: &RepositoryEntry) -> OpsResult<()> {
        self.enter("add_repository")?.repositories.insert(entry.name.clone(), entry.clone());
        Ok(())
    }

    async fn remove_repository(&self, name: &str) -> OpsResult<()> {
        let mut st = self.enter("remove_repository")?;
        st.repositories.remove(name).map(|_| ()).ok_or_else(|| OpsError::NotFound(format!("repository {}", name)))
    }

    async fn list_repositories(&self) -> OpsResult<Vec<ListedRepository>> {
        let st = self.enter("list_repositories")?;
        Ok(st.repositories.values().map(|e| ListedRepository { name: e.name.clone(), url: e.url.clone() }).collect())
    }

    async fn status(&self, release: &str, namespace: &str) -> OpsResult<Option<Release>> {
        let st = self.enter("status")?;
        Ok(st.releases.get(&(namespace.to_string(), release.to_string())).and_then(|h| h.last()).map(|(r, _)| r.clone()))
    }

    async fn install_or_upgrade(&self, spec: &ReleaseSpec, _timeout: Duration) -> OpsResult<Release> {
        let mut st = self.enter("install_or_upgrade")?;
        let repo = spec.chart.split('/').next().unwrap_or_default().to_string();
        if !st.repositories.contains_key(&repo) {
            return Err(OpsError::NotFound(format!("repository {}", repo)));
        }
        let history = st.releases.entry((spec.namespace.clone(), spec.name.clone())).or_default();
        let revision = history.last().map(|(r, _)| r.revision + 1).unwrap_or(1);
        let rel = Release {
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            revision,
            status: "deployed".into(),
        };
        history.push((rel.clone(), spec.values.clone()));
        Ok(rel)
    }

    async fn rollback(&self, release: &str, namespace: &str, revision: u32, _timeout: Duration) -> OpsResult<()> {
        let mut st = self.enter("rollback")?;
        let history = st
            .releases
            .get_mut(&(namespace.to_string(), release.to_string()))
            .ok_or_else(|| OpsError::NotFound(format!("release {}", release)))?;
        let values = history
            .iter()
            .find(|(r, _)| r.revision == revision)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| OpsError::NotFound(format!("release {} revision {}", release, revision)))?;
        let next = history.last().map(|(r, _)| r.revision + 1).unwrap_or(1);
        history.push((
            Release { name: release.to_string(), namespace: namespace.to_string(), revision: next, status: "deployed".into() },
            values,
        ));
        Ok(())
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> OpsResult<()> {
        let mut st = self.enter("uninstall")?;
        st.releases
            .remove(&(namespace.to_string(), release.to_string()))
            .map(|_| ())
            .ok_or_else(|| OpsError::NotFound(format!("release {}", release)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(values: serde_json::Value) -> ReleaseSpec {
        ReleaseSpec { name: "r".into(), namespace: "ns".into(), chart: "repo/harbor".into(), version: None, values }
    }

    #[tokio::test]
    async fn upgrade_bumps_revision_and_rollback_restores_values() {
        let m = MockCharts::new();
        m.add_repository(&RepositoryEntry { name: "repo".into(), url: "https://c".into(), username: None, password: None })
            .await
            .unwrap();
        m.install_or_upgrade(&spec(serde_json::json!({"a": 1})), Duration::from_secs(1)).await.unwrap();
        let r2 = m.install_or_upgrade(&spec(serde_json::json!({"a": 2})), Duration::from_secs(1)).await.unwrap();
        assert_eq!(r2.revision, 2);
        m.rollback("r", "ns", 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(m.current("r", "ns").unwrap().revision, 3);
        assert_eq!(m.current_values("r", "ns").unwrap(), serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn unknown_repository_is_not_found() {
        let m = MockCharts::new();
        let err = m.install_or_upgrade(&spec(serde_json::json!({})), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, OpsError::NotFound(_)));
        assert!(matches!(m.uninstall("r", "ns").await, Err(OpsError::NotFound(_))));
    }
}
