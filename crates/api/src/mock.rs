//! In-memory registry platform used by tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    ExecutionStatus, RegistryApi, RegistryConnector, RegistryEndpoint, RemoteError, RemoteExecution, RemoteMember,
    RemoteProject, RemoteRegistry, RemoteReplication, RemoteResult, RemoteRetention, RemoteUser,
};

#[derive(Default)]
struct State {
    healthy: bool,
    next_id: i64,
    registries: BTreeMap<i64, RemoteRegistry>,
    projects: BTreeMap<String, RemoteProject>,
    members: BTreeMap<String, Vec<RemoteMember>>,
    replications: BTreeMap<i64, RemoteReplication>,
    executions: BTreeMap<i64, RemoteExecution>,
    /// Status the next triggered execution starts in.
    execution_start: Option<ExecutionStatus>,
    retentions: BTreeMap<i64, RemoteRetention>,
    users: BTreeMap<i64, RemoteUser>,
    passwords: HashMap<i64, String>,
    failures: HashMap<String, RemoteError>,
    calls: Vec<String>,
    mutations: usize,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared fake of one registry-platform instance.
#[derive(Clone)]
pub struct MockRegistry {
    state: Arc<Mutex<State>>,
}

impl Default for MockRegistry {
    fn default() -> Self { Self::new() }
}

impl MockRegistry {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(State { healthy: true, ..Default::default() })) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a call and return any failure queued for it.
    fn enter(&self, op: &str, mutating: bool) -> RemoteResult<MutexGuard<'_, State>> {
        let mut st = self.lock();
        st.calls.push(op.to_string());
        if let Some(err) = st.failures.remove(op) {
            return Err(err);
        }
        if mutating {
            st.mutations += 1;
        }
        Ok(st)
    }

    pub fn set_healthy(&self, healthy: bool) { self.lock().healthy = healthy; }
    /// Count of successful create/update/delete calls.
    pub fn mutations(&self) -> usize { self.lock().mutations }
    pub fn calls(&self) -> Vec<String> { self.lock().calls.clone() }
    pub fn clear_calls(&self) {
        let mut st = self.lock();
        st.calls.clear();
        st.mutations = 0;
    }
    /// Fail the next call named `op` with `err`.
    pub fn fail_next(&self, op: &str, err: RemoteError) { self.lock().failures.insert(op.to_string(), err); }

    pub fn set_execution_start(&self, status: ExecutionStatus) { self.lock().execution_start = Some(status); }
    pub fn set_execution_status(&self, id: i64, status: ExecutionStatus) {
        if let Some(e) = self.lock().executions.get_mut(&id) {
            e.status = status;
        }
    }
    pub fn executions(&self) -> Vec<RemoteExecution> { self.lock().executions.values().cloned().collect() }

    pub fn registry_by_name(&self, name: &str) -> Option<RemoteRegistry> {
        self.lock().registries.values().find(|r| r.name == name).cloned()
    }
    /// Edit a registry out of band, as an operator would in the UI.
    pub fn mutate_registry(&self, name: &str, f: impl FnOnce(&mut RemoteRegistry)) {
        if let Some(r) = self.lock().registries.values_mut().find(|r| r.name == name) {
            f(r);
        }
    }
    pub fn project(&self, name: &str) -> Option<RemoteProject> { self.lock().projects.get(name).cloned() }
    pub fn members(&self, project: &str) -> Vec<RemoteMember> {
        self.lock().members.get(project).cloned().unwrap_or_default()
    }
    pub fn replication_by_name(&self, name: &str) -> Option<RemoteReplication> {
        self.lock().replications.values().find(|r| r.name == name).cloned()
    }
    pub fn retention(&self, id: i64) -> Option<RemoteRetention> { self.lock().retentions.get(&id).cloned() }
    pub fn retention_count(&self) -> usize { self.lock().retentions.len() }
    pub fn user_by_name(&self, username: &str) -> Option<RemoteUser> {
        self.lock().users.values().find(|u| u.username == username).cloned()
    }
    pub fn password_of(&self, username: &str) -> Option<String> {
        let st = self.lock();
        let id = st.users.values().find(|u| u.username == username)?.id;
        st.passwords.get(&id).cloned()
    }
}

#[async_trait::async_trait]
impl RegistryApi for MockRegistry {
    async fn health(&self) -> RemoteResult<bool> { Ok(self.enter("health", false)?.healthy) }

    async fn get_registry(&self, name: &str) -> RemoteResult<Option<RemoteRegistry>> {
        Ok(self.enter("get_registry", false)?.registries.values().find(|r| r.name == name).cloned())
    }

    async fn create_registry(&self, want: &RemoteRegistry) -> RemoteResult<i64> {
        let mut st = self.enter("create_registry", true)?;
        if st.registries.values().any(|r| r.name == want.name) {
            return Err(RemoteError::Conflict(format!("registry {}", want.name)));
        }
        let id = st.id();
        let mut held = want.clone();
        held.id = id;
        if let Some(c) = held.credential.as_mut() {
            c.access_secret = String::new();
        }
        st.registries.insert(id, held);
        Ok(id)
    }

    async fn update_registry(&self, want: &RemoteRegistry) -> RemoteResult<()> {
        let mut st = self.enter("update_registry", true)?;
        let slot = st.registries.get_mut(&want.id).ok_or_else(|| RemoteError::NotFound(format!("registry #{}", want.id)))?;
        *slot = want.clone();
        if let Some(c) = slot.credential.as_mut() {
            c.access_secret = String::new();
        }
        Ok(())
    }

    async fn delete_registry(&self, id: i64) -> RemoteResult<()> {
        let mut st = self.enter("delete_registry", true)?;
        st.registries.remove(&id).map(|_| ()).ok_or_else(|| RemoteError::NotFound(format!("registry #{}", id)))
    }

    async fn get_project(&self, name: &str) -> RemoteResult<Option<RemoteProject>> {
        Ok(self.enter("get_project", false)?.projects.get(name).cloned())
    }

    async fn create_project(&self, want: &RemoteProject) -> RemoteResult<i64> {
        let mut st = self.enter("create_project", true)?;
        if st.projects.contains_key(&want.name) {
            return Err(RemoteError::Conflict(format!("project {}", want.name)));
        }
        let id = st.id();
        let mut held = want.clone();
        held.id = id;
        held.retention_id = None;
        st.projects.insert(want.name.clone(), held);
        st.members.insert(want.name.clone(), Vec::new());
        Ok(id)
    }

    async fn update_project(&self, want: &RemoteProject) -> RemoteResult<()> {
        let mut st = self.enter("update_project", true)?;
        let slot = st.projects.get_mut(&want.name).ok_or_else(|| RemoteError::NotFound(format!("project {}", want.name)))?;
        let retention_id = slot.retention_id;
        *slot = want.clone();
        slot.retention_id = retention_id;
        Ok(())
    }

    async fn delete_project(&self, name: &str) -> RemoteResult<()> {
        let mut st = self.enter("delete_project", true)?;
        st.members.remove(name);
        st.projects.remove(name).map(|_| ()).ok_or_else(|| RemoteError::NotFound(format!("project {}", name)))
    }

    async fn list_members(&self, project: &str) -> RemoteResult<Vec<RemoteMember>> {
        let st = self.enter("list_members", false)?;
        st.members.get(project).cloned().ok_or_else(|| RemoteError::NotFound(format!("project {}", project)))
    }

    async fn add_member(&self, project: &str, username: &str, role_id: i64) -> RemoteResult<()> {
        let mut st = self.enter("add_member", true)?;
        if !st.users.values().any(|u| u.username == username) {
            return Err(RemoteError::NotFound(format!("user {}", username)));
        }
        let id = st.id();
        let list = st.members.get_mut(project).ok_or_else(|| RemoteError::NotFound(format!("project {}", project)))?;
        if list.iter().any(|m| m.username == username) {
            return Err(RemoteError::Conflict(format!("member {}", username)));
        }
        list.push(RemoteMember { id, username: username.to_string(), role_id });
        Ok(())
    }

    async fn update_member(&self, project: &str, member_id: i64, role_id: i64) -> RemoteResult<()> {
        let mut st = self.enter("update_member", true)?;
        let m = st
            .members
            .get_mut(project)
            .and_then(|l| l.iter_mut().find(|m| m.id == member_id))
            .ok_or_else(|| RemoteError::NotFound(format!("member #{}", member_id)))?;
        m.role_id = role_id;
        Ok(())
    }

    async fn remove_member(&self, project: &str, member_id: i64) -> RemoteResult<()> {
        let mut st = self.enter("remove_member", true)?;
        let list = st.members.get_mut(project).ok_or_else(|| RemoteError::NotFound(format!("project {}", project)))?;
        let before = list.len();
        list.retain(|m| m.id != member_id);
        if list.len() == before {
            return Err(RemoteError::NotFound(format!("member #{}", member_id)));
        }
        Ok(())
    }

    async fn get_replication(&self, name: &str) -> RemoteResult<Option<RemoteReplication>> {
        Ok(self.enter("get_replication", false)?.replications.values().find(|r| r.name == name).cloned())
    }

    async fn create_replication(&self, want: &RemoteReplication) -> RemoteResult<i64> {
        let mut st = self.enter("create_replication", true)?;
        if st.replications.values().any(|r| r.name == want.name) {
            return Err(RemoteError::Conflict(format!("replication {}", want.name)));
        }
        for rid in [want.src_registry_id, want.dest_registry_id].into_iter().flatten() {
            if !st.registries.contains_key(&rid) {
                return Err(RemoteError::Rejected { status: 400, message: format!("registry #{} not found", rid) });
            }
        }
        let id = st.id();
        let mut held = want.clone();
        held.id = id;
        st.replications.insert(id, held);
        Ok(id)
    }

    async fn update_replication(&self, want: &RemoteReplication) -> RemoteResult<()> {
        let mut st = self.enter("update_replication", true)?;
        let slot = st
            .replications
            .get_mut(&want.id)
            .ok_or_else(|| RemoteError::NotFound(format!("replication #{}", want.id)))?;
        *slot = want.clone();
        Ok(())
    }

    async fn delete_replication(&self, id: i64) -> RemoteResult<()> {
        let mut st = self.enter("delete_replication", true)?;
        st.replications.remove(&id).map(|_| ()).ok_or_else(|| RemoteError::NotFound(format!("replication #{}", id)))
    }

    async fn trigger_execution(&self, policy_id: i64) -> RemoteResult<i64> {
        let mut st = self.enter("trigger_execution", true)?;
        if !st.replications.contains_key(&policy_id) {
            return Err(RemoteError::NotFound(format!("replication #{}", policy_id)));
        }
        let id = st.id();
        let status = st.execution_start.unwrap_or(ExecutionStatus::InProgress);
        st.executions.insert(id, RemoteExecution { id, status });
        Ok(id)
    }

    async fn get_execution(&self, id: i64) -> RemoteResult<RemoteExecution> {
        let st = self.enter("get_execution", false)?;
        st.executions.get(&id).cloned().ok_or_else(|| RemoteError::NotFound(format!("execution #{}", id)))
    }

    async fn get_retention(&self, id: i64) -> RemoteResult<Option<RemoteRetention>> {
        Ok(self.enter("get_retention", false)?.retentions.get(&id).cloned())
    }

    async fn create_retention(&self, want: &RemoteRetention) -> RemoteResult<i64> {
        let mut st = self.enter("create_retention", true)?;
        let project = st
            .projects
            .values()
            .find(|p| p.id == want.project_id)
            .map(|p| p.name.clone())
            .ok_or_else(|| RemoteError::Rejected { status: 400, message: format!("project #{} not found", want.project_id) })?;
        let id = st.id();
        let mut held = want.clone();
        held.id = id;
        st.retentions.insert(id, held);
        if let Some(p) = st.projects.get_mut(&project) {
            p.retention_id = Some(id);
        }
        Ok(id)
    }

    async fn update_retention(&self, want: &RemoteRetention) -> RemoteResult<()> {
        let mut st = self.enter("update_retention", true)?;
        let slot = st.retentions.get_mut(&want.id).ok_or_else(|| RemoteError::NotFound(format!("retention #{}", want.id)))?;
        *slot = want.clone();
        Ok(())
    }

    async fn delete_retention(&self, id: i64) -> RemoteResult<()> {
        let mut st = self.enter("delete_retention", true)?;
        st.retentions.remove(&id).ok_or_else(|| RemoteError::NotFound(format!("retention #{}", id)))?;
        for p in st.projects.values_mut() {
            if p.retention_id == Some(id) {
                p.retention_id = None;
            }
        }
        Ok(())
    }

    async fn get_user(&self, username: &str) -> RemoteResult<Option<RemoteUser>> {
        Ok(self.enter("get_user", false)?.users.values().find(|u| u.username == username).cloned())
    }

    async fn create_user(&self, want: &RemoteUser, password: &str) -> RemoteResult<i64> {
        let mut st = self.enter("create_user", true)?;
        if st.users.values().any(|u| u.username == want.username) {
            return Err(RemoteError::Conflict(format!("user {}", want.username)));
        }
        let id = st.id();
        let mut held = want.clone();
        held.id = id;
        // admin flag is only settable through the sysadmin endpoint
        held.admin = false;
        st.users.insert(id, held);
        st.passwords.insert(id, password.to_string());
        Ok(id)
    }

    async fn update_user_profile(&self, want: &RemoteUser) -> RemoteResult<()> {
        let mut st = self.enter("update_user_profile", true)?;
        let u = st.users.get_mut(&want.id).ok_or_else(|| RemoteError::NotFound(format!("user #{}", want.id)))?;
        u.email = want.email.clone();
        u.realname = want.realname.clone();
        u.comment = want.comment.clone();
        Ok(())
    }

    async fn set_user_admin(&self, id: i64, admin: bool) -> RemoteResult<()> {
        let mut st = self.enter("set_user_admin", true)?;
        let u = st.users.get_mut(&id).ok_or_else(|| RemoteError::NotFound(format!("user #{}", id)))?;
        u.admin = admin;
        Ok(())
    }

    async fn set_user_password(&self, id: i64, password: &str) -> RemoteResult<()> {
        let mut st = self.enter("set_user_password", true)?;
        if !st.users.contains_key(&id) {
            return Err(RemoteError::NotFound(format!("user #{}", id)));
        }
        st.passwords.insert(id, password.to_string());
        Ok(())
    }

    async fn delete_user(&self, id: i64) -> RemoteResult<()> {
        let mut st = self.enter("delete_user", true)?;
        let u = st.users.remove(&id).ok_or_else(|| RemoteError::NotFound(format!("user #{}", id)))?;
        st.passwords.remove(&id);
        for list in st.members.values_mut() {
            list.retain(|m| m.username != u.username);
        }
        Ok(())
    }
}

/// Connector handing out one shared `MockRegistry` per instance URL.
#[derive(Clone, Default)]
pub struct MockConnector {
    by_url: Arc<Mutex<HashMap<String, MockRegistry>>>,
}

impl MockConnector {
    pub fn new() -> Self { Self::default() }

    /// The fake behind `url`, created on first use.
    pub fn registry(&self, url: &str) -> MockRegistry {
        let mut map = match self.by_url.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(url.trim_end_matches('/').to_string()).or_default().clone()
    }
}

impl RegistryConnector for MockConnector {
    fn connect(&self, endpoint: &RegistryEndpoint) -> RemoteResult<Arc<dyn RegistryApi>> {
        Ok(Arc::new(self.registry(&endpoint.url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_assigns_ids_and_hides_secrets() {
        let m = MockRegistry::new();
        let want = RemoteRegistry {
            name: "hub".into(),
            registry_type: "docker-hub".into(),
            url: "https://hub.docker.com".into(),
            credential: Some(crate::RemoteCredential {
                credential_type: "basic".into(),
                access_key: "k".into(),
                access_secret: "s".into(),
            }),
            ..Default::default()
        };
        let id = m.create_registry(&want).await.unwrap();
        let held = m.get_registry("hub").await.unwrap().unwrap();
        assert_eq!(held.id, id);
        assert_eq!(held.credential.unwrap().access_secret, "");
        assert!(matches!(m.create_registry(&want).await, Err(RemoteError::Conflict(_))));
        assert_eq!(m.mutations(), 1);
    }

    #[tokio::test]
    async fn queued_failure_fires_once() {
        let m = MockRegistry::new();
        m.fail_next("health", RemoteError::Transient("down".into()));
        assert!(m.health().await.is_err());
        assert!(m.health().await.unwrap());
    }

    #[tokio::test]
    async fn retention_binds_to_project() {
        let m = MockRegistry::new();
        let pid = m.create_project(&RemoteProject { name: "p".into(), ..Default::default() }).await.unwrap();
        let rid = m
            .create_retention(&RemoteRetention { project_id: pid, algorithm: "or".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(m.project("p").unwrap().retention_id, Some(rid));
        m.delete_retention(rid).await.unwrap();
        assert_eq!(m.project("p").unwrap().retention_id, None);
    }

    #[tokio::test]
    async fn connector_shares_state_per_url() {
        let c = MockConnector::new();
        let ep = RegistryEndpoint { url: "https://h/".into(), username: "admin".into(), password: "p".into() };
        let api = c.connect(&ep).unwrap();
        api.create_project(&RemoteProject { name: "x".into(), ..Default::default() }).await.unwrap();
        assert!(c.registry("https://h").project("x").is_some());
    }
}
