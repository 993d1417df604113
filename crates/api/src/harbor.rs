//! Harbor v2.0 REST implementation of `RegistryApi`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    ExecutionStatus, RegistryApi, RegistryConnector, RegistryEndpoint, RemoteError, RemoteExecution, RemoteFilter,
    RemoteMember, RemoteProject, RemoteRegistry, RemoteReplication, RemoteResult, RemoteRetention,
    RemoteRetentionRule, RemoteSelector, RemoteTrigger, RemoteUser,
};

/// Connector sharing one HTTP connection pool across instances.
pub struct HarborConnector {
    http: reqwest::Client,
}

impl HarborConnector {
    pub fn new(timeout: Duration) -> RemoteResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transient(format!("building http client: {}", e)))?;
        Ok(Self { http })
    }
}

impl RegistryConnector for HarborConnector {
    fn connect(&self, endpoint: &RegistryEndpoint) -> RemoteResult<Arc<dyn RegistryApi>> {
        Ok(Arc::new(HarborClient::new(self.http.clone(), endpoint)))
    }
}

pub struct HarborClient {
    http: reqwest::Client,
    base: String,
    username: String,
    password: String,
}

// ---- wire shapes ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IdRef {
    id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireProjectMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auto_scan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prevent_vul: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retention_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireProject {
    #[serde(default)]
    project_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    project_name: String,
    #[serde(default)]
    metadata: WireProjectMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireMemberUser {
    username: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireMember {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    entity_name: String,
    #[serde(default)]
    entity_type: String,
    role_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    member_user: Option<WireMemberUser>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireTriggerSettings {
    #[serde(default)]
    cron: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireTrigger {
    #[serde(rename = "type")]
    trigger_type: String,
    #[serde(default)]
    trigger_settings: WireTriggerSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireReplication {
    #[serde(default)]
    id: i64,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    src_registry: Option<IdRef>,
    #[serde(default)]
    dest_registry: Option<IdRef>,
    #[serde(default)]
    dest_namespace: String,
    #[serde(default)]
    filters: Vec<RemoteFilter>,
    #[serde(default)]
    trigger: Option<WireTrigger>,
    #[serde(default)]
    deletion: bool,
    #[serde(default, rename = "override")]
    override_existing: bool,
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireScopeSelectors {
    #[serde(default)]
    repository: Vec<RemoteSelector>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireRetentionRule {
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    action: String,
    template: String,
    #[serde(default)]
    params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    tag_selectors: Vec<RemoteSelector>,
    #[serde(default)]
    scope_selectors: WireScopeSelectors,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireRetentionTrigger {
    kind: String,
    #[serde(default)]
    settings: WireTriggerSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireRetentionScope {
    level: String,
    #[serde(rename = "ref")]
    reference: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireRetention {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    algorithm: String,
    #[serde(default)]
    rules: Vec<WireRetentionRule>,
    #[serde(default)]
    trigger: Option<WireRetentionTrigger>,
    #[serde(default)]
    scope: Option<WireRetentionScope>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireUser {
    #[serde(default)]
    user_id: i64,
    #[serde(default)]
    username: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    realname: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    sysadmin_flag: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct WireExecution {
    id: i64,
    status: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WireHealth {
    status: String,
}

fn flag(b: bool) -> Option<String> { Some(if b { "true" } else { "false" }.to_string()) }
fn parse_flag(s: &Option<String>) -> bool { s.as_deref() == Some("true") }

fn project_from_wire(w: WireProject) -> RemoteProject {
    RemoteProject {
        id: w.project_id,
        name: if w.name.is_empty() { w.project_name } else { w.name },
        public: parse_flag(&w.metadata.public),
        auto_scan: parse_flag(&w.metadata.auto_scan),
        prevent_vulnerable: parse_flag(&w.metadata.prevent_vul),
        severity: w.metadata.severity.unwrap_or_default(),
        retention_id: w.metadata.retention_id.and_then(|s| s.parse().ok()),
    }
}

fn project_to_wire(p: &RemoteProject, create: bool) -> WireProject {
    WireProject {
        project_id: 0,
        name: String::new(),
        project_name: if create { p.name.clone() } else { String::new() },
        metadata: WireProjectMetadata {
            public: flag(p.public),
            auto_scan: flag(p.auto_scan),
            prevent_vul: flag(p.prevent_vulnerable),
            severity: Some(p.severity.clone()),
            retention_id: None,
        },
    }
}

fn replication_from_wire(w: WireReplication) -> RemoteReplication {
    // id 0 denotes the local instance itself
    let non_local = |r: Option<IdRef>| r.map(|r| r.id).filter(|id| *id != 0);
    let trigger = w.trigger.unwrap_or_default();
    RemoteReplication {
        id: w.id,
        name: w.name,
        description: w.description,
        src_registry_id: non_local(w.src_registry),
        dest_registry_id: non_local(w.dest_registry),
        dest_namespace: w.dest_namespace,
        filters: w.filters,
        trigger: RemoteTrigger { trigger_type: trigger.trigger_type, cron: trigger.trigger_settings.cron },
        deletion: w.deletion,
        override_existing: w.override_existing,
        enabled: w.enabled,
    }
}

fn replication_to_wire(r: &RemoteReplication) -> WireReplication {
    WireReplication {
        id: r.id,
        name: r.name.clone(),
        description: r.description.clone(),
        src_registry: r.src_registry_id.map(|id| IdRef { id }),
        dest_registry: r.dest_registry_id.map(|id| IdRef { id }),
        dest_namespace: r.dest_namespace.clone(),
        filters: r.filters.clone(),
        trigger: Some(WireTrigger {
            trigger_type: r.trigger.trigger_type.clone(),
            trigger_settings: WireTriggerSettings { cron: r.trigger.cron.clone() },
        }),
        deletion: r.deletion,
        override_existing: r.override_existing,
        enabled: r.enabled,
    }
}

fn retention_from_wire(w: WireRetention) -> RemoteRetention {
    RemoteRetention {
        id: w.id,
        algorithm: w.algorithm,
        rules: w
            .rules
            .into_iter()
            .map(|r| RemoteRetentionRule {
                disabled: r.disabled,
                template: r.template,
                params: r.params,
                tag_selectors: r.tag_selectors,
                repository_selectors: r.scope_selectors.repository,
            })
            .collect(),
        cron: w.trigger.map(|t| t.settings.cron).unwrap_or_default(),
        project_id: w.scope.map(|s| s.reference).unwrap_or_default(),
    }
}

fn retention_to_wire(r: &RemoteRetention) -> WireRetention {
    WireRetention {
        id: r.id,
        algorithm: r.algorithm.clone(),
        rules: r
            .rules
            .iter()
            .map(|rule| WireRetentionRule {
                disabled: rule.disabled,
                action: "retain".into(),
                template: rule.template.clone(),
                params: rule.params.clone(),
                tag_selectors: rule.tag_selectors.clone(),
                scope_selectors: WireScopeSelectors { repository: rule.repository_selectors.clone() },
            })
            .collect(),
        trigger: Some(WireRetentionTrigger {
            kind: "Schedule".into(),
            settings: WireTriggerSettings { cron: r.cron.clone() },
        }),
        scope: Some(WireRetentionScope { level: "project".into(), reference: r.project_id }),
    }
}

fn user_from_wire(w: WireUser) -> RemoteUser {
    RemoteUser {
        id: w.user_id,
        username: w.username,
        email: w.email,
        realname: w.realname,
        comment: w.comment,
        admin: w.sysadmin_flag,
    }
}

fn execution_status(s: &str) -> RemoteResult<ExecutionStatus> {
    match s {
        "InProgress" | "Pending" | "Running" => Ok(ExecutionStatus::InProgress),
        "Succeed" | "Success" => Ok(ExecutionStatus::Succeed),
        "Failed" | "Error" => Ok(ExecutionStatus::Failed),
        "Stopped" => Ok(ExecutionStatus::Stopped),
        other => Err(RemoteError::Decode(format!("unknown execution status {:?}", other))),
    }
}

/// Map a non-success HTTP status to an error kind.
fn map_status(status: StatusCode, what: &str, body: String) -> RemoteError {
    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(what.to_string()),
        StatusCode::CONFLICT => RemoteError::Conflict(format!("{}: {}", what, body)),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Transient(format!("{}: rate limited", what)),
        s if s.is_server_error() => RemoteError::Transient(format!("{}: {} {}", what, s.as_u16(), body)),
        s => RemoteError::Rejected { status: s.as_u16(), message: format!("{}: {}", what, body) },
    }
}

/// Page size requested from list endpoints.
const PAGE_SIZE: usize = 100;
/// Hard stop for a single listing.
const MAX_PAGES: usize = 500;

/// Concatenate pages `1..` until a short one. `None` when the first page is absent.
async fn collect_pages<T, F, Fut>(mut fetch: F) -> RemoteResult<Option<Vec<T>>>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = RemoteResult<Option<Vec<T>>>>,
{
    let mut out = Vec::new();
    for page in 1..=MAX_PAGES {
        let Some(items) = fetch(page).await? else {
            return Ok((page > 1).then_some(out));
        };
        let short = items.len() < PAGE_SIZE;
        out.extend(items);
        if short {
            break;
        }
    }
    Ok(Some(out))
}

/// Trailing numeric segment of a `Location` header.
fn id_from_location(loc: &str) -> Option<i64> {
    loc.trim_end_matches('/').rsplit('/').next().and_then(|s| s.parse().ok())
}

impl HarborClient {
    pub fn new(http: reqwest::Client, endpoint: &RegistryEndpoint) -> Self {
        Self {
            http,
            base: format!("{}/api/v2.0", endpoint.url.trim_end_matches('/')),
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base, path))
            .basic_auth(&self.username, Some(&self.password))
            .header("X-Is-Resource-Name", "true")
    }

    async fn send(&self, op: &'static str, what: &str, req: reqwest::RequestBuilder) -> RemoteResult<reqwest::Response> {
        let t0 = Instant::now();
        counter!("remote_calls_total", 1u64, "op" => op);
        let resp = req.send().await.map_err(|e| RemoteError::Transient(format!("{}: {}", what, e)))?;
        histogram!("remote_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        let status = resp.status();
        debug!(op, status = status.as_u16(), took_ms = %t0.elapsed().as_millis(), "harbor: call");
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(map_status(status, what, body))
    }

    async fn get_opt<T: DeserializeOwned>(&self, op: &'static str, what: &str, req: reqwest::RequestBuilder) -> RemoteResult<Option<T>> {
        match self.send(op, what, req).await {
            Ok(resp) => resp.json::<T>().await.map(Some).map_err(|e| RemoteError::Decode(format!("{}: {}", what, e))),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn created_id(&self, op: &'static str, what: &str, req: reqwest::RequestBuilder) -> RemoteResult<i64> {
        let resp = self.send(op, what, req).await?;
        resp.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(id_from_location)
            .ok_or_else(|| RemoteError::Decode(format!("{}: created without a Location id", what)))
    }

    async fn no_content(&self, op: &'static str, what: &str, req: reqwest::RequestBuilder) -> RemoteResult<()> {
        self.send(op, what, req).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl RegistryApi for HarborClient {
    async fn health(&self) -> RemoteResult<bool> {
        let h: Option<WireHealth> = self.get_opt("health", "health", self.http.get(format!("{}/health", self.base))).await?;
        Ok(h.map(|h| h.status == "healthy").unwrap_or(false))
    }

    async fn get_registry(&self, name: &str) -> RemoteResult<Option<RemoteRegistry>> {
        let req = self.request(Method::GET, "/registries").query(&[("q", format!("name={}", name))]);
        let list: Option<Vec<RemoteRegistry>> = self.get_opt("registry_get", &format!("registry {}", name), req).await?;
        Ok(list.unwrap_or_default().into_iter().find(|r| r.name == name))
    }

    async fn create_registry(&self, want: &RemoteRegistry) -> RemoteResult<i64> {
        let req = self.request(Method::POST, "/registries").json(want);
        self.created_id("registry_create", &format!("registry {}", want.name), req).await
    }

    async fn update_registry(&self, want: &RemoteRegistry) -> RemoteResult<()> {
        let req = self.request(Method::PUT, &format!("/registries/{}", want.id)).json(want);
        self.no_content("registry_update", &format!("registry {}", want.name), req).await
    }

    async fn delete_registry(&self, id: i64) -> RemoteResult<()> {
        let req = self.request(Method::DELETE, &format!("/registries/{}", id));
        self.no_content("registry_delete", &format!("registry #{}", id), req).await
    }

    async fn get_project(&self, name: &str) -> RemoteResult<Option<RemoteProject>> {
        let req = self.request(Method::GET, &format!("/projects/{}", name));
        let w: Option<WireProject> = self.get_opt("project_get", &format!("project {}", name), req).await?;
        Ok(w.map(project_from_wire))
    }

    async fn create_project(&self, want: &RemoteProject) -> RemoteResult<i64> {
        let req = self.request(Method::POST, "/projects").json(&project_to_wire(want, true));
        self.created_id("project_create", &format!("project {}", want.name), req).await
    }

    async fn update_project(&self, want: &RemoteProject) -> RemoteResult<()> {
        let req = self.request(Method::PUT, &format!("/projects/{}", want.name)).json(&project_to_wire(want, false));
        self.no_content("project_update", &format!("project {}", want.name), req).await
    }

    async fn delete_project(&self, name: &str) -> RemoteResult<()> {
        let req = self.request(Method::DELETE, &format!("/projects/{}", name));
        self.no_content("project_delete", &format!("project {}", name), req).await
    }

    async fn list_members(&self, project: &str) -> RemoteResult<Vec<RemoteMember>> {
        let path = format!("/projects/{}/members", project);
        let what = format!("project {} members", project);
        let list: Option<Vec<WireMember>> = collect_pages(|page| {
            let req = self
                .request(Method::GET, &path)
                .query(&[("page", page.to_string()), ("page_size", PAGE_SIZE.to_string())]);
            let what = what.clone();
            async move { self.get_opt("member_list", &what, req).await }
        })
        .await?;
        match list {
            None => Err(RemoteError::NotFound(format!("project {}", project))),
            Some(l) => Ok(l
                .into_iter()
                .filter(|m| m.entity_type == "u")
                .map(|m| RemoteMember { id: m.id, username: m.entity_name, role_id: m.role_id })
                .collect()),
        }
    }

    async fn add_member(&self, project: &str, username: &str, role_id: i64) -> RemoteResult<()> {
        let body = WireMember {
            role_id,
            member_user: Some(WireMemberUser { username: username.to_string() }),
            ..Default::default()
        };
        let req = self.request(Method::POST, &format!("/projects/{}/members", project)).json(&body);
        self.no_content("member_add", &format!("project {} member {}", project, username), req).await
    }

    async fn update_member(&self, project: &str, member_id: i64, role_id: i64) -> RemoteResult<()> {
        let req = self
            .request(Method::PUT, &format!("/projects/{}/members/{}", project, member_id))
            .json(&serde_json::json!({ "role_id": role_id }));
        self.no_content("member_update", &format!("project {} member #{}", project, member_id), req).await
    }

    async fn remove_member(&self, project: &str, member_id: i64) -> RemoteResult<()> {
        let req = self.request(Method::DELETE, &format!("/projects/{}/members/{}", project, member_id));
        self.no_content("member_remove", &format!("project {} member #{}", project, member_id), req).await
    }

    async fn get_replication(&self, name: &str) -> RemoteResult<Option<RemoteReplication>> {
        let req = self.request(Method::GET, "/replication/policies").query(&[("name", name)]);
        let list: Option<Vec<WireReplication>> = self.get_opt("replication_get", &format!("replication {}", name), req).await?;
        Ok(list.unwrap_or_default().into_iter().find(|r| r.name == name).map(replication_from_wire))
    }

    async fn create_replication(&self, want: &RemoteReplication) -> RemoteResult<i64> {
        let req = self.request(Method::POST, "/replication/policies").json(&replication_to_wire(want));
        self.created_id("replication_create", &format!("replication {}", want.name), req).await
    }

    async fn update_replication(&self, want: &RemoteReplication) -> RemoteResult<()> {
        let req = self.request(Method::PUT, &format!("/replication/policies/{}", want.id)).json(&replication_to_wire(want));
        self.no_content("replication_update", &format!("replication {}", want.name), req).await
    }

    async fn delete_replication(&self, id: i64) -> RemoteResult<()> {
        let req = self.request(Method::DELETE, &format!("/replication/policies/{}", id));
        self.no_content("replication_delete", &format!("replication #{}", id), req).await
    }

    async fn trigger_execution(&self, policy_id: i64) -> RemoteResult<i64> {
        let req = self
            .request(Method::POST, "/replication/executions")
            .json(&serde_json::json!({ "policy_id": policy_id }));
        self.created_id("execution_trigger", &format!("replication #{} execution", policy_id), req).await
    }

    async fn get_execution(&self, id: i64) -> RemoteResult<RemoteExecution> {
        let what = format!("execution #{}", id);
        let req = self.request(Method::GET, &format!("/replication/executions/{}", id));
        let w: Option<WireExecution> = self.get_opt("execution_get", &what, req).await?;
        let w = w.ok_or(RemoteError::NotFound(what))?;
        Ok(RemoteExecution { id: w.id, status: execution_status(&w.status)? })
    }

    async fn get_retention(&self, id: i64) -> RemoteResult<Option<RemoteRetention>> {
        let req = self.request(Method::GET, &format!("/retentions/{}", id));
        let w: Option<WireRetention> = self.get_opt("retention_get", &format!("retention #{}", id), req).await?;
        Ok(w.map(retention_from_wire))
    }

    async fn create_retention(&self, want: &RemoteRetention) -> RemoteResult<i64> {
        let req = self.request(Method::POST, "/retentions").json(&retention_to_wire(want));
        self.created_id("retention_create", &format!("retention for project #{}", want.project_id), req).await
    }

    async fn update_retention(&self, want: &RemoteRetention) -> RemoteResult<()> {
        let req = self.request(Method::PUT, &format!("/retentions/{}", want.id)).json(&retention_to_wire(want));
        self.no_content("retention_update", &format!("retention #{}", want.id), req).await
    }

    async fn delete_retention(&self, id: i64) -> RemoteResult<()> {
        let req = self.request(Method::DELETE, &format!("/retentions/{}", id));
        self.no_content("retention_delete", &format!("retention #{}", id), req).await
    }

    async fn get_user(&self, username: &str) -> RemoteResult<Option<RemoteUser>> {
        let what = format!("user {}", username);
        let req = self.request(Method::GET, "/users/search").query(&[("username", username)]);
        let hits: Option<Vec<WireUser>> = self.get_opt("user_search", &what, req).await?;
        // search is a substring match
        let Some(hit) = hits.unwrap_or_default().into_iter().find(|u| u.username == username) else { return Ok(None) };
        let req = self.request(Method::GET, &format!("/users/{}", hit.user_id));
        let full: Option<WireUser> = self.get_opt("user_get", &what, req).await?;
        Ok(full.map(user_from_wire))
    }

    async fn create_user(&self, want: &RemoteUser, password: &str) -> RemoteResult<i64> {
        let body = serde_json::json!({
            "username": want.username,
            "email": want.email,
            "realname": want.realname,
            "comment": want.comment,
            "password": password,
        });
        let req = self.request(Method::POST, "/users").json(&body);
        self.created_id("user_create", &format!("user {}", want.username), req).await
    }

    async fn update_user_profile(&self, want: &RemoteUser) -> RemoteResult<()> {
        let body = serde_json::json!({ "email": want.email, "realname": want.realname, "comment": want.comment });
        let req = self.request(Method::PUT, &format!("/users/{}", want.id)).json(&body);
        self.no_content("user_update", &format!("user {}", want.username), req).await
    }

    async fn set_user_admin(&self, id: i64, admin: bool) -> RemoteResult<()> {
        let req = self
            .request(Method::PUT, &format!("/users/{}/sysadmin", id))
            .json(&serde_json::json!({ "sysadmin_flag": admin }));
        self.no_content("user_sysadmin", &format!("user #{}", id), req).await
    }

    async fn set_user_password(&self, id: i64, password: &str) -> RemoteResult<()> {
        let req = self
            .request(Method::PUT, &format!("/users/{}/password", id))
            .json(&serde_json::json!({ "new_password": password }));
        self.no_content("user_password", &format!("user #{}", id), req).await
    }

    async fn delete_user(&self, id: i64) -> RemoteResult<()> {
        let req = self.request(Method::DELETE, &format!("/users/{}", id));
        self.no_content("user_delete", &format!("user #{}", id), req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn paged(total: usize, absent: bool) -> (Option<Vec<usize>>, Vec<usize>) {
        let all: Vec<usize> = (0..total).collect();
        let mut asked = Vec::new();
        let got = collect_pages(|page| {
            asked.push(page);
            let chunk: Vec<usize> = all.iter().skip((page - 1) * PAGE_SIZE).take(PAGE_SIZE).copied().collect();
            async move { Ok(if absent { None } else { Some(chunk) }) }
        })
        .await
        .unwrap();
        (got, asked)
    }

    #[tokio::test]
    async fn listings_follow_pages_until_a_short_one() {
        let (got, asked) = paged(230, false).await;
        assert_eq!(got.unwrap().len(), 230);
        assert_eq!(asked, vec![1, 2, 3]);

        let (got, asked) = paged(200, false).await;
        assert_eq!(got.unwrap().len(), 200);
        assert_eq!(asked, vec![1, 2, 3]);

        let (got, asked) = paged(0, true).await;
        assert_eq!(got, None);
        assert_eq!(asked, vec![1]);
    }

    #[test]
    fn location_ids_are_parsed() {
        assert_eq!(id_from_location("/api/v2.0/registries/12"), Some(12));
        assert_eq!(id_from_location("/api/v2.0/retentions/7/"), Some(7));
        assert_eq!(id_from_location("/api/v2.0/projects/"), None);
    }

    #[test]
    fn status_codes_map_to_kinds() {
        assert!(matches!(map_status(StatusCode::NOT_FOUND, "x", String::new()), RemoteError::NotFound(_)));
        assert!(matches!(map_status(StatusCode::CONFLICT, "x", String::new()), RemoteError::Conflict(_)));
        assert!(matches!(map_status(StatusCode::BAD_GATEWAY, "x", String::new()), RemoteError::Transient(_)));
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN, "x", String::new()),
            RemoteError::Rejected { status: 403, .. }
        ));
    }

    #[test]
    fn project_metadata_uses_string_flags() {
        let wire: WireProject = serde_json::from_value(serde_json::json!({
            "project_id": 3,
            "name": "team-a",
            "metadata": { "public": "true", "auto_scan": "false", "retention_id": "9" }
        }))
        .unwrap();
        let p = project_from_wire(wire);
        assert_eq!(p.id, 3);
        assert!(p.public);
        assert!(!p.auto_scan);
        assert_eq!(p.retention_id, Some(9));
        let back = serde_json::to_value(project_to_wire(&p, true)).unwrap();
        assert_eq!(back["project_name"], "team-a");
        assert_eq!(back["metadata"]["public"], "true");
        assert!(back["metadata"].get("retention_id").is_none());
    }

    #[test]
    fn local_registry_id_zero_is_dropped() {
        let wire: WireReplication = serde_json::from_value(serde_json::json!({
            "id": 1, "name": "pull", "src_registry": {"id": 4}, "dest_registry": {"id": 0},
            "trigger": {"type": "scheduled", "trigger_settings": {"cron": "0 0 * * * *"}}
        }))
        .unwrap();
        let r = replication_from_wire(wire);
        assert_eq!(r.src_registry_id, Some(4));
        assert_eq!(r.dest_registry_id, None);
        assert_eq!(r.trigger.cron, "0 0 * * * *");
    }

    #[test]
    fn retention_scope_round_trips_project() {
        let r = RemoteRetention { id: 2, algorithm: "or".into(), cron: "0 0 0 * * *".into(), project_id: 5, rules: vec![] };
        let back = retention_from_wire(serde_json::from_value(serde_json::to_value(retention_to_wire(&r)).unwrap()).unwrap());
        assert_eq!(back, r);
    }
}
