//! Desired-state payloads per kind, validation and cross-record references.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{EngineError, EngineResult, Kind};

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*$").expect("static regex"));

/// Reference to one key of a secret in the record's namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Kind-specific desired configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Spec {
    Instance(InstanceSpec),
    ChartRepository(ChartRepositorySpec),
    Registry(RegistrySpec),
    Project(ProjectSpec),
    Replication(ReplicationSpec),
    Retention(RetentionSpec),
    User(UserSpec),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Base URL the deployed registry platform answers on.
    pub instance_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_user: Option<String>,
    pub admin_secret: SecretKeyRef,
    pub chart: ChartSpec,
}

impl InstanceSpec {
    pub fn admin_user(&self) -> &str { self.admin_user.as_deref().unwrap_or("admin") }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    /// Chart repository entry name (usually a ChartRepository record).
    pub repository: String,
    /// Registers `repository` inline when no ChartRepository record manages it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    pub chart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub values: serde_json::Value,
    /// YAML documents deep-merged over `values`, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_from: Vec<SecretKeyRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartRepositorySpec {
    pub url: String,
    /// Secret carrying `username` and `password` keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    pub parent: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub registry_type: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<RegistryCredentialSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCredentialSpec {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,
    /// Secret carrying `access_key` and `access_secret` keys.
    pub secret: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum MemberRole {
    ProjectAdmin,
    Developer,
    Guest,
    Maintainer,
    LimitedGuest,
}

impl MemberRole {
    /// Numeric role id used by the registry platform.
    pub fn role_id(&self) -> i64 {
        match self {
            MemberRole::ProjectAdmin => 1,
            MemberRole::Developer => 2,
            MemberRole::Guest => 3,
            MemberRole::Maintainer => 4,
            MemberRole::LimitedGuest => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberSpec {
    /// Name of a User record.
    pub user: String,
    pub role: MemberRole,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    pub parent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_scan: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prevent_vulnerable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<MemberSpec>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Scheduled,
    EventBased,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
            TriggerType::EventBased => "event_based",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    #[serde(default, rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    #[serde(rename = "type")]
    pub filter_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSpec {
    pub parent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Registry record to pull from. Mutually exclusive with `dest_registry`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_registry: Option<String>,
    /// Registry record to push to. Mutually exclusive with `src_registry`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion: Option<bool>,
    #[serde(default, rename = "override", skip_serializing_if = "Option::is_none")]
    pub override_existing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_after_creation: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorSpec {
    /// e.g. `doublestar`
    pub kind: String,
    /// e.g. `matches` / `excludes`
    pub decoration: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionRuleSpec {
    pub template: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_selectors: Vec<SelectorSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repository_selectors: Vec<SelectorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionSpec {
    pub parent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub rules: Vec<RetentionRuleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Project records the policy is applied to.
    #[serde(default)]
    pub projects: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    pub parent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub email: String,
    #[serde(default)]
    pub realname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<bool>,
    pub password_secret: SecretKeyRef,
}

fn invalid<T>(msg: impl Into<String>) -> EngineResult<T> { Err(EngineError::Validation(msg.into())) }

fn require(field: &str, v: &str) -> EngineResult<()> {
    if v.trim().is_empty() { return invalid(format!("{} must not be empty", field)); }
    Ok(())
}

fn require_url(field: &str, v: &str) -> EngineResult<()> {
    require(field, v)?;
    if !(v.starts_with("http://") || v.starts_with("https://")) {
        return invalid(format!("{} must be an http(s) URL, got {:?}", field, v));
    }
    Ok(())
}

impl Spec {
    pub fn kind(&self) -> Kind {
        match self {
            Spec::Instance(_) => Kind::Instance,
            Spec::ChartRepository(_) => Kind::ChartRepository,
            Spec::Registry(_) => Kind::Registry,
            Spec::Project(_) => Kind::Project,
            Spec::Replication(_) => Kind::Replication,
            Spec::Retention(_) => Kind::Retention,
            Spec::User(_) => Kind::User,
        }
    }

    pub fn from_json(kind: Kind, v: serde_json::Value) -> EngineResult<Self> {
        fn de<T: serde::de::DeserializeOwned>(kind: Kind, v: serde_json::Value) -> EngineResult<T> {
            serde_json::from_value(v).map_err(|e| EngineError::Validation(format!("{}: invalid spec: {}", kind, e)))
        }
        Ok(match kind {
            Kind::Instance => Spec::Instance(de(kind, v)?),
            Kind::ChartRepository => Spec::ChartRepository(de(kind, v)?),
            Kind::Registry => Spec::Registry(de(kind, v)?),
            Kind::Project => Spec::Project(de(kind, v)?),
            Kind::Replication => Spec::Replication(de(kind, v)?),
            Kind::Retention => Spec::Retention(de(kind, v)?),
            Kind::User => Spec::User(de(kind, v)?),
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        let v = match self {
            Spec::Instance(s) => serde_json::to_value(s),
            Spec::ChartRepository(s) => serde_json::to_value(s),
            Spec::Registry(s) => serde_json::to_value(s),
            Spec::Project(s) => serde_json::to_value(s),
            Spec::Replication(s) => serde_json::to_value(s),
            Spec::Retention(s) => serde_json::to_value(s),
            Spec::User(s) => serde_json::to_value(s),
        };
        v.unwrap_or(serde_json::Value::Null)
    }

    /// Name of the parent Instance record.
    pub fn parent(&self) -> Option<&str> {
        match self {
            Spec::Instance(_) | Spec::ChartRepository(_) => None,
            Spec::Registry(s) => Some(&s.parent),
            Spec::Project(s) => Some(&s.parent),
            Spec::Replication(s) => Some(&s.parent),
            Spec::Retention(s) => Some(&s.parent),
            Spec::User(s) => Some(&s.parent),
        }
    }

    /// Non-parent records referenced by name.
    pub fn sibling_refs(&self) -> Vec<(Kind, String)> {
        match self {
            Spec::Replication(s) => s
                .src_registry
                .iter()
                .chain(s.dest_registry.iter())
                .map(|n| (Kind::Registry, n.clone()))
                .collect(),
            Spec::Retention(s) => s.projects.iter().map(|p| (Kind::Project, p.clone())).collect(),
            Spec::Project(s) => s.members.iter().map(|m| (Kind::User, m.user.clone())).collect(),
            _ => Vec::new(),
        }
    }

    /// Static checks on the desired configuration. `name` is the record name.
    pub fn validate(&self, name: &str) -> EngineResult<()> {
        if let Some(p) = self.parent() { require("parent", p)?; }
        match self {
            Spec::Instance(s) => {
                require_url("instanceUrl", &s.instance_url)?;
                require("adminSecret.name", &s.admin_secret.name)?;
                require("adminSecret.key", &s.admin_secret.key)?;
                require("chart.repository", &s.chart.repository)?;
                require("chart.chart", &s.chart.chart)?;
                if !(s.chart.values.is_null() || s.chart.values.is_object()) {
                    return invalid("chart.values must be an object");
                }
            }
            Spec::ChartRepository(s) => require_url("url", &s.url)?,
            Spec::Registry(s) => {
                require_url("url", &s.url)?;
                if let Some(c) = &s.credential { require("credential.secret", &c.secret)?; }
            }
            Spec::Project(s) => {
                if !NAME_RE.is_match(name) {
                    return invalid(format!("project name {:?} must be lowercase alphanumerics separated by . _ -", name));
                }
                let mut seen = std::collections::BTreeSet::new();
                for m in &s.members {
                    if !seen.insert(m.user.as_str()) {
                        return invalid(format!("member {:?} listed more than once", m.user));
                    }
                }
            }
            Spec::Replication(s) => {
                match (&s.src_registry, &s.dest_registry) {
                    (Some(_), Some(_)) => return invalid("srcRegistry and destRegistry are mutually exclusive"),
                    (None, None) => return invalid("one of srcRegistry or destRegistry is required"),
                    _ => {}
                }
                if let Some(t) = &s.trigger {
                    if t.trigger_type == TriggerType::Scheduled && t.cron.as_deref().map_or(true, |c| c.trim().is_empty()) {
                        return invalid("scheduled trigger requires cron");
                    }
                }
            }
            Spec::Retention(s) => {
                if s.rules.is_empty() { return invalid("at least one retention rule is required"); }
                for r in &s.rules { require("rules[].template", &r.template)?; }
            }
            Spec::User(s) => {
                if !s.email.contains('@') { return invalid(format!("email {:?} is not an address", s.email)); }
                require("passwordSecret.name", &s.password_secret.name)?;
                require("passwordSecret.key", &s.password_secret.key)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_registries_are_mutually_exclusive() {
        let mut s = ReplicationSpec {
            parent: "inst1".into(),
            src_registry: Some("a".into()),
            dest_registry: Some("b".into()),
            ..Default::default()
        };
        let err = Spec::Replication(s.clone()).validate("rep").unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"), "{}", err);
        s.dest_registry = None;
        assert!(Spec::Replication(s.clone()).validate("rep").is_ok());
        s.src_registry = None;
        assert!(Spec::Replication(s).validate("rep").is_err());
    }

    #[test]
    fn scheduled_trigger_needs_cron() {
        let s = ReplicationSpec {
            parent: "inst1".into(),
            src_registry: Some("a".into()),
            trigger: Some(TriggerSpec { trigger_type: TriggerType::Scheduled, cron: None }),
            ..Default::default()
        };
        assert!(Spec::Replication(s).validate("rep").is_err());
    }

    #[test]
    fn project_names_are_checked() {
        let s = Spec::Project(ProjectSpec { parent: "inst1".into(), ..Default::default() });
        assert!(s.validate("team-a").is_ok());
        assert!(s.validate("Team_A").is_err());
    }

    #[test]
    fn sibling_refs_cover_registries_projects_and_members() {
        let rep = Spec::Replication(ReplicationSpec { dest_registry: Some("hub".into()), ..Default::default() });
        assert_eq!(rep.sibling_refs(), vec![(Kind::Registry, "hub".to_string())]);
        let ret = Spec::Retention(RetentionSpec { projects: vec!["p1".into(), "p2".into()], ..Default::default() });
        assert_eq!(ret.sibling_refs().len(), 2);
        let proj = Spec::Project(ProjectSpec {
            members: vec![MemberSpec { user: "alice".into(), role: MemberRole::Developer }],
            ..Default::default()
        });
        assert_eq!(proj.sibling_refs(), vec![(Kind::User, "alice".to_string())]);
    }

    #[test]
    fn spec_json_uses_camel_case_and_renames() {
        let v = serde_json::json!({"parent": "inst1", "url": "https://r", "type": "docker-hub", "insecure": true});
        let s = Spec::from_json(Kind::Registry, v).unwrap();
        let Spec::Registry(r) = &s else { panic!("wrong kind") };
        assert_eq!(r.registry_type.as_deref(), Some("docker-hub"));
        assert_eq!(s.to_json()["type"], "docker-hub");
    }
}
