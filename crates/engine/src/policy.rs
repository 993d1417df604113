//! Per-kind policy table: phase graph, resting phase, finalizer dependents,
//! exclusive resources, and the step/teardown handlers.

use std::time::Duration;

use async_trait::async_trait;
use berth_core::prelude::*;

use crate::kinds;
use crate::Context;

/// Named resource serializing every run of the kinds that touch the local
/// helm repository cache.
pub const HELM_REPOSITORY_CACHE: &str = "helm-repository-cache";

/// Result of one policy step: the phase to move to and when to run again.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub to: Phase,
    pub action: Action,
    pub message: String,
}

impl Step {
    pub fn new(to: Phase, action: Action, message: impl Into<String>) -> Self {
        Self { to, action, message: message.into() }
    }
    pub fn now(to: Phase, message: impl Into<String>) -> Self { Self::new(to, Action::RequeueNow, message) }
    pub fn after(to: Phase, d: Duration, message: impl Into<String>) -> Self {
        Self::new(to, Action::RequeueAfter(d), message)
    }
}

#[async_trait]
pub trait KindPolicy: Send + Sync {
    fn kind(&self) -> Kind;

    /// Phase a converged record rests in; children gate on it.
    fn settled(&self) -> Phase { Phase::Ready }

    /// Allowed `(from, to)` moves besides staying put and entering Terminating.
    fn edges(&self) -> &'static [(Phase, Phase)];

    fn exclusive(&self) -> Option<&'static str> { None }

    /// Kinds whose records may reference this one and so hold back its deletion.
    fn dependents(&self) -> &'static [Kind] { &[] }

    /// Liveness of the remote system behind a record, checked before children proceed.
    async fn probe(&self, _ctx: &Context, _rec: &Record) -> EngineResult<bool> { Ok(true) }

    /// Advance `rec` one step. Remote identifiers and hashes are stored on `rec.status`;
    /// the phase change is applied by the caller from the returned `Step`.
    async fn step(&self, ctx: &Context, rec: &mut Record, parent: Option<&Record>) -> EngineResult<Step>;

    /// Remove the remote counterpart. Remote "not found" is success.
    async fn teardown(&self, ctx: &Context, rec: &Record, parent: Option<&Record>) -> EngineResult<()>;
}

static INSTANCE: kinds::instance::InstancePolicy = kinds::instance::InstancePolicy;
static CHART_REPOSITORY: kinds::chart_repository::ChartRepositoryPolicy = kinds::chart_repository::ChartRepositoryPolicy;
static REGISTRY: kinds::registry::RegistryPolicy = kinds::registry::RegistryPolicy;
static PROJECT: kinds::project::ProjectPolicy = kinds::project::ProjectPolicy;
static REPLICATION: kinds::replication::ReplicationPolicy = kinds::replication::ReplicationPolicy;
static RETENTION: kinds::retention::RetentionPolicy = kinds::retention::RetentionPolicy;
static USER: kinds::user::UserPolicy = kinds::user::UserPolicy;

pub fn policy_for(kind: Kind) -> &'static dyn KindPolicy {
    match kind {
        Kind::Instance => &INSTANCE,
        Kind::ChartRepository => &CHART_REPOSITORY,
        Kind::Registry => &REGISTRY,
        Kind::Project => &PROJECT,
        Kind::Replication => &REPLICATION,
        Kind::Retention => &RETENTION,
        Kind::User => &USER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_every_kind() {
        for k in Kind::ALL {
            assert_eq!(policy_for(k).kind(), k);
        }
    }

    #[test]
    fn only_cache_users_are_exclusive() {
        let exclusive: Vec<Kind> = Kind::ALL.into_iter().filter(|k| policy_for(*k).exclusive().is_some()).collect();
        assert_eq!(exclusive, vec![Kind::ChartRepository, Kind::User]);
    }

    #[test]
    fn instance_deletion_waits_for_every_child_kind() {
        let deps = policy_for(Kind::Instance).dependents();
        for k in [Kind::Registry, Kind::Project, Kind::Replication, Kind::Retention, Kind::User] {
            assert!(deps.contains(&k), "{} missing", k);
        }
        assert_eq!(policy_for(Kind::Registry).dependents(), &[Kind::Replication]);
        assert_eq!(policy_for(Kind::Project).dependents(), &[Kind::Retention]);
        assert_eq!(policy_for(Kind::User).dependents(), &[Kind::Project]);
    }
}
