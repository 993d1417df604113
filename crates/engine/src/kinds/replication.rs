//! Replication policies and their one-shot executions.

use std::sync::Arc;

use async_trait::async_trait;
use berth_api::{ExecutionStatus, RegistryApi, RemoteFilter, RemoteReplication, RemoteTrigger};
use berth_core::prelude::*;
use berth_core::ReplicationSpec;
use tracing::info;

use super::{gone_ok, parent_of, sibling_id, wrong_spec};
use crate::policy::{KindPolicy, Step};
use crate::upsert::{ensure, Upsert};
use crate::Context;

pub struct ReplicationPolicy;

struct ReplicationUpsert<'a> {
    api: Arc<dyn RegistryApi>,
    name: &'a str,
    spec: &'a ReplicationSpec,
    src_registry_id: Option<i64>,
    dest_registry_id: Option<i64>,
}

#[async_trait]
impl Upsert for ReplicationUpsert<'_> {
    type Remote = RemoteReplication;

    fn key(&self) -> String { format!("replication {}", self.name) }

    async fn fetch(&self) -> EngineResult<Option<RemoteReplication>> { Ok(self.api.get_replication(self.name).await?) }

    fn desired(&self, held: Option<&RemoteReplication>) -> RemoteReplication {
        let s = self.spec;
        let trigger = s.trigger.clone().unwrap_or_default();
        RemoteReplication {
            id: held.map(|h| h.id).unwrap_or_default(),
            name: self.name.to_string(),
            description: s.description.clone().unwrap_or_default(),
            src_registry_id: self.src_registry_id,
            dest_registry_id: self.dest_registry_id,
            dest_namespace: s.dest_namespace.clone().unwrap_or_default(),
            filters: s
                .filters
                .iter()
                .map(|f| RemoteFilter { filter_type: f.filter_type.clone(), value: f.value.clone() })
                .collect(),
            trigger: RemoteTrigger {
                trigger_type: trigger.trigger_type.as_str().to_string(),
                cron: trigger.cron.unwrap_or_default(),
            },
            deletion: s.deletion.unwrap_or(false),
            override_existing: s.override_existing.unwrap_or(false),
            enabled: s.enabled.unwrap_or(true),
        }
    }

    async fn create(&self, want: &RemoteReplication) -> EngineResult<i64> { Ok(self.api.create_replication(want).await?) }

    async fn update(&self, want: &RemoteReplication) -> EngineResult<()> { Ok(self.api.update_replication(want).await?) }

    fn id_of(&self, held: &RemoteReplication) -> i64 { held.id }
}

async fn converge(ctx: &Context, rec: &Record, api: Arc<dyn RegistryApi>) -> EngineResult<i64> {
    let Spec::Replication(spec) = &rec.spec else { return Err(wrong_spec(rec)) };
    let src_registry_id = match &spec.src_registry {
        Some(n) => Some(sibling_id(ctx, rec, Kind::Registry, n).await?),
        None => None,
    };
    let dest_registry_id = match &spec.dest_registry {
        Some(n) => Some(sibling_id(ctx, rec, Kind::Registry, n).await?),
        None => None,
    };
    let up = ReplicationUpsert { api, name: rec.name(), spec, src_registry_id, dest_registry_id };
    Ok(ensure(&up, false).await?.id)
}

fn trigger_after_creation(rec: &Record) -> bool {
    matches!(&rec.spec, Spec::Replication(s) if s.trigger_after_creation.unwrap_or(false))
}

#[async_trait]
impl KindPolicy for ReplicationPolicy {
    fn kind(&self) -> Kind { Kind::Replication }

    fn settled(&self) -> Phase { Phase::Completed }

    fn edges(&self) -> &'static [(Phase, Phase)] {
        &[
            (Phase::Unknown, Phase::Creating),
            (Phase::Creating, Phase::Completed),
            (Phase::Creating, Phase::ExecutionRunning),
            (Phase::ExecutionRunning, Phase::ExecutionFinished),
            (Phase::ExecutionRunning, Phase::ExecutionFailed),
            (Phase::ExecutionFinished, Phase::Completed),
            (Phase::ExecutionFailed, Phase::Creating),
            (Phase::Completed, Phase::Creating),
        ]
    }

    async fn step(&self, ctx: &Context, rec: &mut Record, parent: Option<&Record>) -> EngineResult<Step> {
        let api = ctx.client_for(parent_of(rec, parent)?).await?;
        let cfg = &ctx.config;
        match rec.status.phase {
            Phase::ExecutionRunning => {
                let Some(exec_id) = rec.status.execution_id else {
                    return Ok(Step::now(Phase::ExecutionFailed, "execution id lost"));
                };
                let exec = api.get_execution(exec_id).await?;
                Ok(match exec.status {
                    ExecutionStatus::InProgress => Step::after(Phase::ExecutionRunning, cfg.execution_poll, "execution running"),
                    ExecutionStatus::Succeed => Step::now(Phase::ExecutionFinished, "execution finished"),
                    ExecutionStatus::Failed | ExecutionStatus::Stopped => {
                        Step::now(Phase::ExecutionFailed, format!("execution {} ended as {:?}", exec_id, exec.status))
                    }
                })
            }
            Phase::ExecutionFailed => {
                rec.status.execution_id = None;
                Ok(Step::after(Phase::Creating, cfg.error_retry, "retrying after failed execution"))
            }
            Phase::ExecutionFinished => {
                rec.status.external_id = Some(converge(ctx, rec, api).await?);
                Ok(Step::after(Phase::Completed, cfg.resync, "replication in sync"))
            }
            Phase::Completed => {
                let spec_changed = rec.status.observed_generation != rec.metadata.generation;
                if spec_changed && trigger_after_creation(rec) {
                    return Ok(Step::now(Phase::Creating, "configuration changed"));
                }
                rec.status.external_id = Some(converge(ctx, rec, api).await?);
                Ok(Step::after(Phase::Completed, cfg.resync, "replication in sync"))
            }
            _ => {
                let id = converge(ctx, rec, api.clone()).await?;
                rec.status.external_id = Some(id);
                if !trigger_after_creation(rec) {
                    return Ok(Step::after(Phase::Completed, cfg.resync, "replication in sync"));
                }
                let exec_id = api.trigger_execution(id).await?;
                info!(replication = %rec.name(), execution = exec_id, "execution triggered");
                rec.status.execution_id = Some(exec_id);
                Ok(Step::after(Phase::ExecutionRunning, cfg.execution_poll, "execution running"))
            }
        }
    }

    async fn teardown(&self, ctx: &Context, rec: &Record, parent: Option<&Record>) -> EngineResult<()> {
        let api = ctx.client_for(parent_of(rec, parent)?).await?;
        let id = match rec.status.external_id {
            Some(id) => id,
            None => match api.get_replication(rec.name()).await? {
                Some(held) => held.id,
                None => return Ok(()),
            },
        };
        gone_ok(api.delete_replication(id).await)
    }
}
