//! Tag-retention policies applied to a set of projects.
//!
//! Every listed project gets its own remote policy. The children are only
//! committed to status once all of them converged; the first failure aborts
//! the run and the whole set is retried. Policies already applied earlier in
//! the failed run stay in place remotely.

use std::sync::Arc;

use async_trait::async_trait;
use berth_api::{RegistryApi, RemoteRetention, RemoteRetentionRule, RemoteSelector};
use berth_core::prelude::*;
use berth_core::{RetentionSpec, SelectorSpec};
use tracing::info;

use super::{gone_ok, parent_of, wrong_spec};
use crate::policy::{KindPolicy, Step};
use crate::upsert::{ensure, Upsert};
use crate::Context;

pub struct RetentionPolicy;

fn selectors(s: &[SelectorSpec]) -> Vec<RemoteSelector> {
    s.iter()
        .map(|s| RemoteSelector { kind: s.kind.clone(), decoration: s.decoration.clone(), pattern: s.pattern.clone() })
        .collect()
}

struct RetentionUpsert<'a> {
    api: Arc<dyn RegistryApi>,
    project: &'a str,
    project_id: i64,
    bound: Option<i64>,
    spec: &'a RetentionSpec,
}

#[async_trait]
impl Upsert for RetentionUpsert<'_> {
    type Remote = RemoteRetention;

    fn key(&self) -> String { format!("retention for project {}", self.project) }

    async fn fetch(&self) -> EngineResult<Option<RemoteRetention>> {
        match self.bound {
            Some(id) => Ok(self.api.get_retention(id).await?),
            None => Ok(None),
        }
    }

    fn desired(&self, held: Option<&RemoteRetention>) -> RemoteRetention {
        RemoteRetention {
            id: held.map(|h| h.id).unwrap_or_default(),
            algorithm: self.spec.algorithm.clone().unwrap_or_else(|| "or".into()),
            rules: self
                .spec
                .rules
                .iter()
                .map(|r| RemoteRetentionRule {
                    disabled: r.disabled.unwrap_or(false),
                    template: r.template.clone(),
                    params: r.params.clone(),
                    tag_selectors: selectors(&r.tag_selectors),
                    repository_selectors: selectors(&r.repository_selectors),
                })
                .collect(),
            cron: self.spec.cron.clone().unwrap_or_default(),
            project_id: self.project_id,
        }
    }

    async fn create(&self, want: &RemoteRetention) -> EngineResult<i64> { Ok(self.api.create_retention(want).await?) }

    async fn update(&self, want: &RemoteRetention) -> EngineResult<()> { Ok(self.api.update_retention(want).await?) }

    fn id_of(&self, held: &RemoteRetention) -> i64 { held.id }
}

#[async_trait]
impl KindPolicy for RetentionPolicy {
    fn kind(&self) -> Kind { Kind::Retention }

    fn edges(&self) -> &'static [(Phase, Phase)] {
        &[(Phase::Unknown, Phase::Creating), (Phase::Creating, Phase::Ready)]
    }

    async fn step(&self, ctx: &Context, rec: &mut Record, parent: Option<&Record>) -> EngineResult<Step> {
        let Spec::Retention(spec) = &rec.spec else { return Err(wrong_spec(rec)) };
        let api = ctx.client_for(parent_of(rec, parent)?).await?;
        let mut children = Vec::with_capacity(spec.projects.len());
        for project in &spec.projects {
            let held = api
                .get_project(project)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("project {} on instance", project)))?;
            let up = RetentionUpsert {
                api: api.clone(),
                project,
                project_id: held.id,
                bound: held.retention_id,
                spec,
            };
            let out = ensure(&up, false).await?;
            children.push(ChildStatus { project: project.clone(), policy_id: out.id });
        }
        // projects dropped from the list lose their policy
        for old in rec.status.children.iter().filter(|c| !spec.projects.contains(&c.project)) {
            gone_ok(api.delete_retention(old.policy_id).await)?;
            info!(retention = %rec.name(), project = %old.project, "retention detached");
        }
        rec.status.external_id = children.first().map(|c| c.policy_id);
        rec.status.children = children;
        Ok(Step::after(Phase::Ready, ctx.config.resync, "retention in sync"))
    }

    async fn teardown(&self, ctx: &Context, rec: &Record, parent: Option<&Record>) -> EngineResult<()> {
        let api = ctx.client_for(parent_of(rec, parent)?).await?;
        for child in &rec.status.children {
            gone_ok(api.delete_retention(child.policy_id).await)?;
        }
        Ok(())
    }
}
