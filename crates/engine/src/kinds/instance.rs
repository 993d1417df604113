//! Registry-platform instances deployed from a chart.

use async_trait::async_trait;
use berth_apply::{merge_values, parse_values, spec_hash};
use berth_core::prelude::*;
use berth_core::InstanceSpec;
use berth_ops::{ReleaseSpec, RepositoryEntry};
use berth_store::CredentialResolver;
use tracing::{info, warn};

use super::{ops_gone_ok, wrong_spec};
use crate::policy::{KindPolicy, Step, HELM_REPOSITORY_CACHE};
use crate::Context;

pub struct InstancePolicy;

/// Chart request with every external values document merged in.
pub async fn resolve_release(
    credentials: &dyn CredentialResolver,
    rec: &Record,
    spec: &InstanceSpec,
) -> EngineResult<ReleaseSpec> {
    let chart = &spec.chart;
    let mut values = if chart.values.is_null() { serde_json::json!({}) } else { chart.values.clone() };
    for src in &chart.values_from {
        let doc = credentials.get_string(rec.namespace(), src).await?;
        merge_values(&mut values, parse_values(&doc)?);
    }
    Ok(ReleaseSpec {
        name: chart.release_name.clone().unwrap_or_else(|| rec.name().to_string()),
        namespace: chart.namespace.clone().unwrap_or_else(|| rec.namespace().to_string()),
        chart: format!("{}/{}", chart.repository, chart.chart),
        version: chart.version.clone(),
        values,
    })
}

/// SpecHash of an Instance: the resolved release and, when the chart brings its
/// own repository, that repository's URL.
pub fn instance_hash(spec: &InstanceSpec, release: &ReleaseSpec) -> EngineResult<String> {
    match &spec.chart.repository_url {
        Some(url) => spec_hash(&serde_json::json!({ "release": release, "repositoryUrl": url })),
        None => spec_hash(release),
    }
}

/// Register the inline repository and refresh the index while holding the
/// repository cache.
async fn refresh_repositories(ctx: &Context, spec: &InstanceSpec) -> EngineResult<()> {
    let cache = ctx.locks.get(HELM_REPOSITORY_CACHE);
    let _held = cache.lock().await;
    if let Some(url) = &spec.chart.repository_url {
        let entry = RepositoryEntry { name: spec.chart.repository.clone(), url: url.clone(), username: None, password: None };
        ctx.charts.add_repository(&entry).await?;
    }
    ctx.charts.update_repository_index().await?;
    Ok(())
}

/// Install or upgrade; on failure roll back to the last deployed revision.
async fn apply(ctx: &Context, spec: &InstanceSpec, release: &ReleaseSpec) -> EngineResult<u32> {
    refresh_repositories(ctx, spec).await?;
    let previous = ctx.charts.status(&release.name, &release.namespace).await?.filter(|r| r.is_deployed());
    let timeout = ctx.config.helm_timeout;
    let err = match ctx.charts.install_or_upgrade(release, timeout).await {
        Ok(rel) => {
            info!(release = %rel.name, revision = rel.revision, "release applied");
            return Ok(rel.revision);
        }
        Err(e) => e,
    };
    let Some(prev) = previous else {
        return Err(EngineError::Apply { message: err.to_string(), rolled_back_to: None });
    };
    warn!(release = %release.name, error = %err, revision = prev.revision, "apply failed; rolling back");
    match ctx.charts.rollback(&release.name, &release.namespace, prev.revision, timeout).await {
        Ok(()) => Err(EngineError::Apply { message: err.to_string(), rolled_back_to: Some(prev.revision) }),
        Err(rb) => Err(EngineError::ApplyAndRollback { apply: err.to_string(), rollback: rb.to_string() }),
    }
}

#[async_trait]
impl KindPolicy for InstancePolicy {
    fn kind(&self) -> Kind { Kind::Instance }

    fn edges(&self) -> &'static [(Phase, Phase)] {
        &[(Phase::Unknown, Phase::Creating), (Phase::Creating, Phase::Ready), (Phase::Ready, Phase::Creating)]
    }

    fn dependents(&self) -> &'static [Kind] {
        &[Kind::Registry, Kind::Project, Kind::Replication, Kind::Retention, Kind::User]
    }

    async fn probe(&self, ctx: &Context, rec: &Record) -> EngineResult<bool> {
        let api = ctx.client_for(rec).await?;
        Ok(api.health().await?)
    }

    async fn step(&self, ctx: &Context, rec: &mut Record, _parent: Option<&Record>) -> EngineResult<Step> {
        let Spec::Instance(spec) = &rec.spec else { return Err(wrong_spec(rec)) };
        let release = resolve_release(ctx.credentials.as_ref(), rec, spec).await?;
        let hash = instance_hash(spec, &release)?;
        let changed = rec.status.spec_hash.as_deref() != Some(hash.as_str());
        match rec.status.phase {
            Phase::Ready if changed => Ok(Step::now(Phase::Creating, "chart configuration changed")),
            Phase::Ready => {
                let healthy = self.probe(ctx, rec).await.unwrap_or(false);
                let msg = if healthy { "instance healthy" } else { "instance unhealthy" };
                Ok(Step::after(Phase::Ready, ctx.config.resync, msg))
            }
            _ => {
                if changed {
                    let revision = apply(ctx, spec, &release).await?;
                    rec.status.release_revision = Some(revision);
                    rec.status.spec_hash = Some(hash);
                }
                match self.probe(ctx, rec).await {
                    Ok(true) => Ok(Step::after(Phase::Ready, ctx.config.resync, "instance healthy")),
                    Ok(false) => Ok(Step::after(Phase::Creating, ctx.config.dependency_retry, "waiting for instance health")),
                    Err(e) => Ok(Step::after(
                        Phase::Creating,
                        ctx.config.dependency_retry,
                        format!("waiting for instance: {}", e),
                    )),
                }
            }
        }
    }

    async fn teardown(&self, ctx: &Context, rec: &Record, _parent: Option<&Record>) -> EngineResult<()> {
        let Spec::Instance(spec) = &rec.spec else { return Err(wrong_spec(rec)) };
        let name = spec.chart.release_name.clone().unwrap_or_else(|| rec.name().to_string());
        let namespace = spec.chart.namespace.clone().unwrap_or_else(|| rec.namespace().to_string());
        ops_gone_ok(ctx.charts.uninstall(&name, &namespace).await)
    }
}
