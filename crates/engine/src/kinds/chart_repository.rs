//! Chart repository entries in the local helm configuration.

use async_trait::async_trait;
use berth_apply::spec_hash;
use berth_core::prelude::*;
use berth_core::SecretKeyRef;
use berth_ops::RepositoryEntry;
use tracing::info;

use super::{ops_gone_ok, wrong_spec};
use crate::policy::{KindPolicy, Step, HELM_REPOSITORY_CACHE};
use crate::Context;

pub struct ChartRepositoryPolicy;

async fn entry(ctx: &Context, rec: &Record) -> EngineResult<RepositoryEntry> {
    let Spec::ChartRepository(spec) = &rec.spec else { return Err(wrong_spec(rec)) };
    let (username, password) = match &spec.secret {
        Some(secret) => {
            let key = |k: &str| SecretKeyRef { name: secret.clone(), key: k.to_string() };
            (
                Some(ctx.secret_string(rec.namespace(), &key("username")).await?),
                Some(ctx.secret_string(rec.namespace(), &key("password")).await?),
            )
        }
        None => (None, None),
    };
    Ok(RepositoryEntry { name: rec.name().to_string(), url: spec.url.clone(), username, password })
}

#[async_trait]
impl KindPolicy for ChartRepositoryPolicy {
    fn kind(&self) -> Kind { Kind::ChartRepository }

    fn edges(&self) -> &'static [(Phase, Phase)] {
        &[(Phase::Unknown, Phase::Creating), (Phase::Creating, Phase::Ready)]
    }

    fn exclusive(&self) -> Option<&'static str> { Some(HELM_REPOSITORY_CACHE) }

    async fn step(&self, ctx: &Context, rec: &mut Record, _parent: Option<&Record>) -> EngineResult<Step> {
        let entry = entry(ctx, rec).await?;
        let hash = spec_hash(&serde_json::json!({
            "name": entry.name,
            "url": entry.url,
            "username": entry.username,
            "password": entry.password,
        }))?;
        let listed = ctx.charts.list_repositories().await?;
        let configured = listed.iter().any(|r| r.name == entry.name && r.url == entry.url);
        let changed = rec.status.spec_hash.as_deref() != Some(hash.as_str());
        if changed || !configured {
            if !changed {
                info!(repository = %entry.name, url = %entry.url, "repository entry missing or moved; restoring");
            }
            ctx.charts.add_repository(&entry).await?;
            ctx.charts.update_repository_index().await?;
            rec.status.spec_hash = Some(hash);
        }
        Ok(Step::after(Phase::Ready, ctx.config.resync, "repository configured"))
    }

    async fn teardown(&self, ctx: &Context, rec: &Record, _parent: Option<&Record>) -> EngineResult<()> {
        ops_gone_ok(ctx.charts.remove_repository(rec.name()).await)
    }
}
