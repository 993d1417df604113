//! Registry endpoints known to an instance (replication sources and targets).

use std::sync::Arc;

use async_trait::async_trait;
use berth_api::{RegistryApi, RemoteCredential, RemoteRegistry};
use berth_apply::spec_hash;
use berth_core::prelude::*;
use berth_core::{RegistrySpec, SecretKeyRef};

use super::{gone_ok, parent_of, wrong_spec};
use crate::policy::{KindPolicy, Step};
use crate::upsert::{ensure, Upsert};
use crate::Context;

pub struct RegistryPolicy;

struct RegistryUpsert<'a> {
    api: Arc<dyn RegistryApi>,
    name: &'a str,
    spec: &'a RegistrySpec,
    credential: Option<RemoteCredential>,
}

#[async_trait]
impl Upsert for RegistryUpsert<'_> {
    type Remote = RemoteRegistry;

    fn key(&self) -> String { format!("registry {}", self.name) }

    async fn fetch(&self) -> EngineResult<Option<RemoteRegistry>> { Ok(self.api.get_registry(self.name).await?) }

    fn desired(&self, held: Option<&RemoteRegistry>) -> RemoteRegistry {
        RemoteRegistry {
            id: held.map(|h| h.id).unwrap_or_default(),
            name: self.name.to_string(),
            registry_type: self.spec.registry_type.clone().unwrap_or_else(|| "harbor".into()),
            url: self.spec.url.clone(),
            description: self.spec.description.clone().unwrap_or_default(),
            insecure: self.spec.insecure.unwrap_or(false),
            credential: self.credential.clone(),
        }
    }

    async fn create(&self, want: &RemoteRegistry) -> EngineResult<i64> { Ok(self.api.create_registry(want).await?) }

    async fn update(&self, want: &RemoteRegistry) -> EngineResult<()> { Ok(self.api.update_registry(want).await?) }

    fn id_of(&self, held: &RemoteRegistry) -> i64 { held.id }
}

async fn resolve_credential(ctx: &Context, rec: &Record, spec: &RegistrySpec) -> EngineResult<Option<RemoteCredential>> {
    let Some(c) = &spec.credential else { return Ok(None) };
    let key = |k: &str| SecretKeyRef { name: c.secret.clone(), key: k.to_string() };
    Ok(Some(RemoteCredential {
        credential_type: c.credential_type.clone().unwrap_or_else(|| "basic".into()),
        access_key: ctx.secret_string(rec.namespace(), &key("access_key")).await?,
        access_secret: ctx.secret_string(rec.namespace(), &key("access_secret")).await?,
    }))
}

#[async_trait]
impl KindPolicy for RegistryPolicy {
    fn kind(&self) -> Kind { Kind::Registry }

    fn edges(&self) -> &'static [(Phase, Phase)] {
        &[(Phase::Unknown, Phase::Creating), (Phase::Creating, Phase::Ready)]
    }

    fn dependents(&self) -> &'static [Kind] { &[Kind::Replication] }

    async fn step(&self, ctx: &Context, rec: &mut Record, parent: Option<&Record>) -> EngineResult<Step> {
        let Spec::Registry(spec) = &rec.spec else { return Err(wrong_spec(rec)) };
        let api = ctx.client_for(parent_of(rec, parent)?).await?;
        let credential = resolve_credential(ctx, rec, spec).await?;
        // the remote never echoes the access secret back, so rotations show up only here
        let hash = spec_hash(&(spec, &credential))?;
        let force = rec.status.spec_hash.as_deref() != Some(hash.as_str());
        let up = RegistryUpsert { api, name: rec.name(), spec, credential };
        let out = ensure(&up, force).await?;
        rec.status.external_id = Some(out.id);
        rec.status.spec_hash = Some(hash);
        Ok(Step::after(Phase::Ready, ctx.config.resync, "registry in sync"))
    }

    async fn teardown(&self, ctx: &Context, rec: &Record, parent: Option<&Record>) -> EngineResult<()> {
        let api = ctx.client_for(parent_of(rec, parent)?).await?;
        let id = match rec.status.external_id {
            Some(id) => id,
            None => match api.get_registry(rec.name()).await? {
                Some(held) => held.id,
                None => return Ok(()),
            },
        };
        gone_ok(api.delete_registry(id).await)
    }
}
