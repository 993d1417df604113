//! Local user accounts on an instance.

use std::sync::Arc;

use async_trait::async_trait;
use berth_api::{RegistryApi, RemoteUser};
use berth_apply::spec_hash;
use berth_core::prelude::*;
use berth_core::UserSpec;
use tracing::info;

use super::{gone_ok, parent_of, wrong_spec};
use crate::policy::{KindPolicy, Step, HELM_REPOSITORY_CACHE};
use crate::upsert::{ensure, Upsert};
use crate::Context;

pub struct UserPolicy;

fn username(rec: &Record, spec: &UserSpec) -> String { spec.username.clone().unwrap_or_else(|| rec.name().to_string()) }

struct UserUpsert<'a> {
    api: Arc<dyn RegistryApi>,
    username: String,
    spec: &'a UserSpec,
    password: &'a str,
}

#[async_trait]
impl Upsert for UserUpsert<'_> {
    type Remote = RemoteUser;

    fn key(&self) -> String { format!("user {}", self.username) }

    async fn fetch(&self) -> EngineResult<Option<RemoteUser>> { Ok(self.api.get_user(&self.username).await?) }

    fn desired(&self, held: Option<&RemoteUser>) -> RemoteUser {
        RemoteUser {
            id: held.map(|h| h.id).unwrap_or_default(),
            username: self.username.clone(),
            email: self.spec.email.clone(),
            realname: self.spec.realname.clone(),
            comment: self.spec.comment.clone().unwrap_or_default(),
            // converged through its own endpoint below
            admin: held.map(|h| h.admin).unwrap_or(false),
        }
    }

    async fn create(&self, want: &RemoteUser) -> EngineResult<i64> { Ok(self.api.create_user(want, self.password).await?) }

    async fn update(&self, want: &RemoteUser) -> EngineResult<()> { Ok(self.api.update_user_profile(want).await?) }

    fn id_of(&self, held: &RemoteUser) -> i64 { held.id }
}

#[async_trait]
impl KindPolicy for UserPolicy {
    fn kind(&self) -> Kind { Kind::User }

    fn edges(&self) -> &'static [(Phase, Phase)] {
        &[(Phase::Unknown, Phase::Creating), (Phase::Creating, Phase::Ready)]
    }

    fn exclusive(&self) -> Option<&'static str> { Some(HELM_REPOSITORY_CACHE) }

    fn dependents(&self) -> &'static [Kind] { &[Kind::Project] }

    async fn step(&self, ctx: &Context, rec: &mut Record, parent: Option<&Record>) -> EngineResult<Step> {
        let Spec::User(spec) = &rec.spec else { return Err(wrong_spec(rec)) };
        let api = ctx.client_for(parent_of(rec, parent)?).await?;
        let password = ctx.secret_string(rec.namespace(), &spec.password_secret).await?;
        let name = username(rec, spec);
        let hash = spec_hash(&serde_json::json!({ "username": name, "password": password }))?;
        let up = UserUpsert { api: api.clone(), username: name.clone(), spec, password: &password };
        let out = ensure(&up, false).await?;
        if !out.created && rec.status.spec_hash.as_deref() != Some(hash.as_str()) {
            api.set_user_password(out.id, &password).await?;
            info!(user = %name, "password updated");
        }
        let want_admin = spec.admin.unwrap_or(false);
        if out.held.as_ref().map(|h| h.admin) != Some(want_admin) {
            api.set_user_admin(out.id, want_admin).await?;
        }
        rec.status.external_id = Some(out.id);
        rec.status.spec_hash = Some(hash);
        Ok(Step::after(Phase::Ready, ctx.config.resync, "user in sync"))
    }

    async fn teardown(&self, ctx: &Context, rec: &Record, parent: Option<&Record>) -> EngineResult<()> {
        let Spec::User(spec) = &rec.spec else { return Err(wrong_spec(rec)) };
        let api = ctx.client_for(parent_of(rec, parent)?).await?;
        let id = match rec.status.external_id {
            Some(id) => id,
            None => match api.get_user(&username(rec, spec)).await? {
                Some(held) => held.id,
                None => return Ok(()),
            },
        };
        gone_ok(api.delete_user(id).await)
    }
}
