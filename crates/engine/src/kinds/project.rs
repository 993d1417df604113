//! Projects and their member lists.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use berth_api::{RegistryApi, RemoteProject};
use berth_core::prelude::*;
use berth_core::ProjectSpec;
use tracing::info;

use super::{gone_ok, parent_of, wrong_spec};
use crate::policy::{KindPolicy, Step};
use crate::upsert::{ensure, Upsert};
use crate::Context;

pub struct ProjectPolicy;

struct ProjectUpsert<'a> {
    api: Arc<dyn RegistryApi>,
    name: &'a str,
    spec: &'a ProjectSpec,
}

#[async_trait]
impl Upsert for ProjectUpsert<'_> {
    type Remote = RemoteProject;

    fn key(&self) -> String { format!("project {}", self.name) }

    async fn fetch(&self) -> EngineResult<Option<RemoteProject>> { Ok(self.api.get_project(self.name).await?) }

    fn desired(&self, held: Option<&RemoteProject>) -> RemoteProject {
        RemoteProject {
            id: held.map(|h| h.id).unwrap_or_default(),
            name: self.name.to_string(),
            public: self.spec.public.unwrap_or(false),
            auto_scan: self.spec.auto_scan.unwrap_or(false),
            prevent_vulnerable: self.spec.prevent_vulnerable.unwrap_or(false),
            severity: self.spec.severity.clone().unwrap_or_else(|| "low".into()),
            // bound by Retention records, never by the project itself
            retention_id: held.and_then(|h| h.retention_id),
        }
    }

    async fn create(&self, want: &RemoteProject) -> EngineResult<i64> { Ok(self.api.create_project(want).await?) }

    async fn update(&self, want: &RemoteProject) -> EngineResult<()> { Ok(self.api.update_project(want).await?) }

    fn id_of(&self, held: &RemoteProject) -> i64 { held.id }
}

/// Remote usernames wanted as members, with their role ids.
async fn wanted_members(ctx: &Context, rec: &Record, spec: &ProjectSpec) -> EngineResult<BTreeMap<String, i64>> {
    let mut out = BTreeMap::new();
    for m in &spec.members {
        let uref = ObjectRef::new(Kind::User, rec.namespace(), m.user.clone());
        let user = ctx.store.get(&uref).await?.ok_or_else(|| EngineError::NotFound(uref.to_string()))?;
        let Spec::User(u) = &user.spec else { return Err(wrong_spec(&user)) };
        let username = u.username.clone().unwrap_or_else(|| user.name().to_string());
        out.insert(username, m.role.role_id());
    }
    Ok(out)
}

/// Add, re-role and remove members until the remote list matches. The
/// instance admin is left alone: the platform enrolls it on creation.
async fn converge_members(
    api: &dyn RegistryApi,
    project: &str,
    wanted: &BTreeMap<String, i64>,
    admin: &str,
) -> EngineResult<usize> {
    let held = api.list_members(project).await?;
    let mut changes = 0;
    for (username, &role_id) in wanted {
        match held.iter().find(|m| &m.username == username) {
            Some(m) if m.role_id == role_id => {}
            Some(m) => {
                api.update_member(project, m.id, role_id).await?;
                changes += 1;
            }
            None => {
                api.add_member(project, username, role_id).await?;
                changes += 1;
            }
        }
    }
    for m in held.iter().filter(|m| !wanted.contains_key(&m.username) && m.username != admin) {
        api.remove_member(project, m.id).await?;
        changes += 1;
    }
    Ok(changes)
}

#[async_trait]
impl KindPolicy for ProjectPolicy {
    fn kind(&self) -> Kind { Kind::Project }

    fn edges(&self) -> &'static [(Phase, Phase)] {
        &[(Phase::Unknown, Phase::Creating), (Phase::Creating, Phase::Ready)]
    }

    fn dependents(&self) -> &'static [Kind] { &[Kind::Retention] }

    async fn step(&self, ctx: &Context, rec: &mut Record, parent: Option<&Record>) -> EngineResult<Step> {
        let Spec::Project(spec) = &rec.spec else { return Err(wrong_spec(rec)) };
        let parent = parent_of(rec, parent)?;
        let Spec::Instance(instance) = &parent.spec else { return Err(wrong_spec(parent)) };
        let api = ctx.client_for(parent).await?;
        let wanted = wanted_members(ctx, rec, spec).await?;
        let up = ProjectUpsert { api: api.clone(), name: rec.name(), spec };
        let out = ensure(&up, false).await?;
        let changes = converge_members(api.as_ref(), rec.name(), &wanted, instance.admin_user()).await?;
        if changes > 0 {
            info!(project = %rec.name(), changes, "members converged");
        }
        rec.status.external_id = Some(out.id);
        Ok(Step::after(Phase::Ready, ctx.config.resync, "project in sync"))
    }

    async fn teardown(&self, ctx: &Context, rec: &Record, parent: Option<&Record>) -> EngineResult<()> {
        let api = ctx.client_for(parent_of(rec, parent)?).await?;
        gone_ok(api.delete_project(rec.name()).await)
    }
}
