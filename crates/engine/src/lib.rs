//! Berth engine: the convergence loop shared by every managed kind.
//!
//! A run fetches the latest record, validates it, ensures the engine's
//! finalizer, gates on the parent and sibling records, then either finalizes
//! a record being deleted or hands it to the kind's policy for one step of
//! its phase graph. Status is written back only when it changed.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use berth_api::{RegistryApi, RegistryConnector, RegistryEndpoint};
use berth_core::prelude::*;
use berth_core::SecretKeyRef;
use berth_ops::ChartOps;
use berth_store::{CredentialResolver, RecordStore};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub mod config;
pub mod dispatch;
pub mod finalize;
pub mod kinds;
pub mod machine;
pub mod policy;
pub mod resolver;
pub mod upsert;

pub use config::EngineConfig;
pub use dispatch::{DispatchStats, Dispatcher, NamedLocks, Reconciler};
pub use finalize::Finalization;
pub use policy::{policy_for, KindPolicy, Step, HELM_REPOSITORY_CACHE};
pub use resolver::Gate;

/// Collaborators and tunables shared by every run.
pub struct Context {
    pub store: Arc<dyn RecordStore>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub registries: Arc<dyn RegistryConnector>,
    pub charts: Arc<dyn ChartOps>,
    pub config: EngineConfig,
    /// Shared with the dispatcher's exclusive-resource locks.
    pub locks: NamedLocks,
}

impl Context {
    pub async fn secret_string(&self, namespace: &str, secret: &SecretKeyRef) -> EngineResult<String> {
        Ok(self.credentials.get_string(namespace, secret).await?)
    }

    /// Registry-platform client for an Instance record, authenticated as its admin.
    pub async fn client_for(&self, instance: &Record) -> EngineResult<Arc<dyn RegistryApi>> {
        let Spec::Instance(spec) = &instance.spec else {
            return Err(EngineError::Internal(format!("{} is not an Instance", instance.object_ref())));
        };
        let password = self.secret_string(instance.namespace(), &spec.admin_secret).await?;
        let endpoint = RegistryEndpoint {
            url: spec.instance_url.clone(),
            username: spec.admin_user().to_string(),
            password,
        };
        Ok(self.registries.connect(&endpoint)?)
    }
}

pub struct Engine {
    ctx: Arc<Context>,
}

impl Engine {
    pub fn new(ctx: Context) -> Self { Self { ctx: Arc::new(ctx) } }

    pub fn context(&self) -> &Context { &self.ctx }

    /// One reconcile run for `target`.
    pub async fn reconcile(&self, target: &ObjectRef) -> EngineResult<Action> {
        let t0 = Instant::now();
        let res = self.run(target).await;
        let kind = target.kind.as_str();
        counter!("reconcile_total", 1u64, "kind" => kind);
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind);
        match &res {
            Ok(action) => debug!(target = %target, action = ?action, took_ms = %t0.elapsed().as_millis(), "reconcile ok"),
            Err(e) => {
                counter!("reconcile_errors_total", 1u64, "kind" => kind, "error" => e.label());
                warn!(target = %target, error = %e, took_ms = %t0.elapsed().as_millis(), "reconcile failed");
            }
        }
        res
    }

    async fn run(&self, target: &ObjectRef) -> EngineResult<Action> {
        let ctx = &*self.ctx;
        let Some(mut rec) = ctx.store.get(target).await? else {
            debug!(target = %target, "record gone; nothing to do");
            return Ok(Action::Done);
        };
        let policy = policy_for(target.kind);
        let token = ctx.config.finalizer.as_str();
        let deleting = rec.is_deleting();
        if deleting && !rec.metadata.has_finalizer(token) {
            return Ok(Action::Done);
        }
        let before = rec.status.clone();

        if !deleting {
            if let Err(e) = rec.spec.validate(rec.name()) {
                rec.status.message = e.to_string();
                self.write_status_quiet(&mut rec, &before).await;
                return Err(e);
            }
            if rec.metadata.add_finalizer(token) {
                rec = ctx.store.update(&rec).await?;
                rec.status = before.clone();
                debug!(target = %target, "finalizer added");
            }
            if rec.status.phase == Phase::Unknown {
                rec.status.transition(Phase::Creating, "reconciling");
            }
        }

        let parent = match resolver::resolve(ctx, &rec).await? {
            Gate::Ready(parent) => parent,
            Gate::Missing(missing) if deleting => {
                info!(target = %target, missing = %missing, "parent gone; releasing without remote cleanup");
                finalize::clear(ctx, &mut rec).await?;
                return Ok(Action::Done);
            }
            Gate::Missing(missing) => {
                rec.status.message = format!("waiting for {} to exist", missing);
                self.write_status(&mut rec, &before).await?;
                return Ok(Action::RequeueAfter(ctx.config.dependency_retry));
            }
            Gate::NotReady(dep, why) => {
                rec.status.message = format!("waiting for {}: {}", dep, why);
                self.write_status(&mut rec, &before).await?;
                return Ok(Action::RequeueAfter(ctx.config.dependency_retry));
            }
        };

        if deleting {
            if rec.status.phase != Phase::Terminating {
                rec.status.transition(Phase::Terminating, "finalizing");
                self.write_status(&mut rec, &before).await?;
            }
            let before = rec.status.clone();
            return match finalize::finalize(ctx, policy, &mut rec, parent.as_ref()).await {
                Ok(Finalization::Cleared) => Ok(Action::Done),
                Ok(Finalization::Blocked(by)) => {
                    rec.status.message = format!("deletion blocked by {}", by);
                    self.write_status(&mut rec, &before).await?;
                    Ok(Action::RequeueAfter(ctx.config.dependency_retry))
                }
                Err(e) => {
                    rec.status.message = e.to_string();
                    self.write_status_quiet(&mut rec, &before).await;
                    Err(e)
                }
            };
        }

        let from = rec.status.phase;
        match policy.step(ctx, &mut rec, parent.as_ref()).await {
            Ok(step) => {
                machine::check(policy, from, step.to)?;
                rec.status.transition(step.to, step.message);
                rec.status.observed_generation = rec.metadata.generation;
                if from != step.to {
                    info!(target = %target, from = %from, to = %step.to, "phase transition");
                }
                self.write_status(&mut rec, &before).await?;
                Ok(step.action)
            }
            Err(e) => {
                rec.status.message = e.to_string();
                self.write_status_quiet(&mut rec, &before).await;
                Err(e)
            }
        }
    }

    async fn write_status(&self, rec: &mut Record, before: &Status) -> EngineResult<()> {
        if rec.status == *before {
            return Ok(());
        }
        let status = rec.status.clone();
        *rec = self.ctx.store.update_status(rec).await?;
        rec.status = status;
        Ok(())
    }

    /// Status write on an error path; the run's own error takes precedence.
    async fn write_status_quiet(&self, rec: &mut Record, before: &Status) {
        if let Err(e) = self.write_status(rec, before).await {
            warn!(target = %rec.object_ref(), error = %e, "status write failed");
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for Engine {
    async fn reconcile(&self, target: &ObjectRef) -> EngineResult<Action> { Engine::reconcile(self, target).await }

    fn exclusive(&self, kind: Kind) -> Option<&'static str> { policy_for(kind).exclusive() }

    fn config(&self) -> &EngineConfig { &self.ctx.config }

    fn locks(&self) -> NamedLocks { self.ctx.locks.clone() }
}
