//! Finalization: hold deletion while dependents reference the record, tear
//! down the remote counterpart, then release this engine's finalizer.

use berth_core::prelude::*;
use metrics::counter;
use tracing::info;

use crate::policy::KindPolicy;
use crate::Context;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalization {
    Cleared,
    /// Another record still references this one.
    Blocked(ObjectRef),
}

/// First record of a dependent kind that still references `rec`.
pub async fn blocker(ctx: &Context, policy: &dyn KindPolicy, rec: &Record) -> EngineResult<Option<ObjectRef>> {
    let target = rec.object_ref();
    for &kind in policy.dependents() {
        for other in ctx.store.list(kind, rec.namespace()).await? {
            if other.object_ref() != target && other.references_target(&target) {
                return Ok(Some(other.object_ref()));
            }
        }
    }
    Ok(None)
}

pub async fn finalize(
    ctx: &Context,
    policy: &dyn KindPolicy,
    rec: &mut Record,
    parent: Option<&Record>,
) -> EngineResult<Finalization> {
    if let Some(by) = blocker(ctx, policy, rec).await? {
        counter!("finalizer_blocked_total", 1u64, "kind" => policy.kind().as_str());
        return Ok(Finalization::Blocked(by));
    }
    policy.teardown(ctx, rec, parent).await?;
    clear(ctx, rec).await?;
    Ok(Finalization::Cleared)
}

/// Remove this engine's finalizer token, leaving other tokens in place.
pub async fn clear(ctx: &Context, rec: &mut Record) -> EngineResult<()> {
    if !rec.metadata.remove_finalizer(&ctx.config.finalizer) {
        return Ok(());
    }
    *rec = ctx.store.update(rec).await?;
    counter!("finalizer_cleared_total", 1u64, "kind" => rec.kind().as_str());
    info!(target = %rec.object_ref(), "finalizer cleared");
    Ok(())
}
