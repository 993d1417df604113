//! Kind policies.

pub mod chart_repository;
pub mod instance;
pub mod project;
pub mod registry;
pub mod replication;
pub mod retention;
pub mod user;

use berth_api::{RemoteError, RemoteResult};
use berth_core::prelude::*;
use berth_ops::{OpsError, OpsResult};

use crate::Context;

/// Remote delete where "not found" means already gone.
pub(crate) fn gone_ok(r: RemoteResult<()>) -> EngineResult<()> {
    match r {
        Ok(()) | Err(RemoteError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn ops_gone_ok(r: OpsResult<()>) -> EngineResult<()> {
    match r {
        Ok(()) | Err(OpsError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn parent_of<'a>(rec: &Record, parent: Option<&'a Record>) -> EngineResult<&'a Record> {
    parent.ok_or_else(|| EngineError::Internal(format!("{}: step without resolved parent", rec.object_ref())))
}

pub(crate) fn wrong_spec(rec: &Record) -> EngineError {
    EngineError::Internal(format!("{}: spec does not match kind", rec.object_ref()))
}

/// External id of a settled sibling record.
pub(crate) async fn sibling_id(ctx: &Context, rec: &Record, kind: Kind, name: &str) -> EngineResult<i64> {
    let sref = ObjectRef::new(kind, rec.namespace(), name);
    let sib = ctx.store.get(&sref).await?.ok_or_else(|| EngineError::NotFound(sref.to_string()))?;
    sib.status.external_id.ok_or_else(|| EngineError::NotReady(format!("{} has no remote id yet", sref)))
}
