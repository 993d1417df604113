//! Dependency gate: a record proceeds only when its parent exists, rests in
//! its settled phase and answers its liveness probe, and every sibling it
//! names is settled too.

use berth_core::prelude::*;
use tracing::debug;

use crate::policy::policy_for;
use crate::Context;

#[derive(Debug, Clone, PartialEq)]
pub enum Gate {
    /// Proceed; carries the parent record when the kind has one.
    Ready(Option<Record>),
    Missing(ObjectRef),
    NotReady(ObjectRef, String),
}

fn unsettled(rec: &Record) -> Option<String> {
    if rec.is_deleting() {
        return Some("being deleted".to_string());
    }
    let settled = policy_for(rec.kind()).settled();
    if rec.status.phase != settled {
        return Some(format!("phase {} (needs {})", rec.status.phase, settled));
    }
    None
}

/// Classify the records `rec` depends on.
///
/// A record being deleted only needs its parent to exist and be reachable:
/// teardown runs against the parent's remote system whatever phase it is in,
/// and siblings are not consulted.
pub async fn resolve(ctx: &Context, rec: &Record) -> EngineResult<Gate> {
    let deleting = rec.is_deleting();
    let parent = match rec.parent_ref() {
        None => None,
        Some(pref) => {
            let Some(p) = ctx.store.get(&pref).await? else { return Ok(Gate::Missing(pref)) };
            if !deleting {
                if let Some(why) = unsettled(&p) {
                    return Ok(Gate::NotReady(pref, why));
                }
            }
            match policy_for(p.kind()).probe(ctx, &p).await {
                Ok(true) => {}
                Ok(false) => return Ok(Gate::NotReady(pref, "unhealthy".to_string())),
                Err(e) => {
                    debug!(parent = %pref, error = %e, "liveness probe failed");
                    return Ok(Gate::NotReady(pref, format!("unreachable: {}", e)));
                }
            }
            Some(p)
        }
    };
    if !deleting {
        let ns = rec.namespace();
        for (kind, name) in rec.spec.sibling_refs() {
            let sref = ObjectRef::new(kind, ns, name);
            let Some(s) = ctx.store.get(&sref).await? else { return Ok(Gate::Missing(sref)) };
            if let Some(why) = unsettled(&s) {
                return Ok(Gate::NotReady(sref, why));
            }
        }
    }
    Ok(Gate::Ready(parent))
}
