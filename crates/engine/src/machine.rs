//! Phase graph checks.

use berth_core::prelude::*;

use crate::policy::KindPolicy;

/// Whether `policy`'s graph allows moving from `from` to `to`.
pub fn allowed(policy: &dyn KindPolicy, from: Phase, to: Phase) -> bool {
    from == to || to == Phase::Terminating || policy.edges().iter().any(|&(f, t)| f == from && t == to)
}

/// Reject a move outside the graph instead of applying it.
pub fn check(policy: &dyn KindPolicy, from: Phase, to: Phase) -> EngineResult<()> {
    if allowed(policy, from, to) {
        return Ok(());
    }
    Err(EngineError::Internal(format!("{}: illegal phase transition {} -> {}", policy.kind(), from, to)))
}

/// Phases reachable from Unknown in `policy`'s graph, in discovery order.
pub fn reachable(policy: &dyn KindPolicy) -> Vec<Phase> {
    let mut out = vec![Phase::Unknown];
    let mut i = 0;
    while i < out.len() {
        let from = out[i];
        for &(f, t) in policy.edges() {
            if f == from && !out.contains(&t) {
                out.push(t);
            }
        }
        i += 1;
    }
    out
}
