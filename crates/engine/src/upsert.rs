//! Assert-existing algorithm applied to every remote entity: look the entity
//! up by natural key, create it when absent, otherwise diff the desired shape
//! against the held one and update on any difference.

use async_trait::async_trait;
use berth_apply::{diff_remote, drifted_fields};
use berth_core::EngineResult;
use serde::Serialize;
use tracing::info;

#[async_trait]
pub trait Upsert: Send + Sync {
    type Remote: Serialize + Send + Sync;

    /// Natural key, for logs.
    fn key(&self) -> String;

    async fn fetch(&self) -> EngineResult<Option<Self::Remote>>;

    /// Desired remote shape. Fields only the remote assigns are copied from `held`.
    fn desired(&self, held: Option<&Self::Remote>) -> Self::Remote;

    async fn create(&self, want: &Self::Remote) -> EngineResult<i64>;

    async fn update(&self, want: &Self::Remote) -> EngineResult<()>;

    fn id_of(&self, held: &Self::Remote) -> i64;
}

#[derive(Debug)]
pub struct Ensured<R> {
    pub id: i64,
    pub created: bool,
    pub updated: bool,
    /// Remote state as last read, before any update.
    pub held: Option<R>,
}

/// Create-if-absent, then diff-and-update. `force` updates even without a
/// visible difference, for fields the remote never echoes back (secrets).
pub async fn ensure<U: Upsert>(u: &U, force: bool) -> EngineResult<Ensured<U::Remote>> {
    match u.fetch().await? {
        None => {
            let want = u.desired(None);
            let id = u.create(&want).await?;
            info!(key = %u.key(), id, "upsert: created");
            // a create request may not carry every field; converge the rest
            let held = u.fetch().await?;
            let mut updated = false;
            if let Some(h) = &held {
                let want = u.desired(Some(h));
                if !diff_remote(&want, h).is_empty() {
                    u.update(&want).await?;
                    updated = true;
                }
            }
            Ok(Ensured { id, created: true, updated, held })
        }
        Some(held) => {
            let id = u.id_of(&held);
            let want = u.desired(Some(&held));
            let drift = drifted_fields(&want, &held);
            if drift.is_empty() && !force {
                return Ok(Ensured { id, created: false, updated: false, held: Some(held) });
            }
            info!(key = %u.key(), id, fields = ?drift, forced = force && drift.is_empty(), "upsert: updating");
            u.update(&want).await?;
            Ok(Ensured { id, created: false, updated: true, held: Some(held) })
        }
    }
}
