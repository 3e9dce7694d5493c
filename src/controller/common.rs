//! Shared controller helpers.

use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use tracing::debug;

use crate::controller::error::Result;

/// Attempts of a read-modify-write cycle before a conflict is surfaced.
pub const CONFLICT_RETRY_ATTEMPTS: u32 = 5;
/// Pause between conflicting attempts.
pub const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Run `op` until it succeeds, fails with something other than a conflict,
/// or [`CONFLICT_RETRY_ATTEMPTS`] are used up.
///
/// `op` receives the attempt number starting at 1 and must read the object
/// afresh on every call.
pub async fn retry_on_conflict<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_on_conflict_with(what, &mut (), |attempt, ()| {
        op(attempt).map(|result| ((), result))
    })
    .await
}

/// [`retry_on_conflict`] for operations that record their progress in
/// `state`.
///
/// Every attempt starts from a copy of `state` as it was before the first
/// one. The copy handed back by the last attempt is stored in `state`,
/// whether that attempt succeeded or not.
pub async fn retry_on_conflict_with<S, T, F, Fut>(what: &str, state: &mut S, mut op: F) -> Result<T>
where
    S: Clone,
    F: FnMut(u32, S) -> Fut,
    Fut: Future<Output = (S, Result<T>)>,
{
    let initial = state.clone();
    let mut attempt = 1;
    loop {
        let (progress, result) = op(attempt, initial.clone()).await;
        *state = progress;
        match result {
            Err(e) if e.is_conflict() && attempt < CONFLICT_RETRY_ATTEMPTS => {
                debug!(what, attempt, "Conflict, retrying with a fresh read");
                attempt += 1;
                tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
            }
            result => return result,
        }
    }
}
