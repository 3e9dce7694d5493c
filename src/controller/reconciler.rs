//! Entry points of the arbitration controller.
//!
//! The kube-runtime controller hands every SDIObserver change to
//! [`reconcile`], which delegates ownership decisions to the arbiter.
//! Managed resources are reconciled by namespace controllers, so the
//! observer itself is never requeued on success.

use std::sync::Arc;
use std::time::Instant;

use kube::{ResourceExt, runtime::controller::Action};
use tracing::{debug, error, warn};

use crate::controller::{context::Context, error::Error};
use crate::crd::SDIObserver;

/// Reconcile an SDIObserver
pub async fn reconcile(obj: Arc<SDIObserver>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let key = obj.key();
    debug!(observer = %key, generation = ?obj.metadata.generation, "Reconciling SDIObserver");

    ctx.arbiter.reconcile(&key).await?;

    debug!(observer = %key, duration = ?start_time.elapsed(), "Arbitration finished");
    Ok(Action::await_change())
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<SDIObserver>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    // Record error metric
    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
    }
    Action::requeue(error.requeue_after())
}
