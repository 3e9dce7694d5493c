//! Shared context for the arbitration controller.
//!
//! Holds the arbiter with its ownership registry and the optional health
//! state. One context is shared by every reconcile of the kube-runtime
//! controller.

use std::sync::Arc;

use crate::client::ClusterApi;
use crate::config::ControllerSettings;
use crate::controller::arbiter::Arbiter;
use crate::health::HealthState;

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Owner of the namespace registry
    pub arbiter: Arc<Arbiter>,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Arc<dyn ClusterApi>,
        settings: ControllerSettings,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            arbiter: Arc::new(Arbiter::new(client, settings, health_state.clone())),
            health_state,
        }
    }
}
