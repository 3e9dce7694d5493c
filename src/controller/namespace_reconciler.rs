//! Per-reconcile algorithm of a namespace controller.
//!
//! One pass reads the owning observer, looks up the DataHub instance of the
//! target namespace, runs the route recipes unless the observer is a backup,
//! and persists the consolidated status.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::client::ClusterApi;
use crate::config::ControllerSettings;
use crate::controller::common::retry_on_conflict;
use crate::controller::conditions::Partials;
use crate::controller::error::Result;
use crate::crd::{
    ConditionStatus, ManagedReference, ManagedRouteStatus, ObserverKey, SDIObserver,
    SDIObserverStatus, reasons,
};
use crate::resources::route::{
    RouteOutcome, RouteRecipe, RouteTarget, SLCB_ROUTE, VSYSTEM_ROUTE, route_partials,
};

/// Everything one pass wants written to the observer status.
#[derive(Clone, Debug, Default)]
struct StatusUpdate {
    partials: Partials,
    /// `None` keeps the stored reference, `Some(None)` clears it.
    datahub: Option<Option<ManagedReference>>,
    vsystem_route: Option<ManagedRouteStatus>,
    slcb_route: Option<ManagedRouteStatus>,
}

impl StatusUpdate {
    fn apply_to(&self, status: &mut SDIObserverStatus, generation: Option<i64>) {
        self.partials.apply(&mut status.conditions, generation);
        if let Some(datahub) = &self.datahub {
            status.managed_data_hub_ref = datahub.clone();
        }
        if let Some(route) = &self.vsystem_route {
            status.vsystem_route = route.clone();
        }
        if let Some(route) = &self.slcb_route {
            status.slcb_route = route.clone();
        }
    }
}

/// Reconciles the managed resources of one namespace for its active owner.
#[derive(Clone)]
pub struct NamespaceReconciler {
    client: Arc<dyn ClusterApi>,
    key: ObserverKey,
    namespace: String,
    settings: ControllerSettings,
}

impl NamespaceReconciler {
    pub fn new(
        client: Arc<dyn ClusterApi>,
        key: ObserverKey,
        namespace: String,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            client,
            key,
            namespace,
            settings,
        }
    }

    pub fn key(&self) -> &ObserverKey {
        &self.key
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Run one pass. Returns the delay of a timed re-check, if one is needed.
    ///
    /// Business states (no DataHub, backup, unmanaged routes) are recorded in
    /// status and never returned as errors.
    #[instrument(skip(self), fields(observer = %self.key, namespace = %self.namespace))]
    pub async fn reconcile(&self) -> Result<Option<Duration>> {
        let observer = match self.client.get_observer(&self.key).await {
            Ok(observer) => observer,
            Err(e) if e.is_not_found() => {
                debug!("Observer is gone, nothing to reconcile");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if observer.is_pending_deletion() {
            debug!("Observer is being deleted, skipping");
            return Ok(None);
        }

        let mut update = StatusUpdate::default();
        let mut requeue = None;
        let mut failure = None;

        match self.client.get_datahub(&self.namespace).await {
            Err(e) if e.is_not_found() => {
                debug!("No DataHub instance in the namespace");
                update.datahub = Some(None);
                update.partials.ready(
                    ConditionStatus::False,
                    reasons::NOT_FOUND,
                    format!("no DataHub instance found in namespace {}", self.namespace),
                );
                update.partials.progressing(
                    ConditionStatus::False,
                    reasons::NOT_FOUND,
                    "waiting for the managed DataHub to appear",
                );
            }
            Err(e) => {
                warn!(error = %e, "Failed to look up the DataHub instance");
                let message = format!("failed to get DataHub instance: {e}");
                update
                    .partials
                    .ready(ConditionStatus::Unknown, reasons::FAILED_GET, message.clone());
                update
                    .partials
                    .progressing(ConditionStatus::False, reasons::FAILED_GET, message.clone());
                update
                    .partials
                    .degraded(ConditionStatus::True, reasons::FAILED_GET, message);
                requeue = Some(self.settings.failed_get_recheck);
            }
            Ok(_) if observer.is_backup() => {
                debug!("Observer is a backup, leaving managed resources alone");
                update.datahub = Some(None);
                update
                    .partials
                    .ready(ConditionStatus::Unknown, reasons::BACKUP, "");
                update
                    .partials
                    .progressing(ConditionStatus::Unknown, reasons::BACKUP, "");
                update
                    .partials
                    .degraded(ConditionStatus::False, reasons::BACKUP, "");
            }
            Ok(datahub) => {
                update.datahub = Some(Some(datahub));
                let current = observer.status.clone().unwrap_or_default();

                let mut vsystem = current.vsystem_route;
                let result = self
                    .reconcile_route(&observer, &VSYSTEM_ROUTE, &self.namespace, &mut vsystem)
                    .await;
                update
                    .partials
                    .extend(route_partials(&VSYSTEM_ROUTE, &result, &vsystem));
                update.vsystem_route = Some(vsystem);
                failure = result.err();

                let mut slcb = current.slcb_route;
                let result = self
                    .reconcile_route(
                        &observer,
                        &SLCB_ROUTE,
                        &observer.spec.slcb_namespace,
                        &mut slcb,
                    )
                    .await;
                update
                    .partials
                    .extend(route_partials(&SLCB_ROUTE, &result, &slcb));
                update.slcb_route = Some(slcb);
                failure = failure.or(result.err());
            }
        }

        self.persist(&update).await?;
        match failure {
            Some(e) => Err(e),
            None => Ok(requeue),
        }
    }

    async fn reconcile_route(
        &self,
        observer: &SDIObserver,
        target: &RouteTarget,
        namespace: &str,
        status: &mut ManagedRouteStatus,
    ) -> Result<RouteOutcome> {
        let spec = if target.route_name == VSYSTEM_ROUTE.route_name {
            &observer.spec.vsystem_route
        } else {
            &observer.spec.slcb_route
        };
        RouteRecipe::new(
            self.client.as_ref(),
            observer,
            target,
            namespace,
            self.settings.admission_grace,
        )
        .reconcile(spec, status)
        .await
    }

    /// Write the update onto a fresh copy of the observer, skipping the
    /// write when nothing changed.
    async fn persist(&self, update: &StatusUpdate) -> Result<()> {
        retry_on_conflict("observer status", |attempt| {
            let client = self.client.clone();
            let key = self.key.clone();
            let update = update.clone();
            async move {
                let mut observer = match client.get_observer(&key).await {
                    Ok(observer) => observer,
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e),
                };
                let before = observer.status.clone().unwrap_or_default();
                let mut status = before.clone();
                update.apply_to(&mut status, observer.metadata.generation);
                if status == before {
                    debug!(attempt, "Status unchanged, skipping write");
                    return Ok(());
                }
                observer.status = Some(status);
                client.update_observer_status(&observer).await?;
                debug!(attempt, "Status updated");
                Ok(())
            }
        })
        .await
        .inspect_err(|e| warn!(observer = %self.key, error = %e, "Failed to persist observer status"))
    }
}
