//! Arbitration reconciler.
//!
//! Decides which SDIObserver instance owns which target namespace. The first
//! observer asking for an unowned namespace becomes its active owner and gets
//! a [`NamespaceController`]; later ones are marked as backup. When an owner
//! departs (deleted, being deleted, or retargeted) the most specific remaining
//! candidate is promoted.
//!
//! All ownership decisions happen under one lock, so no two observers are
//! ever recorded as owners of the same namespace.

use std::sync::Arc;

use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::client::{ClusterApi, ObserverEvent, event_reasons};
use crate::config::ControllerSettings;
use crate::controller::common::retry_on_conflict;
use crate::controller::election::select_candidate;
use crate::controller::error::{Error, Result};
use crate::controller::namespace_controller::NamespaceController;
use crate::controller::ownership::{Ownership, OwnershipSnapshot};
use crate::controller::status::set_backup;
use crate::crd::{ObserverKey, SDIObserver};
use crate::health::HealthState;

type Registry = Ownership<NamespaceController>;

/// How an observer came to own its namespace.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Promotion {
    /// The namespace had no owner.
    Claim,
    /// The previous owner departed.
    HandOff,
}

pub struct Arbiter {
    client: Arc<dyn ClusterApi>,
    settings: ControllerSettings,
    health: Option<Arc<HealthState>>,
    ownership: Mutex<Registry>,
}

impl Arbiter {
    pub fn new(
        client: Arc<dyn ClusterApi>,
        settings: ControllerSettings,
        health: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            settings,
            health,
            ownership: Mutex::new(Ownership::new()),
        }
    }

    /// Copy of the ownership maps.
    pub async fn snapshot(&self) -> OwnershipSnapshot {
        self.ownership.lock().await.snapshot()
    }

    /// Whether the namespace controller of `key` is alive.
    pub async fn is_running(&self, key: &ObserverKey) -> bool {
        self.ownership
            .lock()
            .await
            .controller(key)
            .is_some_and(NamespaceController::is_running)
    }

    /// Reconcile the ownership of one observer.
    #[instrument(skip_all, fields(observer = %key))]
    pub async fn reconcile(&self, key: &ObserverKey) -> Result<()> {
        let mut ownership = self.ownership.lock().await;
        let result = self.reconcile_locked(&mut ownership, key).await;
        if let Some(health) = &self.health {
            health
                .metrics
                .set_ownership(ownership.controller_count(), ownership.backup_count());
        }
        debug_assert!(ownership.is_consistent());
        result
    }

    async fn reconcile_locked(&self, ownership: &mut Registry, key: &ObserverKey) -> Result<()> {
        let observer = match self.client.get_observer(key).await {
            Ok(observer) if observer.is_pending_deletion() => {
                debug!("Observer is being deleted");
                return self.depart(ownership, key).await;
            }
            Ok(observer) => observer,
            Err(e) if e.is_not_found() => {
                debug!("Observer no longer exists");
                return self.depart(ownership, key).await;
            }
            Err(e) => return Err(e),
        };

        let namespace = observer.target_namespace();
        if let Some(previous) = ownership
            .desired_namespace(key)
            .filter(|ns| *ns != namespace)
            .map(str::to_string)
        {
            info!(from = %previous, to = %namespace, "Target namespace changed");
            self.release(ownership, key, &previous).await?;
        }
        ownership.set_desired_namespace(key, &namespace);

        match ownership.active_owner(&namespace).cloned() {
            Some(owner) if owner == *key => {
                if let Some(controller) = ownership.controller(key) {
                    match controller.reconcile_now() {
                        Ok(()) => {
                            debug!(namespace = %namespace, "Forwarded to namespace controller");
                            return Ok(());
                        }
                        Err(e) => warn!(error = %e, "Namespace controller died, restarting"),
                    }
                }
                let (_, controller) = ownership.release(key);
                if let Some(mut controller) = controller {
                    controller.stop().await;
                }
                self.promote(ownership, &observer, Promotion::Claim).await
            }
            Some(owner) => self.mark_backup(ownership, &observer, &owner).await,
            None => self.promote(ownership, &observer, Promotion::Claim).await,
        }
    }

    /// Give up whatever `key` owns in `namespace` and elect a successor.
    ///
    /// The desired namespace stays recorded until the election succeeded, so
    /// a failed election is repeated on the next reconcile of `key`.
    async fn release(&self, ownership: &mut Registry, key: &ObserverKey, namespace: &str) -> Result<()> {
        let (released, controller) = ownership.release(key);
        if let Some(mut controller) = controller {
            controller.stop().await;
        }
        if let Some(released) = &released {
            info!(namespace = %released, "Released namespace");
        }
        if ownership.active_owner(namespace).is_none() {
            self.elect(ownership, namespace, key).await?;
        }
        Ok(())
    }

    /// Handle an observer that is gone or being deleted.
    async fn depart(&self, ownership: &mut Registry, key: &ObserverKey) -> Result<()> {
        let Some(namespace) = ownership.desired_namespace(key).map(str::to_string) else {
            debug!("Observer was never tracked");
            return Ok(());
        };
        let was_owner = ownership.is_active_owner(key);
        self.release(ownership, key, &namespace).await?;
        ownership.forget(key);
        if was_owner {
            info!(namespace = %namespace, "Active owner departed");
        }
        Ok(())
    }

    /// Promote the most specific candidate for an orphaned namespace.
    async fn elect(&self, ownership: &mut Registry, namespace: &str, departed: &ObserverKey) -> Result<()> {
        let observers = self.client.list_observers().await?;
        // Observers running a controller own another namespace; their own
        // reconcile moves them once the retargeting is observed.
        let winner = select_candidate(&observers, namespace, |key| {
            key != departed && ownership.controller(key).is_none()
        })
        .cloned();
        let Some(winner) = winner else {
            info!(namespace, "No candidate left, namespace stays unmanaged");
            return Ok(());
        };
        info!(namespace, candidate = %winner.key(), "Electing new owner");
        ownership.set_desired_namespace(&winner.key(), namespace);
        self.promote(ownership, &winner, Promotion::HandOff).await
    }

    /// Make `observer` the active owner of its target namespace.
    ///
    /// The cleared Backup condition is persisted before the maps change, so
    /// a failed write leaves the observer a candidate for the next attempt.
    async fn promote(&self, ownership: &mut Registry, observer: &SDIObserver, how: Promotion) -> Result<()> {
        let key = observer.key();
        let namespace = observer.target_namespace();
        self.write_backup(&key, false, &key).await?;

        let controller = NamespaceController::start(
            self.client.clone(),
            key.clone(),
            namespace.clone(),
            self.settings,
            self.health.clone(),
        );
        if let Err(mut controller) = ownership.insert_owner(&key, controller) {
            controller.stop().await;
            return Err(Error::Conflict(format!(
                "namespace {namespace} is already owned by another SDIObserver"
            )));
        }
        info!(observer = %key, namespace = %namespace, ?how, "Observer is now the active owner");

        let event = match how {
            Promotion::Claim => ObserverEvent::normal(
                event_reasons::PROMOTED,
                "Promote",
                format!("Became the active owner of namespace {namespace}"),
            ),
            Promotion::HandOff => {
                if let Some(health) = &self.health {
                    health.metrics.record_handoff(&namespace);
                }
                ObserverEvent::normal(
                    event_reasons::HAND_OFF,
                    "Promote",
                    format!("Took over namespace {namespace} after the previous owner departed"),
                )
            }
        };
        self.client.publish_event(observer, event).await;

        if let Some(controller) = ownership.controller(&key) {
            controller.reconcile_now()?;
        }
        self.refresh_backups(ownership, &namespace, &key).await;
        Ok(())
    }

    async fn mark_backup(&self, ownership: &mut Registry, observer: &SDIObserver, owner: &ObserverKey) -> Result<()> {
        let key = observer.key();
        let changed = self.write_backup(&key, true, owner).await?;
        ownership.mark_backup(&key);
        if changed {
            info!(owner = %owner, namespace = %observer.target_namespace(), "Namespace already managed, observer is a backup");
            self.client
                .publish_event(
                    observer,
                    ObserverEvent::normal(
                        event_reasons::BACKUP,
                        "Backup",
                        format!("Namespace {} is already managed by {owner}", observer.target_namespace()),
                    ),
                )
                .await;
        }
        Ok(())
    }

    /// Point the Backup message of the other candidates at the new owner.
    async fn refresh_backups(&self, ownership: &Registry, namespace: &str, active: &ObserverKey) {
        for backup in ownership.backups_for(namespace) {
            if backup == *active {
                continue;
            }
            if let Err(e) = self.write_backup(&backup, true, active).await {
                warn!(backup = %backup, error = %e, "Failed to refresh backup status");
            }
        }
    }

    /// Persist the Backup role of `key`. Returns whether anything was written.
    async fn write_backup(&self, key: &ObserverKey, backup: bool, active: &ObserverKey) -> Result<bool> {
        retry_on_conflict("backup condition", |_| {
            let client = self.client.clone();
            let key = key.clone();
            let active = active.clone();
            async move {
                let mut observer = client.get_observer(&key).await?;
                let mut status = observer.status.clone().unwrap_or_default();
                if !set_backup(&mut status, backup, &active, observer.metadata.generation) {
                    return Ok(false);
                }
                debug!(observer = %observer.name_any(), backup, "Writing backup condition");
                observer.status = Some(status);
                client.update_observer_status(&observer).await?;
                Ok(true)
            }
        })
        .await
    }

    /// Stop every namespace controller.
    pub async fn shutdown(&self) {
        let controllers = self.ownership.lock().await.drain_controllers();
        info!(count = controllers.len(), "Stopping namespace controllers");
        for (_, mut controller) in controllers {
            controller.stop().await;
        }
    }
}
