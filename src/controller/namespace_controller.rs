//! Lifecycle of a per-namespace controller.
//!
//! A controller owns the watch streams of one target namespace and a worker
//! task that reconciles the owning observer. Watch events, pushes from the
//! arbitration reconciler, timed re-checks and the periodic resync all feed
//! the same worker, so reconciles of a namespace never overlap. Triggers
//! arriving while a reconcile runs are coalesced into one follow-up pass.
//!
//! ```text
//!   watch_namespace ──┐
//!   reconcile_now ────┼──▶ worker ──▶ NamespaceReconciler::reconcile
//!   requeue / resync ─┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, Fuse};
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ClusterApi, NamespaceEvent};
use crate::config::ControllerSettings;
use crate::controller::error::{Error, Result};
use crate::controller::namespace_reconciler::NamespaceReconciler;
use crate::crd::ObserverKey;
use crate::health::HealthState;

/// Handle of a running namespace controller.
pub struct NamespaceController {
    key: ObserverKey,
    namespace: String,
    intake: mpsc::Sender<()>,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl NamespaceController {
    /// Subscribe to the namespace's watches and spawn the worker.
    ///
    /// Nothing is reconciled until the first trigger arrives; callers push
    /// the initial pass with [`NamespaceController::reconcile_now`].
    pub fn start(
        client: Arc<dyn ClusterApi>,
        key: ObserverKey,
        namespace: String,
        settings: ControllerSettings,
        health: Option<Arc<HealthState>>,
    ) -> Self {
        let (intake, requests) = mpsc::channel(1);
        let (shutdown, stop) = oneshot::channel();
        let events = client.watch_namespace(&namespace).fuse();
        let reconciler =
            NamespaceReconciler::new(client, key.clone(), namespace.clone(), settings);

        info!(observer = %key, namespace = %namespace, "Starting namespace controller");
        let worker = tokio::spawn(
            Worker {
                reconciler,
                requests,
                events,
                stop,
                resync_interval: settings.resync_interval,
                health,
            }
            .run(),
        );

        Self {
            key,
            namespace,
            intake,
            shutdown: Some(shutdown),
            worker: Some(worker),
        }
    }

    pub fn key(&self) -> &ObserverKey {
        &self.key
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Request a reconcile of the owning observer.
    ///
    /// A request made while another one is queued is merged into it.
    pub fn reconcile_now(&self) -> Result<()> {
        match self.intake.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => Ok(()),
            Err(TrySendError::Closed(())) => Err(Error::ControllerStopped(self.namespace.clone())),
        }
    }

    /// Whether the worker is still alive.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Cancel the watches, close the intake and wait for the worker to exit.
    /// Stopping a stopped controller does nothing.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if let Some(shutdown) = self.shutdown.take() {
            // The worker may already be gone; then there is nobody to tell.
            let _ = shutdown.send(());
        }
        if let Err(e) = worker.await
            && !e.is_cancelled()
        {
            warn!(observer = %self.key, namespace = %self.namespace, error = %e, "Namespace controller worker failed");
        }
        info!(observer = %self.key, namespace = %self.namespace, "Stopped namespace controller");
    }
}

impl fmt::Debug for NamespaceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceController")
            .field("key", &self.key)
            .field("namespace", &self.namespace)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for NamespaceController {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

struct Worker {
    reconciler: NamespaceReconciler,
    requests: mpsc::Receiver<()>,
    events: Fuse<BoxStream<'static, NamespaceEvent>>,
    stop: oneshot::Receiver<()>,
    resync_interval: Duration,
    health: Option<Arc<HealthState>>,
}

impl Worker {
    async fn run(mut self) {
        let period = self.resync_interval.max(Duration::from_secs(1));
        let mut resync = tokio::time::interval_at(Instant::now() + period, period);
        let mut requeue_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = &mut self.stop => break,
                request = self.requests.recv() => {
                    if request.is_none() {
                        break;
                    }
                    debug!(observer = %self.reconciler.key(), "Reconcile requested");
                }
                Some(event) = self.events.next() => {
                    debug!(observer = %self.reconciler.key(), %event, "Watched resource changed");
                }
                () = tokio::time::sleep_until(requeue_at.unwrap_or_else(Instant::now)), if requeue_at.is_some() => {
                    debug!(observer = %self.reconciler.key(), "Timed re-check");
                }
                _ = resync.tick() => {
                    debug!(observer = %self.reconciler.key(), "Periodic resync");
                }
            }
            self.coalesce();

            let started = Instant::now();
            let result = tokio::select! {
                _ = &mut self.stop => break,
                result = self.reconciler.reconcile() => result,
            };
            requeue_at = self.record(result, started);
        }
        debug!(observer = %self.reconciler.key(), namespace = %self.reconciler.namespace(), "Namespace controller worker exited");
    }

    /// Drop triggers that are already queued; the coming pass covers them.
    fn coalesce(&mut self) {
        while self.requests.try_recv().is_ok() {}
        while let Some(Some(_)) = self.events.next().now_or_never() {}
    }

    fn record(&self, result: Result<Option<Duration>>, started: Instant) -> Option<Instant> {
        let key = self.reconciler.key();
        let elapsed = started.elapsed();
        match result {
            Ok(requeue) => {
                debug!(observer = %key, duration = ?elapsed, "Namespace reconcile finished");
                if let Some(health) = &self.health {
                    health
                        .metrics
                        .record_reconcile(&key.namespace, &key.name, elapsed.as_secs_f64());
                    health.touch_reconcile();
                }
                requeue.map(|delay| Instant::now() + delay)
            }
            Err(e) => {
                warn!(observer = %key, error = %e, "Namespace reconcile failed");
                if let Some(health) = &self.health {
                    health.metrics.record_error(&key.namespace, &key.name);
                }
                Some(Instant::now() + e.requeue_after())
            }
        }
    }
}
