//! sdi-observer-operator library crate
//!
//! This module exports the arbitration controller, the CRD definitions, the
//! cluster client seam and the route recipes.

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use client::{ClusterApi, KubeCluster};
pub use config::OperatorConfig;
pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use controller::context::Context;
use controller::reconciler::{error_policy, reconcile};
use crd::{ObserverKey, SDIObserver};

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Create the default watcher configuration.
///
/// - `any_semantic()`: More reliable resource discovery in test environments
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Reflector-backed stream of SDIObserver changes.
///
/// Deletions are kept in the stream: the controller then fails to find the
/// object in the store and reports `ObjectNotFound`, which is how departed
/// owners reach the arbiter. Status-only updates are not filtered because a
/// changed Backup condition must be seen by the arbiter.
fn observer_stream(
    api: Api<SDIObserver>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<SDIObserver>,
    impl Stream<Item = Result<SDIObserver, watcher::Error>>,
) {
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .touched_objects();
    (reader, stream)
}

/// Run the operator controller with the scope of `config`.
///
/// Returns after a shutdown signal once every namespace controller stopped.
pub async fn run_controller(
    client: Client,
    config: &OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    run_controller_scoped(client, config, health_state, config.watch_namespace.as_deref()).await
}

/// Run the operator controller with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only SDIObservers in that namespace are
/// watched. Target namespaces of the observers are not restricted.
pub async fn run_controller_scoped(
    client: Client,
    config: &OperatorConfig,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    info!(
        "Starting controller for SDIObserver resources (scope: {})",
        scope_msg
    );

    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(
        client.clone(),
        namespace.map(str::to_string),
        config.pod_name.clone(),
    ));
    let ctx = Arc::new(Context::new(cluster, config.controller, health_state.clone()));

    let observers: Api<SDIObserver> = scoped_api(client, namespace);
    let (reader, observer_stream) = observer_stream(observers, default_watcher_config());

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    Controller::for_stream(observer_stream, reader)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| {
            let ctx = ctx.clone();
            async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled: {}", obj.name);
                    }
                    // A deleted observer is gone from the store before its
                    // reconcile runs; the arbiter still has to release it.
                    Err(kube::runtime::controller::Error::ObjectNotFound(obj_ref)) => {
                        let key = ObserverKey::new(
                            obj_ref.namespace.clone().unwrap_or_default(),
                            obj_ref.name.clone(),
                        );
                        debug!(observer = %key, "SDIObserver deleted");
                        if let Err(e) = ctx.arbiter.reconcile(&key).await {
                            warn!(observer = %key, error = %e, "Failed to release deleted SDIObserver");
                        }
                    }
                    Err(kube::runtime::controller::Error::ReconcilerFailed(err, obj_ref))
                        if err.is_not_found() =>
                    {
                        debug!("Object no longer exists (likely deleted): {}", obj_ref.name);
                    }
                    Err(e) => {
                        error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    if let Some(ref state) = health_state {
        state.set_ready(false).await;
    }
    ctx.arbiter.shutdown().await;
    info!("Controller stopped");
}
