//! Cluster client seam.
//!
//! The reconcilers talk to the cluster only through [`ClusterApi`]. The
//! production implementation is [`KubeCluster`]; tests substitute an
//! in-memory cluster.
//!
//! ## Architecture
//!
//! - `kube_cluster`: `ClusterApi` over `kube::Api` plus the event recorder
//! - `watch`: per-namespace watch streams feeding a namespace controller

pub mod kube_cluster;
pub mod watch;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Secret, Service};

use crate::controller::error::Result;
use crate::crd::{ManagedReference, ObserverKey, Route, SDIObserver};

pub use kube_cluster::KubeCluster;

/// Change observed on a resource watched by a namespace controller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NamespaceEvent {
    /// Kind of the changed resource, e.g. `Route`.
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for NamespaceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Kubernetes event about an observer. All of them are of type Normal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObserverEvent {
    pub reason: &'static str,
    pub action: &'static str,
    pub note: String,
}

impl ObserverEvent {
    pub fn normal(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            reason,
            action,
            note: note.into(),
        }
    }
}

/// Event reasons published on observers.
pub mod event_reasons {
    pub const PROMOTED: &str = "Promoted";
    pub const BACKUP: &str = "Backup";
    pub const HAND_OFF: &str = "HandOff";
    pub const ROUTE_REPLACED: &str = "RouteReplaced";
}

/// Typed access to the resources the operator reads and writes.
///
/// Errors are classified by [`crate::controller::error::Error`]; in particular
/// a missing object yields `NotFound` and a stale write yields `Conflict`.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_observer(&self, key: &ObserverKey) -> Result<SDIObserver>;

    /// All observers visible to the operator.
    async fn list_observers(&self) -> Result<Vec<SDIObserver>>;

    /// Write the status sub-resource. The object's resourceVersion is
    /// checked, so a stale copy fails with `Conflict`.
    async fn update_observer_status(&self, observer: &SDIObserver) -> Result<SDIObserver>;

    /// Reference to the DataHub instance of a namespace; `NotFound` if none.
    async fn get_datahub(&self, namespace: &str) -> Result<ManagedReference>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    async fn get_route(&self, namespace: &str, name: &str) -> Result<Route>;

    async fn create_route(&self, route: &Route) -> Result<Route>;

    async fn replace_route(&self, route: &Route) -> Result<Route>;

    async fn delete_route(&self, namespace: &str, name: &str) -> Result<()>;

    /// Changes relevant to an observer managing `namespace`. Dropping the
    /// stream releases the underlying watches.
    fn watch_namespace(&self, namespace: &str) -> BoxStream<'static, NamespaceEvent>;

    /// Publish a Kubernetes event on the observer. Failures are only logged.
    async fn publish_event(&self, observer: &SDIObserver, event: ObserverEvent);
}
