//! [`ClusterApi`] implementation backed by the Kubernetes API.

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt};

use super::{ClusterApi, NamespaceEvent, ObserverEvent, watch};
use crate::controller::error::{Error, Result};
use crate::crd::{
    ManagedReference, ObserverKey, Route, SDIObserver, datahub_api_resource, datahub_reference,
    pick_datahub,
};

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "sdi-observer-operator";

/// Cluster access through a kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    /// Namespace the observer watch is restricted to, if any
    watch_namespace: Option<String>,
    reporter: Reporter,
}

impl KubeCluster {
    pub fn new(client: Client, watch_namespace: Option<String>, instance: Option<String>) -> Self {
        let instance = instance.or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
        });
        Self {
            client,
            watch_namespace,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance,
            },
        }
    }

    fn observers(&self, namespace: &str) -> Api<SDIObserver> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn routes(&self, namespace: &str) -> Api<Route> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }
}

fn route_namespace(route: &Route) -> Result<String> {
    route
        .namespace()
        .ok_or_else(|| Error::Validation(format!("route {} has no namespace", route.name_any())))
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_observer(&self, key: &ObserverKey) -> Result<SDIObserver> {
        Ok(self.observers(&key.namespace).get(&key.name).await?)
    }

    async fn list_observers(&self) -> Result<Vec<SDIObserver>> {
        let api: Api<SDIObserver> = match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_observer_status(&self, observer: &SDIObserver) -> Result<SDIObserver> {
        let key = observer.key();
        // Carrying the resourceVersion makes the API server reject stale writes.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": observer.resource_version() },
            "status": observer.status,
        });
        Ok(self
            .observers(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?)
    }

    async fn get_datahub(&self, namespace: &str) -> Result<ManagedReference> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &datahub_api_resource());
        let items = api.list(&ListParams::default()).await?.items;
        pick_datahub(items)
            .map(|dh| datahub_reference(&dh))
            .ok_or_else(|| Error::NotFound(format!("no DataHub instance in namespace {namespace}")))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_route(&self, namespace: &str, name: &str) -> Result<Route> {
        Ok(self.routes(namespace).get(name).await?)
    }

    async fn create_route(&self, route: &Route) -> Result<Route> {
        let ns = route_namespace(route)?;
        Ok(self
            .routes(&ns)
            .create(&PostParams::default(), route)
            .await?)
    }

    async fn replace_route(&self, route: &Route) -> Result<Route> {
        let ns = route_namespace(route)?;
        Ok(self
            .routes(&ns)
            .replace(&route.name_any(), &PostParams::default(), route)
            .await?)
    }

    async fn delete_route(&self, namespace: &str, name: &str) -> Result<()> {
        self.routes(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    fn watch_namespace(&self, namespace: &str) -> BoxStream<'static, NamespaceEvent> {
        watch::namespace_events(&self.client, namespace)
    }

    async fn publish_event(&self, observer: &SDIObserver, event: ObserverEvent) {
        let object_ref = observer.object_ref(&());
        if let Err(e) = self
            .recorder()
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: event.reason.into(),
                    note: Some(event.note),
                    action: event.action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %event.reason, error = %e, "Failed to publish event");
        }
    }
}
