//! Watch streams scoped to one SDI namespace.
//!
//! A namespace controller reacts to the DataHub instance, the vsystem
//! service, the CA bundle secret and the vsystem route. Services and secrets
//! are watched as metadata only.

use std::fmt::Debug;

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::DynamicObject;
use kube::runtime::{WatchStreamExt, metadata_watcher, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::warn;

use super::NamespaceEvent;
use crate::crd::{Route, datahub_api_resource};
use crate::resources::route::CA_BUNDLE_SECRET_NAME;

/// Label selector of the vsystem service.
pub const VSYSTEM_SERVICE_SELECTOR: &str =
    "datahub.sap.com/app=vsystem,datahub.sap.com/app-component=vsystem";

/// Translate a watcher event into a namespace event. Initial-list markers
/// carry no object and are skipped.
pub fn to_namespace_event<K: Resource>(
    kind: &'static str,
    event: watcher::Event<K>,
) -> Option<NamespaceEvent> {
    match event {
        watcher::Event::Apply(obj)
        | watcher::Event::InitApply(obj)
        | watcher::Event::Delete(obj) => Some(NamespaceEvent {
            kind,
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }),
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

fn into_events<K, S>(kind: &'static str, events: S) -> BoxStream<'static, NamespaceEvent>
where
    K: Resource + Send + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
{
    events
        .default_backoff()
        .filter_map(move |event| async move {
            match event {
                Ok(event) => to_namespace_event(kind, event),
                Err(e) => {
                    warn!(kind, error = %e, "Namespace watch failed, retrying");
                    None
                }
            }
        })
        .boxed()
}

fn object_events<K>(
    kind: &'static str,
    api: Api<K>,
    config: watcher::Config,
) -> BoxStream<'static, NamespaceEvent>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    into_events(kind, watcher(api, config))
}

fn metadata_events<K>(
    kind: &'static str,
    api: Api<K>,
    config: watcher::Config,
) -> BoxStream<'static, NamespaceEvent>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    into_events(kind, metadata_watcher(api, config))
}

/// Merged stream of every change relevant to the namespace's owner.
pub fn namespace_events(client: &Client, namespace: &str) -> BoxStream<'static, NamespaceEvent> {
    let datahubs: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), namespace, &datahub_api_resource());
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let routes: Api<Route> = Api::namespaced(client.clone(), namespace);

    stream::select_all(vec![
        object_events("DataHub", datahubs, watcher::Config::default()),
        metadata_events(
            "Service",
            services,
            watcher::Config::default().labels(VSYSTEM_SERVICE_SELECTOR),
        ),
        metadata_events(
            "Secret",
            secrets,
            watcher::Config::default().fields(&format!("metadata.name={CA_BUNDLE_SECRET_NAME}")),
        ),
        object_events("Route", routes, watcher::Config::default()),
    ])
    .boxed()
}
