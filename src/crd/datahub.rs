//! DataHub: the SDI installation instance managed by an observer.
//!
//! The resource is owned by the SDI installer; it is accessed dynamically and
//! never written.

use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};

use super::ManagedReference;

pub const DATAHUB_GROUP: &str = "installers.datahub.sap.com";
pub const DATAHUB_VERSION: &str = "v1alpha1";
pub const DATAHUB_KIND: &str = "DataHub";
pub const DATAHUB_PLURAL: &str = "datahubs";

/// Name of the instance preferred when a namespace holds several.
pub const DEFAULT_DATAHUB_NAME: &str = "default";

/// API resource descriptor for the dynamic DataHub API.
pub fn datahub_api_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(DATAHUB_GROUP, DATAHUB_VERSION, DATAHUB_KIND);
    ApiResource::from_gvk_with_plural(&gvk, DATAHUB_PLURAL)
}

/// Pick the instance to manage: `default` if present, otherwise the first by name.
pub fn pick_datahub(mut items: Vec<DynamicObject>) -> Option<DynamicObject> {
    if let Some(pos) = items
        .iter()
        .position(|dh| dh.name_any() == DEFAULT_DATAHUB_NAME)
    {
        return Some(items.swap_remove(pos));
    }
    items.sort_by_key(|dh| dh.name_any());
    items.into_iter().next()
}

/// Reference stored in the observer status for a DataHub instance.
pub fn datahub_reference(datahub: &DynamicObject) -> ManagedReference {
    ManagedReference {
        api_version: format!("{DATAHUB_GROUP}/{DATAHUB_VERSION}"),
        kind: DATAHUB_KIND.to_string(),
        namespace: datahub.namespace().unwrap_or_default(),
        name: datahub.name_any(),
        uid: datahub.uid(),
        resource_version: datahub.resource_version(),
    }
}
