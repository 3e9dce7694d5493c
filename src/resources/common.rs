//! Common resource generation utilities.
//!
//! Routes live in namespaces other than the owning observer, so owner
//! references cannot be used. Ownership is recorded with annotations instead.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use regex::Regex;

use crate::controller::error::{Error, Result};
use crate::crd::{ObserverKey, RoutePort};

/// Annotation naming the owning observer as `{namespace}/{name}`.
pub const PRIMARY_RESOURCE_ANNOTATION: &str = "operator-sdk/primary-resource";
/// Annotation naming the owner's type as `{kind}.{group}`.
pub const PRIMARY_RESOURCE_TYPE_ANNOTATION: &str = "operator-sdk/primary-resource-type";
/// Value of [`PRIMARY_RESOURCE_TYPE_ANNOTATION`].
pub const PRIMARY_RESOURCE_TYPE: &str = "SDIObserver.di.sap-cop.redhat.com";
/// Set by the router when it generated the host of a route.
pub const HOST_GENERATED_ANNOTATION: &str = "openshift.io/host.generated";

/// Annotations linking a resource to its owning observer.
pub fn owner_annotations(owner: &ObserverKey) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PRIMARY_RESOURCE_ANNOTATION.to_string(), owner.to_string()),
        (
            PRIMARY_RESOURCE_TYPE_ANNOTATION.to_string(),
            PRIMARY_RESOURCE_TYPE.to_string(),
        ),
    ])
}

/// Labels of `service` whose keys match `pattern`.
pub fn copy_labels(service: &Service, pattern: &str) -> Result<BTreeMap<String, String>> {
    let re = Regex::new(pattern)
        .map_err(|e| Error::Validation(format!("invalid label pattern {pattern}: {e}")))?;
    Ok(service
        .labels()
        .iter()
        .filter(|(key, _)| re.is_match(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect())
}

/// Route port for the service port named `port_name`, or the TCP port `port_number`.
pub fn route_port(service: &Service, port_name: &str, port_number: i32) -> Option<RoutePort> {
    let ports = service.spec.as_ref()?.ports.as_ref()?;
    ports
        .iter()
        .find(|p| {
            p.name.as_deref() == Some(port_name)
                || (p.port == port_number && p.protocol.as_deref().unwrap_or("TCP") == "TCP")
        })
        .map(|p| RoutePort {
            target_port: match &p.name {
                Some(name) if !name.is_empty() => IntOrString::String(name.clone()),
                _ => IntOrString::Int(p.port),
            },
        })
}

/// PEM bundle stored under `key` in the secret, trimmed.
pub fn secret_value(secret: &Secret, key: &str) -> Result<String> {
    let value = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).trim().to_string())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|s| s.trim().to_string())
        });
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Validation(format!(
            "failed to find key \"{key}\" in \"{}\" secret",
            secret.name_any()
        ))),
    }
}
