//! Route recipe.
//!
//! Drives one route family (vsystem or SLC Bridge) towards the management
//! state declared on the observer and tracks whether the ingress controller
//! admitted it. Outcomes are written to the family's status block as
//! `Exposed` and `Degraded` conditions.
//!
//! | Declared state | Service | Action |
//! |----------------|---------|--------|
//! | Unmanaged | any | none |
//! | Removed | any | delete the route if present |
//! | Managed | absent | delete the route if present |
//! | Managed | present | create, update on diff, replace if the update is rejected |

use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::client::{ClusterApi, ObserverEvent, event_reasons};
use crate::controller::common::retry_on_conflict_with;
use crate::controller::conditions::Partials;
use crate::controller::error::{Error, Result};
use crate::controller::status::{find_condition, remove_condition, set_condition};
use crate::crd::{
    Condition, ConditionStatus, ConditionType, ManagedRouteSpec, ManagedRouteStatus,
    ManagementState, ObserverKey, Route, RouteSpec, RouteTargetReference, SDIObserver, TlsConfig,
    reasons,
};
use crate::resources::common::{
    HOST_GENERATED_ANNOTATION, copy_labels, owner_annotations, route_port, secret_value,
};

pub const CA_BUNDLE_SECRET_NAME: &str = "ca-bundle.pem";
pub const CA_BUNDLE_SECRET_KEY: &str = "ca-bundle.pem";
pub const ROUTE_TIMEOUT_ANNOTATION: &str = "haproxy.router.openshift.io/timeout";

const HOSTNAME_PATTERN: &str = r"^[[:alnum:]]+(-[[:alnum:]]+)*(\.[[:alnum:]]+(-[[:alnum:]]+)*)*$";

/// How the router terminates TLS for a route family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Termination {
    /// Re-encrypt towards the service, trusting the namespace's CA bundle.
    Reencrypt,
    /// Hand the TLS stream to the service untouched.
    Passthrough,
}

/// Static description of a route family.
#[derive(Clone, Copy, Debug)]
pub struct RouteTarget {
    /// Name used in messages.
    pub display: &'static str,
    /// Reason of the partial outcomes this family reports.
    pub reason: &'static str,
    pub route_name: &'static str,
    pub service_name: &'static str,
    pub port_name: &'static str,
    pub port_number: i32,
    pub termination: Termination,
    /// Service labels matching this pattern are copied to the route.
    pub label_pattern: Option<&'static str>,
    /// Router timeout annotation value.
    pub timeout: Option<&'static str>,
}

pub const VSYSTEM_ROUTE: RouteTarget = RouteTarget {
    display: "vsystem",
    reason: "VSystemRoute",
    route_name: "vsystem",
    service_name: "vsystem",
    port_name: "vsystem",
    port_number: 8797,
    termination: Termination::Reencrypt,
    label_pattern: Some(r"^datahub\.sap\.com/"),
    timeout: Some("2m"),
};

pub const SLCB_ROUTE: RouteTarget = RouteTarget {
    display: "SLC Bridge",
    reason: "SLCBRoute",
    route_name: "sap-slcbridge",
    service_name: "slcbridgebase-service",
    port_name: "slcbridge",
    port_number: 9000,
    termination: Termination::Passthrough,
    label_pattern: None,
    timeout: None,
};

/// Result of one pass of the route state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteOutcome {
    /// Left alone.
    Unmanaged,
    /// Absent, either as instructed or because the service is missing.
    Removed,
    /// Present and up to date.
    Managed,
    /// The declared spec cannot be acted upon.
    Rejected,
}

/// Write the family's `Exposed` and `Degraded` conditions.
fn set_route_conditions(
    status: &mut ManagedRouteStatus,
    exposed: ConditionStatus,
    degraded: ConditionStatus,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) {
    set_condition(
        &mut status.conditions,
        Condition::new(ConditionType::Exposed, exposed, reason, message, generation),
    );
    set_condition(
        &mut status.conditions,
        Condition::new(ConditionType::Degraded, degraded, reason, message, generation),
    );
}

/// Whether `host` is a syntactically valid DNS name.
pub fn is_valid_hostname(host: &str) -> Result<bool> {
    let re = Regex::new(HOSTNAME_PATTERN)
        .map_err(|e| Error::Validation(format!("invalid hostname pattern: {e}")))?;
    Ok(host.len() <= 253 && re.is_match(host))
}

/// Desired route for the family in `namespace`.
pub fn build_route(
    target: &RouteTarget,
    namespace: &str,
    owner: &ObserverKey,
    service: &Service,
    ca_bundle: Option<String>,
    hostname: Option<&str>,
) -> Result<Route> {
    let mut annotations = owner_annotations(owner);
    if let Some(timeout) = target.timeout {
        annotations.insert(ROUTE_TIMEOUT_ANNOTATION.to_string(), timeout.to_string());
    }
    let labels = match target.label_pattern {
        Some(pattern) => copy_labels(service, pattern)?,
        None => Default::default(),
    };
    let tls = match target.termination {
        Termination::Reencrypt => TlsConfig {
            termination: "reencrypt".to_string(),
            destination_ca_certificate: ca_bundle,
            insecure_edge_termination_policy: Some("Redirect".to_string()),
            ..Default::default()
        },
        Termination::Passthrough => TlsConfig {
            termination: "passthrough".to_string(),
            insecure_edge_termination_policy: Some("Redirect".to_string()),
            ..Default::default()
        },
    };

    Ok(Route {
        metadata: ObjectMeta {
            name: Some(target.route_name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(annotations),
            labels: Some(labels),
            ..Default::default()
        },
        spec: RouteSpec {
            host: hostname.unwrap_or_default().to_string(),
            to: RouteTargetReference::service(target.service_name),
            port: route_port(service, target.port_name, target.port_number),
            tls: Some(tls),
            wildcard_policy: None,
        },
        status: None,
    })
}

/// Bring `current` in line with `desired`, returning the names of the
/// fields that changed. Fields the operator does not own are kept.
pub fn update_route(current: &mut Route, desired: &Route) -> Vec<&'static str> {
    let mut updated = Vec::new();

    let desired_annotations = desired.annotations().clone();
    let annotations = current.annotations_mut();
    for (key, value) in desired_annotations {
        if annotations.get(&key) != Some(&value) {
            annotations.insert(key, value);
            if !updated.contains(&"annotations") {
                updated.push("annotations");
            }
        }
    }

    if current.labels() != desired.labels() {
        *current.labels_mut() = desired.labels().clone();
        updated.push("labels");
    }

    if current.owner_references() != desired.owner_references() {
        current.metadata.owner_references = desired.metadata.owner_references.clone();
        updated.push("ownerReferences");
    }

    if current.spec.port != desired.spec.port {
        current.spec.port = desired.spec.port.clone();
        updated.push("port");
    }

    if current.spec.tls != desired.spec.tls {
        current.spec.tls = desired.spec.tls.clone();
        updated.push("tls");
    }

    let generated = current
        .annotations()
        .get(HOST_GENERATED_ANNOTATION)
        .is_some_and(|v| v == "true");
    let wants_host = !desired.spec.host.is_empty();
    if (current.spec.host != desired.spec.host && (wants_host || !generated))
        || (wants_host && generated)
    {
        current.annotations_mut().remove(HOST_GENERATED_ANNOTATION);
        current.spec.host = desired.spec.host.clone();
        updated.push("host");
    }

    if current.spec.to.kind != desired.spec.to.kind || current.spec.to.name != desired.spec.to.name
    {
        current.spec.to.kind = desired.spec.to.kind.clone();
        current.spec.to.name = desired.spec.to.name.clone();
        updated.push("to");
    }

    updated
}

/// Record admission of an up-to-date route.
///
/// An un-admitted route is reported `Exposed=Unknown/NotAdmitted` first and
/// escalated to `Exposed=False` with `Degraded=True` once it stayed
/// un-admitted for longer than `grace`. Once escalated it stays escalated
/// until admitted.
pub fn track_admission(
    status: &mut ManagedRouteStatus,
    route: &Route,
    now: jiff::Timestamp,
    grace: Duration,
    generation: Option<i64>,
) {
    if route.is_admitted() {
        set_route_conditions(
            status,
            ConditionStatus::True,
            ConditionStatus::False,
            reasons::ADMITTED,
            "the route is up to date and admitted",
            generation,
        );
        return;
    }

    let message = "the route is up to date but has not been admitted";
    let exposed = find_condition(&status.conditions, ConditionType::Exposed).cloned();
    match exposed {
        Some(c) if c.reason == reasons::NOT_ADMITTED => {
            let elapsed = c
                .transition_time()
                .map(|since| now.as_second() - since.as_second());
            let grace_secs = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
            if c.status == ConditionStatus::False || elapsed.is_some_and(|e| e > grace_secs) {
                set_route_conditions(
                    status,
                    ConditionStatus::False,
                    ConditionStatus::True,
                    reasons::NOT_ADMITTED,
                    &format!("{message} for more than {}s", grace.as_secs()),
                    generation,
                );
            } else {
                set_route_conditions(
                    status,
                    ConditionStatus::Unknown,
                    ConditionStatus::False,
                    reasons::NOT_ADMITTED,
                    message,
                    generation,
                );
            }
        }
        _ => mark_not_admitted(status, generation),
    }
}

/// Start the admission clock.
fn mark_not_admitted(status: &mut ManagedRouteStatus, generation: Option<i64>) {
    // Restart the transition time even if the previous status was Unknown.
    remove_condition(&mut status.conditions, ConditionType::Exposed);
    set_route_conditions(
        status,
        ConditionStatus::Unknown,
        ConditionStatus::False,
        reasons::NOT_ADMITTED,
        "the route is up to date but has not been admitted",
        generation,
    );
}

/// Partial outcomes of a route family for the observer-level conditions.
pub fn route_partials(
    target: &RouteTarget,
    outcome: &Result<RouteOutcome>,
    status: &ManagedRouteStatus,
) -> Partials {
    let mut partials = Partials::default();
    let route_degraded = find_condition(&status.conditions, ConditionType::Degraded)
        .filter(|c| c.status == ConditionStatus::True)
        .map(|c| c.message.clone());
    let exposed = find_condition(&status.conditions, ConditionType::Exposed);

    let outcome = match outcome {
        Ok(outcome) => *outcome,
        Err(e) => {
            let message = format!("failed to reconcile {} route: {e}", target.display);
            partials.ready(ConditionStatus::False, target.reason, message.clone());
            partials.degraded(
                ConditionStatus::True,
                target.reason,
                route_degraded.unwrap_or(message),
            );
            return partials;
        }
    };

    if outcome == RouteOutcome::Rejected {
        let message = route_degraded.unwrap_or_default();
        partials.ready(ConditionStatus::False, target.reason, message.clone());
        partials.progressing(ConditionStatus::False, target.reason, "");
        partials.degraded(ConditionStatus::True, target.reason, message);
        return partials;
    }

    let not_admitted = exposed.filter(|c| c.reason == reasons::NOT_ADMITTED);
    let stuck = not_admitted.is_some_and(|c| c.status == ConditionStatus::False);
    let waiting = not_admitted.is_some_and(|c| c.status == ConditionStatus::Unknown);

    if stuck {
        partials.ready(
            ConditionStatus::False,
            target.reason,
            format!("{} route has not been admitted", target.display),
        );
    } else {
        partials.ready(ConditionStatus::True, reasons::AS_EXPECTED, "");
    }

    if waiting {
        partials.progressing(
            ConditionStatus::True,
            target.reason,
            format!("waiting for {} route to be admitted", target.display),
        );
    } else {
        let message = match outcome {
            RouteOutcome::Managed => format!("{} route is up to date", target.display),
            RouteOutcome::Removed => format!("{} route is removed", target.display),
            _ => format!("{} route is not managed", target.display),
        };
        partials.progressing(ConditionStatus::False, target.reason, message);
    }

    match route_degraded {
        Some(message) => partials.degraded(ConditionStatus::True, target.reason, message),
        None => partials.degraded(ConditionStatus::False, target.reason, ""),
    }
    partials
}

/// Reconciles one route family on behalf of an active observer.
pub struct RouteRecipe<'a> {
    client: &'a dyn ClusterApi,
    owner: &'a SDIObserver,
    target: &'a RouteTarget,
    namespace: &'a str,
    admission_grace: Duration,
}

impl<'a> RouteRecipe<'a> {
    pub fn new(
        client: &'a dyn ClusterApi,
        owner: &'a SDIObserver,
        target: &'a RouteTarget,
        namespace: &'a str,
        admission_grace: Duration,
    ) -> Self {
        Self {
            client,
            owner,
            target,
            namespace,
            admission_grace,
        }
    }

    fn generation(&self) -> Option<i64> {
        self.owner.metadata.generation
    }

    fn set(
        &self,
        status: &mut ManagedRouteStatus,
        exposed: ConditionStatus,
        degraded: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        set_route_conditions(status, exposed, degraded, reason, message, self.generation());
    }

    /// Run the state machine for `spec`, recording conditions in `status`.
    pub async fn reconcile(
        &self,
        spec: &ManagedRouteSpec,
        status: &mut ManagedRouteStatus,
    ) -> Result<RouteOutcome> {
        let display = self.target.display;
        let state = match spec.state() {
            Ok(state) => state,
            Err(value) => {
                let message = format!("unsupported management state {value:?} of the {display} route");
                warn!(namespace = %self.namespace, route = self.target.route_name, %message);
                self.set(
                    status,
                    ConditionStatus::Unknown,
                    ConditionStatus::True,
                    reasons::ROUTE_MANAGEMENT_STATE_UNSUPPORTED,
                    &message,
                );
                return Ok(RouteOutcome::Rejected);
            }
        };

        if state == ManagementState::Unmanaged {
            debug!(namespace = %self.namespace, route = self.target.route_name, "Route is not managed");
            self.set(
                status,
                ConditionStatus::Unknown,
                ConditionStatus::False,
                reasons::UNMANAGED,
                &format!("the {display} route is not managed by this SDIObserver instance"),
            );
            return Ok(RouteOutcome::Unmanaged);
        }

        if let Some(host) = spec.requested_hostname()
            && !is_valid_hostname(host)?
        {
            self.set(
                status,
                ConditionStatus::Unknown,
                ConditionStatus::True,
                reasons::INVALID_HOSTNAME,
                &format!("invalid hostname {host:?} requested for the {display} route"),
            );
            return Ok(RouteOutcome::Rejected);
        }

        let service = match self
            .client
            .get_service(self.namespace, self.target.service_name)
            .await
        {
            Ok(service) => Some(service),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                self.set(
                    status,
                    ConditionStatus::Unknown,
                    ConditionStatus::True,
                    reasons::FAILED_GET,
                    &format!("failed to get {display} service: {e}"),
                );
                return Err(e);
            }
        };

        let service = service.as_ref();
        let hostname = spec.requested_hostname();
        retry_on_conflict_with(self.target.route_name, status, |_, mut status| async move {
            let result = self.apply(state, service, hostname, &mut status).await;
            (status, result)
        })
        .await
    }

    async fn apply(
        &self,
        state: ManagementState,
        service: Option<&Service>,
        hostname: Option<&str>,
        status: &mut ManagedRouteStatus,
    ) -> Result<RouteOutcome> {
        let display = self.target.display;
        let name = self.target.route_name;
        let existing = match self.client.get_route(self.namespace, name).await {
            Ok(route) => Some(route),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                self.set(
                    status,
                    ConditionStatus::Unknown,
                    ConditionStatus::True,
                    reasons::FAILED_GET,
                    &format!("failed to get {display} route: {e}"),
                );
                return Err(e);
            }
        };

        let Some(service) = service.filter(|_| state == ManagementState::Managed) else {
            let cause = if service.is_none() {
                "due to missing service"
            } else {
                "as instructed"
            };
            return self.remove(existing.is_some(), cause, status).await;
        };

        let ca_bundle = match self.target.termination {
            Termination::Reencrypt => Some(self.read_ca_bundle(status).await?),
            Termination::Passthrough => None,
        };
        let desired = build_route(
            self.target,
            self.namespace,
            &self.owner.key(),
            service,
            ca_bundle,
            hostname,
        )?;

        let Some(mut current) = existing else {
            info!(namespace = %self.namespace, route = name, "Creating route");
            let created = self
                .client
                .create_route(&desired)
                .await
                .inspect_err(|e| self.record_write_failure(status, reasons::FAILED_CREATE, e))?;
            self.record_written(status, &created);
            return Ok(RouteOutcome::Managed);
        };

        let updated = update_route(&mut current, &desired);
        if updated.is_empty() {
            debug!(namespace = %self.namespace, route = name, hosts = ?current.admitted_hosts(), "Route is up to date");
            track_admission(
                status,
                &current,
                jiff::Timestamp::now(),
                self.admission_grace,
                self.generation(),
            );
            return Ok(RouteOutcome::Managed);
        }

        info!(namespace = %self.namespace, route = name, fields = %updated.join(","), "Updating route");
        match self.client.replace_route(&current).await {
            Ok(route) => {
                self.record_written(status, &route);
                Ok(RouteOutcome::Managed)
            }
            Err(e) if e.is_invalid() => {
                info!(namespace = %self.namespace, route = name, error = %e, "Route update refused, replacing instead");
                self.replace(&desired, status).await
            }
            Err(e) => {
                self.record_write_failure(status, reasons::FAILED_UPDATE, &e);
                Err(e)
            }
        }
    }

    /// Delete and recreate after an update touching an immutable field was refused.
    async fn replace(&self, desired: &Route, status: &mut ManagedRouteStatus) -> Result<RouteOutcome> {
        let name = desired.name_any();
        match self.client.delete_route(self.namespace, &name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                self.record_write_failure(status, reasons::FAILED_DELETE, &e);
                return Err(e);
            }
        }
        let created = self
            .client
            .create_route(desired)
            .await
            .inspect_err(|e| self.record_write_failure(status, reasons::FAILED_CREATE, e))?;
        self.client
            .publish_event(
                self.owner,
                ObserverEvent::normal(
                    event_reasons::ROUTE_REPLACED,
                    "Replace",
                    format!(
                        "{} route {}/{name} was recreated after its update was refused",
                        self.target.display, self.namespace
                    ),
                ),
            )
            .await;
        self.record_written(status, &created);
        Ok(RouteOutcome::Managed)
    }

    async fn remove(
        &self,
        exists: bool,
        cause: &str,
        status: &mut ManagedRouteStatus,
    ) -> Result<RouteOutcome> {
        let display = self.target.display;
        let message = format!("{display} route is removed {cause}");
        if exists {
            info!(namespace = %self.namespace, route = self.target.route_name, cause, "Deleting route");
            match self
                .client
                .delete_route(self.namespace, self.target.route_name)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    self.record_write_failure(status, reasons::FAILED_DELETE, &e);
                    return Err(e);
                }
            }
        } else {
            debug!(namespace = %self.namespace, route = self.target.route_name, "Route already removed");
        }
        self.set(
            status,
            ConditionStatus::False,
            ConditionStatus::False,
            reasons::REMOVED,
            &message,
        );
        Ok(RouteOutcome::Removed)
    }

    async fn read_ca_bundle(&self, status: &mut ManagedRouteStatus) -> Result<String> {
        let secret = self
            .client
            .get_secret(self.namespace, CA_BUNDLE_SECRET_NAME)
            .await
            .inspect_err(|e| {
                let reason = if e.is_not_found() {
                    reasons::MISSING_CA_BUNDLE
                } else {
                    reasons::FAILED_GET
                };
                self.set(
                    status,
                    ConditionStatus::Unknown,
                    ConditionStatus::True,
                    reason,
                    &format!("failed to get {CA_BUNDLE_SECRET_NAME} secret: {e}"),
                );
            })?;
        secret_value(&secret, CA_BUNDLE_SECRET_KEY).inspect_err(|e| {
            self.set(
                status,
                ConditionStatus::Unknown,
                ConditionStatus::True,
                reasons::MISSING_CA_BUNDLE,
                &e.to_string(),
            );
        })
    }

    fn record_written(&self, status: &mut ManagedRouteStatus, route: &Route) {
        if route.is_admitted() {
            track_admission(
                status,
                route,
                jiff::Timestamp::now(),
                self.admission_grace,
                self.generation(),
            );
        } else {
            mark_not_admitted(status, self.generation());
        }
    }

    fn record_write_failure(&self, status: &mut ManagedRouteStatus, reason: &str, err: &Error) {
        // Conflicts are retried; the next attempt records the outcome.
        if err.is_conflict() {
            return;
        }
        self.set(
            status,
            ConditionStatus::Unknown,
            ConditionStatus::True,
            reason,
            &format!("failed to write {} route: {err}", self.target.display),
        );
    }
}
