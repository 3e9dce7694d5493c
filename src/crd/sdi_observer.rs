//! SDIObserver Custom Resource Definition.
//!
//! An SDIObserver declares which SAP Data Intelligence namespace it wants to
//! manage and how the routes exposing that installation should be handled.
//! Several observers may point at the same namespace; only one of them is the
//! active owner at a time, the others report themselves as `Backup`.

use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// SDIObserver is a custom resource observing one SDI namespace.
///
/// Example:
/// ```yaml
/// apiVersion: di.sap-cop.redhat.com/v1alpha1
/// kind: SDIObserver
/// metadata:
///   name: sdi-observer
///   namespace: sdi-observer
/// spec:
///   sdiNamespace: sdi
///   vsystemRoute:
///     managementState: Managed
///     hostname: vsystem.apps.example.com
///   slcbRoute:
///     managementState: Removed
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "di.sap-cop.redhat.com",
    version = "v1alpha1",
    kind = "SDIObserver",
    plural = "sdiobservers",
    shortname = "sdiobs",
    status = "SDIObserverStatus",
    namespaced,
    printcolumn = r#"{"name":"SDI Namespace", "type":"string", "jsonPath":".spec.sdiNamespace"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Backup", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Backup\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SDIObserverSpec {
    /// Namespace of the SDI installation. Defaults to the observer's own namespace.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sdi_namespace: String,

    /// Namespace of the SAP Software Lifecycle Bridge.
    #[serde(default = "default_slcb_namespace")]
    pub slcb_namespace: String,

    /// Route exposing the vsystem service of the SDI installation.
    #[serde(default)]
    pub vsystem_route: ManagedRouteSpec,

    /// Route exposing the SLC Bridge service.
    #[serde(default = "ManagedRouteSpec::unmanaged")]
    pub slcb_route: ManagedRouteSpec,
}

impl Default for SDIObserverSpec {
    fn default() -> Self {
        Self {
            sdi_namespace: String::new(),
            slcb_namespace: default_slcb_namespace(),
            vsystem_route: ManagedRouteSpec::default(),
            slcb_route: ManagedRouteSpec::unmanaged(),
        }
    }
}

fn default_slcb_namespace() -> String {
    "sap-slcbridge".to_string()
}

/// Desired handling of one route family.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedRouteSpec {
    /// One of Managed, Unmanaged or Removed (case-insensitive).
    #[serde(default = "default_management_state")]
    pub management_state: String,

    /// Custom host for the route. A generated host is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl Default for ManagedRouteSpec {
    fn default() -> Self {
        Self {
            management_state: default_management_state(),
            hostname: None,
        }
    }
}

impl ManagedRouteSpec {
    /// A route spec left alone by the operator.
    pub fn unmanaged() -> Self {
        Self {
            management_state: "Unmanaged".to_string(),
            hostname: None,
        }
    }

    /// Parsed management state, or the offending value when unsupported.
    pub fn state(&self) -> Result<ManagementState, String> {
        self.management_state.parse()
    }

    /// Requested hostname, ignoring empty values.
    pub fn requested_hostname(&self) -> Option<&str> {
        self.hostname
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
    }
}

fn default_management_state() -> String {
    "Managed".to_string()
}

/// Management state of a managed sub-resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ManagementState {
    /// The operator creates and keeps the resource up to date.
    Managed,
    /// The operator does not touch the resource.
    Unmanaged,
    /// The operator deletes the resource if present.
    Removed,
}

impl std::str::FromStr for ManagementState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unmanaged") {
            Ok(ManagementState::Unmanaged)
        } else if trimmed.eq_ignore_ascii_case("managed") {
            Ok(ManagementState::Managed)
        } else if trimmed.eq_ignore_ascii_case("removed") || trimmed.eq_ignore_ascii_case("remove")
        {
            Ok(ManagementState::Removed)
        } else {
            Err(value.to_string())
        }
    }
}

impl fmt::Display for ManagementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagementState::Managed => write!(f, "Managed"),
            ManagementState::Unmanaged => write!(f, "Unmanaged"),
            ManagementState::Removed => write!(f, "Removed"),
        }
    }
}

/// Status of an SDIObserver.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SDIObserverStatus {
    /// Consolidated conditions: Ready, Degraded, Progressing and Backup.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// DataHub instance currently managed by this observer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_data_hub_ref: Option<ManagedReference>,

    /// Conditions of the vsystem route.
    #[serde(default)]
    pub vsystem_route: ManagedRouteStatus,

    /// Conditions of the SLC Bridge route.
    #[serde(default)]
    pub slcb_route: ManagedRouteStatus,
}

/// Conditions of one route family (Exposed, Degraded).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedRouteStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Reference to the managed application instance.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedReference {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Status value of a condition.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Condition describes one aspect of the observer's state.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition.
    pub status: ConditionStatus,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    #[serde(default)]
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition stamped with the current time.
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Parsed transition time, if well formed.
    pub fn transition_time(&self) -> Option<jiff::Timestamp> {
        self.last_transition_time.parse().ok()
    }
}

/// Types of conditions written by the operator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConditionType {
    /// The observed installation is fully handled.
    Ready,
    /// Something needs human attention.
    Degraded,
    /// The operator is still converging.
    Progressing,
    /// Another observer is the active owner of the namespace.
    Backup,
    /// A route is admitted by the ingress controller.
    Exposed,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::Ready => write!(f, "Ready"),
            ConditionType::Degraded => write!(f, "Degraded"),
            ConditionType::Progressing => write!(f, "Progressing"),
            ConditionType::Backup => write!(f, "Backup"),
            ConditionType::Exposed => write!(f, "Exposed"),
        }
    }
}

/// Condition reasons.
pub mod reasons {
    pub const ACTIVE: &str = "Active";
    pub const ADMITTED: &str = "Admitted";
    pub const ALREADY_MANAGED: &str = "AlreadyManaged";
    pub const AS_EXPECTED: &str = "AsExpected";
    pub const BACKUP: &str = "Backup";
    pub const FAILED_CREATE: &str = "FailedCreate";
    pub const FAILED_DELETE: &str = "FailedDelete";
    pub const FAILED_GET: &str = "FailedGet";
    pub const FAILED_UPDATE: &str = "FailedUpdate";
    pub const INVALID_HOSTNAME: &str = "InvalidHostname";
    pub const MISSING_CA_BUNDLE: &str = "MissingCABundle";
    pub const NOT_ADMITTED: &str = "NotAdmitted";
    pub const NOT_FOUND: &str = "NotFound";
    pub const RECONCILING: &str = "Reconciling";
    pub const REMOVED: &str = "Removed";
    pub const ROUTE_MANAGEMENT_STATE_UNSUPPORTED: &str = "RouteManagementStateUnsupported";
    pub const UNKNOWN: &str = "Unknown";
    pub const UNMANAGED: &str = "Unmanaged";
}

/// Identity of an observer: its namespace and name.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObserverKey {
    pub namespace: String,
    pub name: String,
}

impl ObserverKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObserverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl SDIObserver {
    /// Key identifying this observer.
    pub fn key(&self) -> ObserverKey {
        ObserverKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Namespace this observer wants to manage: the explicit `sdiNamespace`,
    /// or its own namespace when unset.
    pub fn target_namespace(&self) -> String {
        let explicit = self.spec.sdi_namespace.trim();
        if explicit.is_empty() {
            self.namespace().unwrap_or_default()
        } else {
            explicit.to_string()
        }
    }

    /// Whether `sdiNamespace` is set explicitly.
    pub fn has_explicit_target(&self) -> bool {
        !self.spec.sdi_namespace.trim().is_empty()
    }

    /// Whether the resource carries a deletion timestamp.
    pub fn is_pending_deletion(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the observer currently reports `Backup=True`.
    pub fn is_backup(&self) -> bool {
        self.status.as_ref().is_some_and(|status| {
            status.conditions.iter().any(|c| {
                c.r#type == ConditionType::Backup.to_string() && c.status == ConditionStatus::True
            })
        })
    }

    /// Creation time, if known.
    pub fn created_at(&self) -> Option<jiff::Timestamp> {
        self.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }
}
