//! Operator configuration loaded from environment variables.

use std::time::Duration;

pub const DEFAULT_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_FAILED_GET_RECHECK_SECS: u64 = 30;
pub const DEFAULT_ADMISSION_GRACE_SECS: u64 = 60;
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 600;

/// Process-wide configuration.
///
/// All settings have defaults and can be overridden via environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Restrict the SDIObserver watch to one namespace (`WATCH_NAMESPACE`)
    pub watch_namespace: Option<String>,
    /// Port of the health and metrics server (`HEALTH_PORT`)
    pub health_port: u16,
    /// Pod name used as event reporter instance (`POD_NAME`)
    pub pod_name: Option<String>,
    /// Settings handed to every namespace controller
    pub controller: ControllerSettings,
}

/// Timing settings of a namespace controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
    /// Re-check delay after a transient DataHub lookup failure
    pub failed_get_recheck: Duration,
    /// How long a written route may stay un-admitted before it is reported stuck
    pub admission_grace: Duration,
    /// Interval of the periodic re-reconcile
    pub resync_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            failed_get_recheck: Duration::from_secs(DEFAULT_FAILED_GET_RECHECK_SECS),
            admission_grace: Duration::from_secs(DEFAULT_ADMISSION_GRACE_SECS),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            health_port: DEFAULT_HEALTH_PORT,
            pod_name: None,
            controller: ControllerSettings::default(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str, default: u64| {
            Duration::from_secs(var_or_default(non_empty(key), default))
        };
        Self {
            watch_namespace: non_empty("WATCH_NAMESPACE"),
            health_port: var_or_default(non_empty("HEALTH_PORT"), DEFAULT_HEALTH_PORT),
            pod_name: non_empty("POD_NAME"),
            controller: ControllerSettings {
                failed_get_recheck: secs(
                    "FAILED_GET_RECHECK_SECS",
                    DEFAULT_FAILED_GET_RECHECK_SECS,
                ),
                admission_grace: secs("ADMISSION_GRACE_SECS", DEFAULT_ADMISSION_GRACE_SECS),
                resync_interval: secs("RESYNC_INTERVAL_SECS", DEFAULT_RESYNC_INTERVAL_SECS),
            },
        }
    }
}

/// Parse a variable or fall back to the default
fn var_or_default<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
