//! Status management utilities.
//!
//! Helpers for reading and updating observer conditions. Updates follow the
//! Kubernetes convention: `lastTransitionTime` only moves when the status of
//! a condition changes.

use crate::crd::{
    Condition, ConditionStatus, ConditionType, ManagedRouteStatus, ObserverKey, SDIObserverStatus,
    reasons,
};

/// Find a condition by type.
pub fn find_condition<'a>(
    conditions: &'a [Condition],
    condition_type: ConditionType,
) -> Option<&'a Condition> {
    let wanted = condition_type.to_string();
    conditions.iter().find(|c| c.r#type == wanted)
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    find_condition(conditions, condition_type).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Get the reason for a condition
pub fn get_condition_reason(conditions: &[Condition], condition_type: ConditionType) -> Option<&str> {
    find_condition(conditions, condition_type).map(|c| c.reason.as_str())
}

/// Add or update a condition.
///
/// The transition time of an existing condition is kept unless its status
/// changes. Returns whether anything other than the timestamp changed.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.r#type == condition.r#type)
    else {
        conditions.push(condition);
        return true;
    };

    let mut changed = false;
    if existing.status != condition.status {
        existing.status = condition.status;
        existing.last_transition_time = condition.last_transition_time;
        changed = true;
    }
    if existing.reason != condition.reason {
        existing.reason = condition.reason;
        changed = true;
    }
    if existing.message != condition.message {
        existing.message = condition.message;
        changed = true;
    }
    if existing.observed_generation != condition.observed_generation {
        existing.observed_generation = condition.observed_generation;
        changed = true;
    }
    changed
}

/// Remove a condition by type. Returns whether it was present.
pub fn remove_condition(conditions: &mut Vec<Condition>, condition_type: ConditionType) -> bool {
    let wanted = condition_type.to_string();
    let before = conditions.len();
    conditions.retain(|c| c.r#type != wanted);
    conditions.len() != before
}

/// Message of the Backup condition naming the active instance.
pub fn backup_message(active: &ObserverKey) -> String {
    format!("The active SDIObserver instance is (namespace/name): {active}")
}

/// Mark an observer status as backup of `active`, or as the active instance.
///
/// A backup reports `Ready=Unknown`, `Progressing=Unknown` and
/// `Degraded=False` with reason `Backup`, and drops everything it recorded
/// while it was active: the managed DataHub reference and the route blocks.
///
/// Returns false when the status already reflects the requested role, so the
/// caller can skip the write.
pub fn set_backup(
    status: &mut SDIObserverStatus,
    backup: bool,
    active: &ObserverKey,
    generation: Option<i64>,
) -> bool {
    let before = status.clone();
    let message = backup_message(active);

    if backup {
        set_condition(
            &mut status.conditions,
            Condition::new(
                ConditionType::Backup,
                ConditionStatus::True,
                reasons::ALREADY_MANAGED,
                message,
                generation,
            ),
        );
        for (condition_type, condition_status) in [
            (ConditionType::Ready, ConditionStatus::Unknown),
            (ConditionType::Progressing, ConditionStatus::Unknown),
            (ConditionType::Degraded, ConditionStatus::False),
        ] {
            set_condition(
                &mut status.conditions,
                Condition::new(condition_type, condition_status, reasons::BACKUP, "", generation),
            );
        }
        status.managed_data_hub_ref = None;
        status.vsystem_route = ManagedRouteStatus::default();
        status.slcb_route = ManagedRouteStatus::default();
        return *status != before;
    }

    let was_backup = find_condition(&status.conditions, ConditionType::Backup)
        .map(|c| c.status == ConditionStatus::True);
    match was_backup {
        Some(false) => return false,
        Some(true) => {
            for condition_type in [
                ConditionType::Ready,
                ConditionType::Progressing,
                ConditionType::Degraded,
            ] {
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        condition_type,
                        ConditionStatus::Unknown,
                        reasons::RECONCILING,
                        "",
                        generation,
                    ),
                );
            }
        }
        // Never marked; only record the Backup condition itself.
        None => {}
    }
    set_condition(
        &mut status.conditions,
        Condition::new(
            ConditionType::Backup,
            ConditionStatus::False,
            reasons::ACTIVE,
            message,
            generation,
        ),
    );
    *status != before
}
