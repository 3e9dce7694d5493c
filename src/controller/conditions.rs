//! Consolidation of partial outcomes into observer-level conditions.
//!
//! Every recipe reports partial outcomes for `Ready`, `Degraded` and
//! `Progressing`. The worst status wins; among partials of the winning
//! severity the first reason is kept and messages are appended.

use crate::controller::status::{find_condition, set_condition};
use crate::crd::{Condition, ConditionStatus, ConditionType, reasons};

/// One recipe's view on a condition type.
#[derive(Clone, Debug, PartialEq)]
pub struct PartialCondition {
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

impl PartialCondition {
    pub fn new(status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Which status is good news for a condition type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Polarity {
    /// `True` is healthy (Ready).
    Positive,
    /// `False` is healthy (Degraded, Progressing).
    Negative,
}

impl Polarity {
    pub fn of(condition_type: ConditionType) -> Self {
        match condition_type {
            ConditionType::Ready | ConditionType::Exposed => Polarity::Positive,
            ConditionType::Degraded | ConditionType::Progressing | ConditionType::Backup => {
                Polarity::Negative
            }
        }
    }

    /// 0 is healthy, 2 is the worst.
    pub fn severity(self, status: ConditionStatus) -> u8 {
        match (self, status) {
            (_, ConditionStatus::Unknown) => 1,
            (Polarity::Positive, ConditionStatus::True) => 0,
            (Polarity::Positive, ConditionStatus::False) => 2,
            (Polarity::Negative, ConditionStatus::False) => 0,
            (Polarity::Negative, ConditionStatus::True) => 2,
        }
    }
}

/// Fold an ordered list of partials into one consolidated outcome.
///
/// Returns `None` for an empty list; the caller decides what an empty list
/// means for an existing condition.
pub fn fold_partials(polarity: Polarity, partials: &[PartialCondition]) -> Option<PartialCondition> {
    let (first, rest) = partials.split_first()?;
    let mut product = first.clone();
    let mut product_severity = polarity.severity(product.status);

    for partial in rest {
        let severity = polarity.severity(partial.status);
        if severity > product_severity {
            product = partial.clone();
            product_severity = severity;
        } else if severity == product_severity {
            if product.reason.is_empty() || product.reason == reasons::UNKNOWN {
                product.reason = partial.reason.clone();
            }
            if product_severity > 0 {
                append_message(&mut product.message, &partial.message);
            } else if product.message.is_empty() {
                product.message = partial.message.clone();
            }
        }
    }
    Some(product)
}

fn append_message(target: &mut String, message: &str) {
    if message.is_empty() {
        return;
    }
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(message);
}

/// Compute the consolidated condition of one type.
///
/// An empty partial list keeps an existing condition untouched and yields
/// `Unknown/Unknown` when the type has never been set.
pub fn consolidate(
    existing: Option<&Condition>,
    condition_type: ConditionType,
    partials: &[PartialCondition],
    generation: Option<i64>,
) -> Option<Condition> {
    match fold_partials(Polarity::of(condition_type), partials) {
        Some(product) => Some(Condition::new(
            condition_type,
            product.status,
            &product.reason,
            product.message,
            generation,
        )),
        None if existing.is_none() => Some(Condition::new(
            condition_type,
            ConditionStatus::Unknown,
            reasons::UNKNOWN,
            "",
            generation,
        )),
        None => None,
    }
}

/// Partial outcomes collected during one reconcile, per condition type.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Partials {
    pub ready: Vec<PartialCondition>,
    pub degraded: Vec<PartialCondition>,
    pub progressing: Vec<PartialCondition>,
}

impl Partials {
    pub fn ready(&mut self, status: ConditionStatus, reason: &str, message: impl Into<String>) {
        self.ready.push(PartialCondition::new(status, reason, message));
    }

    pub fn degraded(&mut self, status: ConditionStatus, reason: &str, message: impl Into<String>) {
        self.degraded
            .push(PartialCondition::new(status, reason, message));
    }

    pub fn progressing(
        &mut self,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.progressing
            .push(PartialCondition::new(status, reason, message));
    }

    pub fn extend(&mut self, other: Partials) {
        self.ready.extend(other.ready);
        self.degraded.extend(other.degraded);
        self.progressing.extend(other.progressing);
    }

    /// Write the consolidated Ready, Degraded and Progressing conditions.
    /// Returns whether any condition changed.
    pub fn apply(&self, conditions: &mut Vec<Condition>, generation: Option<i64>) -> bool {
        let mut changed = false;
        for (condition_type, partials) in [
            (ConditionType::Ready, &self.ready),
            (ConditionType::Degraded, &self.degraded),
            (ConditionType::Progressing, &self.progressing),
        ] {
            let existing = find_condition(conditions, condition_type);
            if let Some(condition) = consolidate(existing, condition_type, partials, generation) {
                changed |= set_condition(conditions, condition);
            }
        }
        changed
    }
}
