// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for sdi-observer-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use proptest::prelude::*;

use sdi_observer_operator::controller::conditions::{PartialCondition, Polarity, fold_partials};
use sdi_observer_operator::controller::election::select_candidate;
use sdi_observer_operator::controller::ownership::Ownership;
use sdi_observer_operator::crd::{ConditionStatus, ObserverKey, SDIObserver, SDIObserverSpec};

/// Strategy for generating condition statuses.
fn any_status() -> impl Strategy<Value = ConditionStatus> {
    prop_oneof![
        Just(ConditionStatus::True),
        Just(ConditionStatus::False),
        Just(ConditionStatus::Unknown),
    ]
}

/// Strategy for generating partial conditions with a small reason alphabet.
fn any_partial() -> impl Strategy<Value = PartialCondition> {
    (any_status(), "[A-C]", "[a-c]{0,2}")
        .prop_map(|(status, reason, message)| PartialCondition::new(status, &reason, message))
}

/// Strategy for generating observers competing for namespace `sdi`.
///
/// Namespaces and names come from a small alphabet so that equal ranks and
/// duplicate creation times are common.
fn any_observer() -> impl Strategy<Value = SDIObserver> {
    (
        prop_oneof![Just("sdi"), Just("ops"), Just("tools")],
        "[a-d]",
        prop_oneof![Just(""), Just("sdi"), Just("other")],
        0i64..4,
        any::<bool>(),
    )
        .prop_map(|(namespace, name, target, created, deleting)| {
            let mut observer = SDIObserver::new(
                &name,
                SDIObserverSpec {
                    sdi_namespace: target.to_string(),
                    ..Default::default()
                },
            );
            observer.metadata = ObjectMeta {
                name: Some(name),
                namespace: Some(namespace.to_string()),
                creation_timestamp: Some(Time(
                    jiff::Timestamp::from_second(1_700_000_000 + created * 60).unwrap(),
                )),
                deletion_timestamp: deleting
                    .then(|| Time(jiff::Timestamp::from_second(1_800_000_000).unwrap())),
                ..Default::default()
            };
            observer
        })
}

/// Observers with unique keys, like in a real cluster.
fn observer_set() -> impl Strategy<Value = Vec<SDIObserver>> {
    prop::collection::vec(any_observer(), 0..8).prop_map(|mut observers| {
        observers.sort_by_key(SDIObserver::key);
        observers.dedup_by_key(|o| o.key());
        observers
    })
}

fn severity(polarity: Polarity, partials: &[PartialCondition]) -> u8 {
    partials
        .iter()
        .map(|p| polarity.severity(p.status))
        .max()
        .unwrap_or_default()
}

proptest! {
    /// The folded status is always the worst status among the partials.
    #[test]
    fn test_fold_takes_worst_status(partials in prop::collection::vec(any_partial(), 1..8)) {
        for polarity in [Polarity::Positive, Polarity::Negative] {
            let folded = fold_partials(polarity, &partials).unwrap();
            prop_assert_eq!(polarity.severity(folded.status), severity(polarity, &partials));
        }
    }

    /// The folded status does not depend on the order of the partials.
    #[test]
    fn test_fold_status_is_order_independent(
        partials in prop::collection::vec(any_partial(), 1..8),
    ) {
        let mut reversed = partials.clone();
        reversed.reverse();
        for polarity in [Polarity::Positive, Polarity::Negative] {
            prop_assert_eq!(
                fold_partials(polarity, &partials).unwrap().status,
                fold_partials(polarity, &reversed).unwrap().status
            );
        }
    }

    /// The election picks the same winner for any ordering of the observers.
    #[test]
    fn test_election_is_permutation_invariant(
        observers in observer_set(),
        seed in any::<u64>(),
    ) {
        let winner = select_candidate(&observers, "sdi", |_| true).map(SDIObserver::key);

        let mut shuffled = observers.clone();
        let len = shuffled.len();
        if len > 1 {
            // Deterministic rotation plus swap derived from the seed.
            shuffled.rotate_left(usize::try_from(seed % len as u64).unwrap());
            shuffled.swap(0, len - 1);
        }
        let shuffled_winner = select_candidate(&shuffled, "sdi", |_| true).map(SDIObserver::key);
        prop_assert_eq!(winner, shuffled_winner);
    }

    /// Winners always ask for the namespace and are never being deleted.
    #[test]
    fn test_election_winner_qualifies(observers in observer_set()) {
        if let Some(winner) = select_candidate(&observers, "sdi", |_| true) {
            prop_assert_eq!(winner.target_namespace(), "sdi");
            prop_assert!(!winner.is_pending_deletion());
        } else {
            prop_assert!(observers
                .iter()
                .all(|o| o.target_namespace() != "sdi" || o.is_pending_deletion()));
        }
    }

    /// Whatever order observers claim namespaces in, each namespace ends up
    /// with at most one owner and the maps stay consistent.
    #[test]
    fn test_single_owner_per_namespace(
        claims in prop::collection::vec(("[a-e]", prop_oneof![Just("sdi"), Just("other")]), 0..20),
    ) {
        let mut ownership: Ownership<String> = Ownership::new();
        for (name, namespace) in &claims {
            let key = ObserverKey::new("ops", name.as_str());
            if let Some(previous) = ownership.set_desired_namespace(&key, namespace)
                && previous != *namespace
            {
                ownership.release(&key);
            }
            match ownership.active_owner(namespace).cloned() {
                Some(owner) if owner == key => {}
                Some(_) => ownership.mark_backup(&key),
                None => {
                    ownership.insert_owner(&key, name.clone()).unwrap();
                }
            }
            prop_assert!(ownership.is_consistent());
        }

        let snapshot = ownership.snapshot();
        prop_assert!(snapshot.is_consistent());
        prop_assert!(snapshot.active.len() <= 2);
        for owner in snapshot.active.values() {
            prop_assert!(snapshot.running.contains(owner));
        }
    }
}
