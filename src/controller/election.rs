//! Candidate search for an orphaned namespace.
//!
//! Observers are ordered by how specifically they ask for the namespace. The
//! ordering is a total order over [`CandidateRank`] so repeated searches over
//! the same set always produce the same winner.

use std::cmp::Reverse;

use kube::ResourceExt;

use crate::crd::{ObserverKey, SDIObserver};

/// Sort key of a candidate. Smaller ranks win.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct CandidateRank {
    pub pending_deletion: bool,
    pub not_explicit_match: bool,
    pub not_own_namespace: bool,
    pub backup: bool,
    pub newest_first: Reverse<Option<jiff::Timestamp>>,
    pub key: ObserverKey,
}

/// Rank an observer as candidate for `namespace`.
pub fn rank(observer: &SDIObserver, namespace: &str) -> CandidateRank {
    CandidateRank {
        pending_deletion: observer.is_pending_deletion(),
        not_explicit_match: !(observer.has_explicit_target()
            && observer.target_namespace() == namespace),
        not_own_namespace: observer.namespace().as_deref() != Some(namespace),
        backup: observer.is_backup(),
        newest_first: Reverse(observer.created_at()),
        key: observer.key(),
    }
}

/// Whether the observer asks for `namespace`, explicitly or implicitly.
pub fn qualifies(observer: &SDIObserver, namespace: &str) -> bool {
    !observer.is_pending_deletion() && observer.target_namespace() == namespace
}

/// Pick the most specific observer qualifying for `namespace`.
///
/// `eligible` further restricts the candidates, e.g. to observers already
/// known to the arbiter.
pub fn select_candidate<'a, F>(
    observers: &'a [SDIObserver],
    namespace: &str,
    eligible: F,
) -> Option<&'a SDIObserver>
where
    F: Fn(&ObserverKey) -> bool,
{
    observers
        .iter()
        .filter(|observer| qualifies(observer, namespace) && eligible(&observer.key()))
        .min_by_key(|observer| rank(observer, namespace))
}
