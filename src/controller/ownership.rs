//! Ownership maps of the arbiter.
//!
//! Process-local and rebuildable from the cluster. The arbiter keeps them
//! behind a single lock; every method here is a plain synchronous update so
//! the maps change together or not at all.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::crd::ObserverKey;

/// Registry of desired namespaces, active owners and running controllers.
///
/// `H` is the controller handle type; the arbiter stores namespace
/// controllers, tests may use any placeholder.
#[derive(Debug)]
pub struct Ownership<H> {
    desired_namespace_of: HashMap<ObserverKey, String>,
    active_owner_of: HashMap<String, ObserverKey>,
    controller_of: HashMap<ObserverKey, H>,
    backups: BTreeSet<ObserverKey>,
}

impl<H> Default for Ownership<H> {
    fn default() -> Self {
        Self {
            desired_namespace_of: HashMap::new(),
            active_owner_of: HashMap::new(),
            controller_of: HashMap::new(),
            backups: BTreeSet::new(),
        }
    }
}

impl<H> Ownership<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last known desired namespace of an observer.
    pub fn desired_namespace(&self, key: &ObserverKey) -> Option<&str> {
        self.desired_namespace_of.get(key).map(String::as_str)
    }

    /// Record the desired namespace, returning the previous value.
    pub fn set_desired_namespace(&mut self, key: &ObserverKey, namespace: &str) -> Option<String> {
        self.desired_namespace_of
            .insert(key.clone(), namespace.to_string())
    }

    pub fn active_owner(&self, namespace: &str) -> Option<&ObserverKey> {
        self.active_owner_of.get(namespace)
    }

    pub fn is_active_owner(&self, key: &ObserverKey) -> bool {
        self.desired_namespace(key)
            .and_then(|ns| self.active_owner(ns))
            .is_some_and(|owner| owner == key)
    }

    pub fn controller(&self, key: &ObserverKey) -> Option<&H> {
        self.controller_of.get(key)
    }

    /// Record `key` as active owner of its desired namespace with a running controller.
    ///
    /// Returns the handle back if the namespace is owned by someone else or the
    /// desired namespace is unknown; the maps are left unchanged then.
    pub fn insert_owner(&mut self, key: &ObserverKey, controller: H) -> Result<(), H> {
        let Some(namespace) = self.desired_namespace_of.get(key).cloned() else {
            return Err(controller);
        };
        if self
            .active_owner_of
            .get(&namespace)
            .is_some_and(|owner| owner != key)
        {
            return Err(controller);
        }
        self.active_owner_of.insert(namespace, key.clone());
        self.controller_of.insert(key.clone(), controller);
        self.backups.remove(key);
        Ok(())
    }

    /// Release whatever `key` owns: the namespace it is active owner of and its controller.
    ///
    /// Returns the released namespace (if any) and the controller handle to stop.
    pub fn release(&mut self, key: &ObserverKey) -> (Option<String>, Option<H>) {
        let namespace = self
            .active_owner_of
            .iter()
            .find(|(_, owner)| *owner == key)
            .map(|(ns, _)| ns.clone());
        if let Some(ns) = &namespace {
            self.active_owner_of.remove(ns);
        }
        (namespace, self.controller_of.remove(key))
    }

    /// Drop every trace of an observer.
    pub fn forget(&mut self, key: &ObserverKey) -> (Option<String>, Option<H>) {
        let released = self.release(key);
        self.desired_namespace_of.remove(key);
        self.backups.remove(key);
        released
    }

    pub fn mark_backup(&mut self, key: &ObserverKey) {
        self.backups.insert(key.clone());
    }

    /// Observers marked backup whose desired namespace is `namespace`.
    pub fn backups_for(&self, namespace: &str) -> Vec<ObserverKey> {
        self.backups
            .iter()
            .filter(|key| self.desired_namespace(key) == Some(namespace))
            .cloned()
            .collect()
    }

    pub fn backup_count(&self) -> usize {
        self.backups.len()
    }

    pub fn controller_count(&self) -> usize {
        self.controller_of.len()
    }

    /// Remove and return every controller, clearing ownership.
    pub fn drain_controllers(&mut self) -> Vec<(ObserverKey, H)> {
        self.active_owner_of.clear();
        self.controller_of.drain().collect()
    }

    /// Check that `controllerOf[k]` exists iff k is the active owner of its desired namespace.
    pub fn is_consistent(&self) -> bool {
        let owners_consistent = self.active_owner_of.iter().all(|(ns, owner)| {
            self.desired_namespace(owner) == Some(ns.as_str())
                && self.controller_of.contains_key(owner)
        });
        let controllers_consistent = self
            .controller_of
            .keys()
            .all(|key| self.is_active_owner(key));
        owners_consistent && controllers_consistent
    }

    /// Point-in-time copy of the maps, without controller handles.
    pub fn snapshot(&self) -> OwnershipSnapshot {
        OwnershipSnapshot {
            desired: self
                .desired_namespace_of
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            active: self
                .active_owner_of
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            running: self.controller_of.keys().cloned().collect(),
            backups: self.backups.clone(),
        }
    }
}

/// Copy of the ownership maps for inspection and tests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OwnershipSnapshot {
    pub desired: BTreeMap<ObserverKey, String>,
    pub active: BTreeMap<String, ObserverKey>,
    pub running: BTreeSet<ObserverKey>,
    pub backups: BTreeSet<ObserverKey>,
}

impl OwnershipSnapshot {
    /// Same invariant as [`Ownership::is_consistent`].
    pub fn is_consistent(&self) -> bool {
        let owners_consistent = self.active.iter().all(|(ns, owner)| {
            self.desired.get(owner) == Some(ns) && self.running.contains(owner)
        });
        let running_consistent = self.running.iter().all(|key| {
            self.desired
                .get(key)
                .and_then(|ns| self.active.get(ns))
                .is_some_and(|owner| owner == key)
        });
        owners_consistent && running_consistent
    }

    pub fn owner_of(&self, namespace: &str) -> Option<&ObserverKey> {
        self.active.get(namespace)
    }
}
