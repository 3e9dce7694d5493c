//! Controller module for sdi-observer-operator.
//!
//! Two levels of reconciliation:
//! - the arbitration reconciler (`arbiter`, `election`, `ownership`) decides
//!   which SDIObserver owns which target namespace
//! - namespace controllers (`namespace_controller`, `namespace_reconciler`)
//!   reconcile the managed resources of one namespace for its owner
//!
//! Condition handling is shared by both (`status`, `conditions`).

// Shared modules
pub mod common;
pub mod conditions;
pub mod context;
pub mod error;
pub mod status;

// Arbitration
pub mod arbiter;
pub mod election;
pub mod ownership;
pub mod reconciler;

// Namespace controllers
pub mod namespace_controller;
pub mod namespace_reconciler;
