//! Resource types used by sdi-observer-operator.
//!
//! - `SDIObserver`: declares which SDI namespace to observe and how to expose it
//! - `Route`: the OpenShift route exposing SDI services
//! - DataHub: the SDI installation instance, accessed dynamically

mod datahub;
mod route;
mod sdi_observer;

pub use datahub::*;
pub use route::*;
pub use sdi_observer::*;
