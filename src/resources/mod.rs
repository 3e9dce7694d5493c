//! Resource generation module.
//!
//! Recipes for the resources an active SDIObserver manages in its target
//! namespace.
//!
//! ## Resources Managed
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | Route `vsystem` | Exposes the SDI vsystem service (re-encrypt TLS) |
//! | Route `sap-slcbridge` | Exposes the SLC Bridge service (TLS passthrough) |

pub mod common;
pub mod route;

// Re-export commonly used items from common
pub use common::{owner_annotations, route_port};
