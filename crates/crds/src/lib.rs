//! Dev Platform CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the environment lifecycle
//! controller, plus the well-known labels and annotations shared by every
//! object the controller derives from them.

pub mod development_environment;
pub mod labels;

pub use development_environment::*;
