//! Dependency-aware partial unloading of a loaded object's components.

mod manager;
mod types;

pub use manager::{ComponentHost, ComponentUnloadManager};
pub use types::{ComponentKind, ComponentSpec, ComponentStatus, PressureReport, UnloadCandidate};
