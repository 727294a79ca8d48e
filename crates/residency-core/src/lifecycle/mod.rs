//! Model lifecycle: one active handle, a bounded warm set, timed
//! construction and speculative preloads.

mod manager;
mod types;

pub use manager::ModelLifecycleManager;
pub use types::{
    Disposable, LifecycleStats, LoadRequest, ModelConstructor, ModelHandle, ModelInfo, ModelSnapshot,
    ResidencyState,
};
