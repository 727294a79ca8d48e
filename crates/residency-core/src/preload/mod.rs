//! Predictive preloading.

mod history;
mod preloader;

pub use history::{PreloadStrategy, ScheduledLoad, UsageHistory};
pub use preloader::{PreloadStats, Preloader};
