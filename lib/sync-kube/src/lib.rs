//! Kubernetes watch cache feeding the sync controller

pub mod cache;
pub mod watch;

pub use cache::KubeWatchCache;
pub use watch::{CacheWatchers, ResourceWatch};
