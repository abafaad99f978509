//! Read side of the cluster watch cache

use k8s_openapi::api::core::v1::{Endpoints, Service};
use std::sync::Arc;

/// Point-in-time view of watched cluster resources.
///
/// Implementations are fed by their own watch loop and must be safe to read
/// from any thread.
pub trait ClusterCache: Send + Sync {
    fn get_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>>;

    fn get_endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>>;

    /// Every cached service resource
    fn list_services(&self) -> Vec<Arc<Service>>;

    /// True once the initial list of every watched resource has completed
    fn has_synced_initial_list(&self) -> bool;
}
