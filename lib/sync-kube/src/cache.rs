//! Reflector-backed cluster cache

use crate::watch::{CacheWatchers, ResourceWatch};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client};
use kube_runtime::reflector::{self, ObjectRef, Store};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sync_core::{ClusterCache, Resource, ResourceKind};

/// Services and Endpoints of the watched namespace, kept current by
/// [`CacheWatchers`].
#[derive(Clone)]
pub struct KubeWatchCache {
    services: Store<Service>,
    endpoints: Store<Endpoints>,
    services_synced: Arc<AtomicBool>,
    endpoints_synced: Arc<AtomicBool>,
}

impl KubeWatchCache {
    /// Create the cache and the watch loops that fill it.
    ///
    /// An empty `namespace` watches every namespace.
    pub fn new(client: Client, namespace: &str) -> (Self, CacheWatchers) {
        let (services, service_writer) = reflector::store();
        let (endpoints, endpoints_writer) = reflector::store();
        let services_synced = Arc::new(AtomicBool::new(false));
        let endpoints_synced = Arc::new(AtomicBool::new(false));

        let watchers = CacheWatchers::new(
            scoped_api(&client, namespace),
            ResourceWatch::new(
                ResourceKind::Service,
                services.clone(),
                service_writer,
                services_synced.clone(),
                Resource::Service,
            ),
            scoped_api(&client, namespace),
            ResourceWatch::new(
                ResourceKind::Endpoints,
                endpoints.clone(),
                endpoints_writer,
                endpoints_synced.clone(),
                Resource::Endpoints,
            ),
        );

        let cache = Self {
            services,
            endpoints,
            services_synced,
            endpoints_synced,
        };
        (cache, watchers)
    }
}

impl ClusterCache for KubeWatchCache {
    fn get_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.get(&ObjectRef::new(name).within(namespace))
    }

    fn get_endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>> {
        self.endpoints.get(&ObjectRef::new(name).within(namespace))
    }

    fn list_services(&self) -> Vec<Arc<Service>> {
        self.services.state()
    }

    fn has_synced_initial_list(&self) -> bool {
        self.services_synced.load(Ordering::Acquire) && self.endpoints_synced.load(Ordering::Acquire)
    }
}

fn scoped_api<K>(client: &Client, namespace: &str) -> Api<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    if namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use kube_runtime::watcher::Event;

    fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        }
    }

    fn cache() -> (KubeWatchCache, ResourceWatch<Service>, ResourceWatch<Endpoints>) {
        let (services, service_writer) = reflector::store();
        let (endpoints, endpoints_writer) = reflector::store();
        let services_synced = Arc::new(AtomicBool::new(false));
        let endpoints_synced = Arc::new(AtomicBool::new(false));
        let service_watch = ResourceWatch::new(
            ResourceKind::Service,
            services.clone(),
            service_writer,
            services_synced.clone(),
            Resource::Service,
        );
        let endpoints_watch = ResourceWatch::new(
            ResourceKind::Endpoints,
            endpoints.clone(),
            endpoints_writer,
            endpoints_synced.clone(),
            Resource::Endpoints,
        );
        let cache = KubeWatchCache {
            services,
            endpoints,
            services_synced,
            endpoints_synced,
        };
        (cache, service_watch, endpoints_watch)
    }

    #[test]
    fn test_synced_after_both_initial_lists() {
        let (cache, mut services, mut endpoints) = cache();
        assert!(!cache.has_synced_initial_list());

        services.handle(Event::Init);
        services.handle(Event::InitDone);
        assert!(!cache.has_synced_initial_list());

        endpoints.handle(Event::Init);
        endpoints.handle(Event::InitDone);
        assert!(cache.has_synced_initial_list());
    }

    #[test]
    fn test_lookups_are_namespaced() {
        let (cache, mut services, mut endpoints) = cache();
        services.handle(Event::Apply(Service {
            metadata: meta("shop", "orders"),
            ..Default::default()
        }));
        endpoints.handle(Event::Apply(Endpoints {
            metadata: meta("shop", "orders"),
            ..Default::default()
        }));

        assert!(cache.get_service("shop", "orders").is_some());
        assert!(cache.get_service("default", "orders").is_none());
        assert!(cache.get_endpoints("shop", "orders").is_some());
        assert!(cache.get_endpoints("shop", "billing").is_none());
        assert_eq!(cache.list_services().len(), 1);
    }
}
