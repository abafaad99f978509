//! In-memory cluster cache and recording registry client for tests.

#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service};
use kube::api::ObjectMeta;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use sync_core::policy::{
    ANNOTATION_SERVICE_GROUP, ANNOTATION_SERVICE_META, ANNOTATION_SERVICE_PORT,
    ANNOTATION_SERVICE_SYNC,
};
use sync_core::{
    Address, ClusterCache, InstanceFailure, Operation, RegistryClient, RegistryError, ServiceKey,
};

pub const NAMESPACE: &str = "default";

/// Cluster cache backed by plain maps.
#[derive(Default)]
pub struct FakeCache {
    services: RwLock<HashMap<String, Arc<Service>>>,
    endpoints: RwLock<HashMap<String, Arc<Endpoints>>>,
    synced: AtomicBool,
    endpoint_lookups: AtomicUsize,
}

impl FakeCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn synced() -> Arc<Self> {
        let cache = Self::new();
        cache.set_synced(true);
        cache
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    pub fn put_service(&self, svc: Arc<Service>) {
        let name = svc.metadata.name.clone().unwrap_or_default();
        self.services.write().unwrap().insert(name, svc);
    }

    pub fn put_endpoints(&self, ep: Arc<Endpoints>) {
        let name = ep.metadata.name.clone().unwrap_or_default();
        self.endpoints.write().unwrap().insert(name, ep);
    }

    /// Number of endpoint lookups served, hit or miss
    pub fn endpoint_lookups(&self) -> usize {
        self.endpoint_lookups.load(Ordering::SeqCst)
    }
}

impl ClusterCache for FakeCache {
    fn get_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        if namespace != NAMESPACE {
            return None;
        }
        self.services.read().unwrap().get(name).cloned()
    }

    fn get_endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>> {
        self.endpoint_lookups.fetch_add(1, Ordering::SeqCst);
        if namespace != NAMESPACE {
            return None;
        }
        self.endpoints.read().unwrap().get(name).cloned()
    }

    fn list_services(&self) -> Vec<Arc<Service>> {
        self.services.read().unwrap().values().cloned().collect()
    }

    fn has_synced_initial_list(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// A recorded registry call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Register {
        key: ServiceKey,
        metadata: BTreeMap<String, String>,
        addresses: Vec<Address>,
    },
    Deregister {
        key: ServiceKey,
        addresses: Vec<Address>,
    },
}

impl Call {
    pub fn is_empty(&self) -> bool {
        match self {
            Call::Register { addresses, .. } | Call::Deregister { addresses, .. } => {
                addresses.is_empty()
            }
        }
    }
}

/// Registry client that records every call.
#[derive(Default)]
pub struct RecordingRegistry {
    calls: Mutex<Vec<Call>>,
    fail_registrations: AtomicBool,
}

impl RecordingRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_registrations.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that carried at least one address
    pub fn effective_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| !c.is_empty()).collect()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

#[async_trait]
impl RegistryClient for RecordingRegistry {
    async fn register_instances(
        &self,
        key: &ServiceKey,
        metadata: &BTreeMap<String, String>,
        addresses: &[Address],
    ) -> Result<(), RegistryError> {
        self.calls.lock().unwrap().push(Call::Register {
            key: key.clone(),
            metadata: metadata.clone(),
            addresses: addresses.to_vec(),
        });

        if self.fail_registrations.load(Ordering::SeqCst) && !addresses.is_empty() {
            return Err(RegistryError::new(
                addresses
                    .iter()
                    .map(|address| InstanceFailure {
                        key: key.clone(),
                        address: address.clone(),
                        operation: Operation::Register,
                        reason: "registry unavailable".to_string(),
                    })
                    .collect(),
            ));
        }
        Ok(())
    }

    async fn deregister_instances(
        &self,
        key: &ServiceKey,
        addresses: &[Address],
    ) -> Result<(), RegistryError> {
        self.calls.lock().unwrap().push(Call::Deregister {
            key: key.clone(),
            addresses: addresses.to_vec(),
        });
        Ok(())
    }
}

pub fn service(name: &str, version: &str, annotations: &[(&str, &str)]) -> Arc<Service> {
    Arc::new(Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            resource_version: Some(version.to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    })
}

/// Opted-in service registering `port` under `group`
pub fn synced_service(name: &str, version: &str, port: &str, group: &str) -> Arc<Service> {
    service(
        name,
        version,
        &[
            (ANNOTATION_SERVICE_SYNC, "true"),
            (ANNOTATION_SERVICE_PORT, port),
            (ANNOTATION_SERVICE_GROUP, group),
        ],
    )
}

pub fn synced_service_with_meta(name: &str, version: &str, meta: &str) -> Arc<Service> {
    service(
        name,
        version,
        &[
            (ANNOTATION_SERVICE_SYNC, "true"),
            (ANNOTATION_SERVICE_PORT, "8080"),
            (ANNOTATION_SERVICE_META, meta),
        ],
    )
}

/// Endpoints with every ip exposing every port
pub fn endpoints(name: &str, ips: &[&str], ports: &[i32]) -> Arc<Endpoints> {
    Arc::new(Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(
                ports
                    .iter()
                    .map(|port| EndpointPort {
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    })
}

pub fn addresses(ips: &[&str], port: u16) -> Vec<Address> {
    ips.iter().map(|ip| Address::new(*ip, port)).collect()
}
