//! Registry synchronization: address diffing and registered-state bookkeeping

use crate::error::{combine_results, Operation, RegistryError};
use crate::model::{Address, AddressSet, ServiceInfo, ServiceKey};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Network client of the service registry.
///
/// Both calls are idempotent per instance. Failures are reported per
/// instance in the returned [`RegistryError`].
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn register_instances(
        &self,
        key: &ServiceKey,
        metadata: &BTreeMap<String, String>,
        addresses: &[Address],
    ) -> Result<(), RegistryError>;

    async fn deregister_instances(
        &self,
        key: &ServiceKey,
        addresses: &[Address],
    ) -> Result<(), RegistryError>;
}

#[async_trait]
impl<T: RegistryClient + ?Sized> RegistryClient for Arc<T> {
    async fn register_instances(
        &self,
        key: &ServiceKey,
        metadata: &BTreeMap<String, String>,
        addresses: &[Address],
    ) -> Result<(), RegistryError> {
        (**self).register_instances(key, metadata, addresses).await
    }

    async fn deregister_instances(
        &self,
        key: &ServiceKey,
        addresses: &[Address],
    ) -> Result<(), RegistryError> {
        (**self).deregister_instances(key, addresses).await
    }
}

/// Split two address snapshots into `(added, removed)`
pub fn diff_addresses(old: &AddressSet, new: &AddressSet) -> (AddressSet, AddressSet) {
    let added = new.difference(old).cloned().collect();
    let removed = old.difference(new).cloned().collect();
    (added, removed)
}

/// RegistrySync pushes address snapshots to the registry as minimal deltas.
///
/// It owns the last address set requested for every service key. Only the
/// single reconciliation worker touches it, hence `&mut self` and no lock.
pub struct RegistrySync<R> {
    client: R,
    registered: HashMap<ServiceKey, AddressSet>,
}

impl<R: RegistryClient> RegistrySync<R> {
    pub fn new(client: R) -> Self {
        Self {
            client,
            registered: HashMap::new(),
        }
    }

    /// Addresses currently recorded as registered for a key
    pub fn registered(&self, key: &ServiceKey) -> Option<&AddressSet> {
        self.registered.get(key)
    }

    /// Get count of services with recorded instances
    pub fn service_count(&self) -> usize {
        self.registered.len()
    }

    /// Make the registry hold exactly `addresses` for the service
    pub async fn register_service(
        &mut self,
        info: &ServiceInfo,
        addresses: AddressSet,
    ) -> Result<(), RegistryError> {
        let previous = self.registered.get(&info.key).cloned().unwrap_or_default();
        let (added, removed) = diff_addresses(&previous, &addresses);

        info!(
            service = %info.key.service_name,
            group = %info.key.group,
            added = added.len(),
            removed = removed.len(),
            "Registering service"
        );

        let added: Vec<Address> = added.into_iter().collect();
        let removed: Vec<Address> = removed.into_iter().collect();

        let registered = self
            .client
            .register_instances(&info.key, &info.metadata, &added)
            .await;
        let deregistered = self.client.deregister_instances(&info.key, &removed).await;

        let mut recorded = addresses;
        if let Err(e) = &registered {
            for address in e.failed(Operation::Register) {
                recorded.remove(address);
            }
        }
        if let Err(e) = &deregistered {
            recorded.extend(e.failed(Operation::Deregister).cloned());
        }
        self.record(&info.key, recorded);

        combine_results([registered, deregistered])
    }

    /// Remove every recorded instance of the service from the registry
    pub async fn unregister_service(&mut self, key: &ServiceKey) -> Result<(), RegistryError> {
        let previous: Vec<Address> = self
            .registered
            .remove(key)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        info!(
            service = %key.service_name,
            group = %key.group,
            removed = previous.len(),
            "Unregistering service"
        );

        let result = self.client.deregister_instances(key, &previous).await;
        if let Err(e) = &result {
            let remaining: AddressSet = e.failed(Operation::Deregister).cloned().collect();
            warn!(
                service = %key.service_name,
                group = %key.group,
                remaining = remaining.len(),
                "Some instances could not be deregistered"
            );
            self.record(key, remaining);
        }

        result
    }

    /// Push every address again, e.g. to carry new instance metadata.
    /// Nothing is diffed or removed.
    pub async fn republish_instances(
        &mut self,
        info: &ServiceInfo,
        addresses: AddressSet,
    ) -> Result<(), RegistryError> {
        info!(
            service = %info.key.service_name,
            group = %info.key.group,
            instances = addresses.len(),
            "Republishing service instances"
        );

        let all: Vec<Address> = addresses.iter().cloned().collect();
        let result = self
            .client
            .register_instances(&info.key, &info.metadata, &all)
            .await;

        let mut pushed = addresses;
        if let Err(e) = &result {
            for address in e.failed(Operation::Register) {
                pushed.remove(address);
            }
        }
        let mut recorded = self.registered.remove(&info.key).unwrap_or_default();
        recorded.extend(pushed);
        self.record(&info.key, recorded);

        result
    }

    fn record(&mut self, key: &ServiceKey, addresses: AddressSet) {
        if addresses.is_empty() {
            self.registered.remove(key);
        } else {
            debug!(service = %key, instances = addresses.len(), "Recorded registered instances");
            self.registered.insert(key.clone(), addresses);
        }
    }
}
