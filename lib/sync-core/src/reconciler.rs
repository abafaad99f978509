//! Reconciliation of cluster notifications into registry mutations

use crate::cache::ClusterCache;
use crate::error::{combine_results, Result, SyncError};
use crate::model::{AddressSet, Event, Notification, Resource, ResourceKind, ServiceInfo};
use crate::policy::{derive_service_info, resolve_addresses, service_key, should_sync};
use crate::registry::{RegistryClient, RegistrySync};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reconciler turns one notification at a time into registry calls.
///
/// Eligibility is re-derived from each snapshot; the only state kept across
/// notifications is the registered address sets inside [`RegistrySync`].
pub struct Reconciler<C, R> {
    cache: Arc<C>,
    registry: RegistrySync<R>,
}

impl<C: ClusterCache, R: RegistryClient> Reconciler<C, R> {
    pub fn new(cache: Arc<C>, client: R) -> Self {
        Self {
            cache,
            registry: RegistrySync::new(client),
        }
    }

    pub fn registry(&self) -> &RegistrySync<R> {
        &self.registry
    }

    /// Reconcile one notification.
    ///
    /// Malformed annotations are logged and swallowed: retrying cannot fix
    /// them. Lookup and registry errors are returned for the caller to retry.
    pub async fn reconcile(&mut self, notification: &Notification) -> Result<()> {
        let result = match &notification.new {
            Resource::Service(svc) => {
                let old = notification.old.as_ref().and_then(Resource::as_service);
                self.on_service_event(notification.event, old, svc).await
            }
            Resource::Endpoints(endpoints) => {
                self.on_endpoints_event(notification.event, endpoints).await
            }
        };

        match result {
            Err(SyncError::Policy {
                namespace,
                name,
                source,
            }) => {
                warn!(
                    %namespace,
                    %name,
                    error = %source,
                    "Skipping service with invalid sync annotations"
                );
                Ok(())
            }
            other => other,
        }
    }

    async fn on_service_event(
        &mut self,
        event: Event,
        old: Option<&Arc<Service>>,
        svc: &Service,
    ) -> Result<()> {
        match event {
            Event::Add => {
                if !should_sync(svc) {
                    debug!(namespace = ?svc.namespace(), name = %svc.name_any(), "Service should not be synced");
                    return Ok(());
                }
                let info = derive(svc)?;
                let addresses = self.resolve_addresses(svc, &info)?;
                self.registry.register_service(&info, addresses).await?;
            }
            Event::Delete => {
                // Annotations of a deleted object are not trusted for
                // eligibility; unregistering an unknown key is a no-op.
                let key = service_key(svc);
                self.registry.unregister_service(&key).await?;
            }
            Event::Update => {
                let Some(old) = old else {
                    warn!(name = %svc.name_any(), "Update notification without previous snapshot");
                    return Ok(());
                };
                self.on_service_update(old, svc).await?;
            }
        }

        Ok(())
    }

    async fn on_service_update(&mut self, old: &Service, svc: &Service) -> Result<()> {
        let old_eligible = should_sync(old);
        let new_eligible = should_sync(svc);

        if old_eligible && !new_eligible {
            let old_key = service_key(old);
            info!(
                service = %old_key.service_name,
                group = %old_key.group,
                "Service opted out of sync"
            );
            self.registry.unregister_service(&old_key).await?;
            return Ok(());
        }
        if !new_eligible {
            return Ok(());
        }

        let new_info = derive(svc)?;
        let addresses = self.resolve_addresses(svc, &new_info)?;

        // The key never fails to derive, so a broken port or metadata
        // annotation on the old snapshot cannot hide a rename.
        if old_eligible {
            let old_key = service_key(old);
            if old_key != new_info.key {
                info!(
                    from = %old_key,
                    to = %new_info.key,
                    "Service key changed, moving instances"
                );
                let registered = self.registry.register_service(&new_info, addresses).await;
                let unregistered = self.registry.unregister_service(&old_key).await;
                combine_results([registered, unregistered])?;
                return Ok(());
            }
        }

        let old_info = if old_eligible {
            match derive_service_info(old) {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!(name = %old.name_any(), error = %e, "Previous snapshot has invalid annotations");
                    None
                }
            }
        } else {
            None
        };

        match old_info {
            None => {
                self.registry.register_service(&new_info, addresses).await?;
            }
            Some(old_info) if old_info.port != new_info.port => {
                self.registry.register_service(&new_info, addresses).await?;
            }
            Some(old_info) if old_info.metadata != new_info.metadata => {
                self.registry.republish_instances(&new_info, addresses).await?;
            }
            Some(_) => {
                debug!(service = %new_info.key, "No registry-relevant change");
            }
        }

        Ok(())
    }

    async fn on_endpoints_event(&mut self, event: Event, endpoints: &Endpoints) -> Result<()> {
        // Teardown is driven by the service delete
        if event == Event::Delete {
            return Ok(());
        }

        let namespace = endpoints.namespace().unwrap_or_default();
        let name = endpoints.name_any();
        let Some(svc) = self.cache.get_service(&namespace, &name) else {
            return Err(SyncError::Lookup {
                kind: ResourceKind::Service,
                namespace,
                name,
            });
        };

        if !should_sync(&svc) {
            debug!(%namespace, %name, "Service should not be synced");
            return Ok(());
        }

        let info = derive(&svc)?;
        let addresses = resolve_addresses(endpoints, &info.port);
        self.registry.register_service(&info, addresses).await?;
        Ok(())
    }

    fn resolve_addresses(&self, svc: &Service, info: &ServiceInfo) -> Result<AddressSet> {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();
        match self.cache.get_endpoints(&namespace, &name) {
            Some(endpoints) => Ok(resolve_addresses(&endpoints, &info.port)),
            None => Err(SyncError::Lookup {
                kind: ResourceKind::Endpoints,
                namespace,
                name,
            }),
        }
    }
}

fn derive(svc: &Service) -> Result<ServiceInfo> {
    derive_service_info(svc).map_err(|source| SyncError::Policy {
        namespace: svc.namespace().unwrap_or_default(),
        name: svc.name_any(),
        source,
    })
}
