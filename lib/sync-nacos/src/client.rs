//! HTTP client of the Nacos naming Open API

use crate::error::{NacosError, Result};
use crate::options::NacosOptions;
use crate::transport::{ReqwestTransport, Transport};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use sync_core::{
    stopped, Address, InstanceFailure, Operation, RegistryClient, RegistryError, ServiceKey,
};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const INSTANCE_PATH: &str = "/v1/ns/instance";
const BEAT_PATH: &str = "/v1/ns/instance/beat";
const DEFAULT_GROUP: &str = "DEFAULT_GROUP";
const DEFAULT_CLUSTER: &str = "DEFAULT";
const INSTANCE_WEIGHT: f64 = 100.0;
/// Beat response code telling the client to register the instance again
const INSTANCE_NOT_FOUND: i64 = 20404;

/// One registered instance
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId {
    pub key: ServiceKey,
    pub address: Address,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BeatInfo<'a> {
    ip: &'a str,
    port: u16,
    service_name: String,
    cluster: &'static str,
    weight: f64,
    metadata: &'a BTreeMap<String, String>,
    scheduled: bool,
    period: u64,
}

#[derive(Deserialize)]
struct BeatResponse {
    #[serde(default)]
    code: i64,
}

/// NacosClient registers ephemeral instances and keeps them alive with
/// heartbeats until they are deregistered.
pub struct NacosClient {
    transport: Arc<dyn Transport>,
    options: NacosOptions,
    base_urls: Vec<String>,
    beats: RwLock<HashMap<InstanceId, BTreeMap<String, String>>>,
    /// Held while an instance is added to or removed from Nacos together
    /// with its beat entry, so a heartbeat re-registration cannot revive
    /// an instance deregistered in the meantime.
    membership: Mutex<()>,
}

impl NacosClient {
    pub fn new(options: NacosOptions) -> Result<Self> {
        options.validate()?;
        let transport = ReqwestTransport::new(options.timeout)?;
        Ok(Self::with_transport(options, Arc::new(transport)))
    }

    /// Client over a caller supplied transport. Options are not validated.
    pub fn with_transport(options: NacosOptions, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            base_urls: options.base_urls(),
            options,
            beats: RwLock::new(HashMap::new()),
            membership: Mutex::new(()),
        }
    }

    pub fn options(&self) -> &NacosOptions {
        &self.options
    }

    /// Number of instances currently kept alive
    pub async fn beating(&self) -> usize {
        self.beats.read().await.len()
    }

    pub async fn register_instance(
        &self,
        id: &InstanceId,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        let _membership = self.membership.lock().await;
        self.post_instance(id, metadata).await
    }

    pub async fn deregister_instance(&self, id: &InstanceId) -> Result<()> {
        let _membership = self.membership.lock().await;
        self.beats.write().await.remove(id);
        let params = self.instance_params(id);
        self.request(Method::DELETE, INSTANCE_PATH, &params).await?;
        Ok(())
    }

    /// Beat every registered instance on the configured interval until
    /// `stop` fires.
    pub async fn run_heartbeats(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.options.beat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = interval.tick() => self.beat_all().await,
            }
        }
        info!("Heartbeats stopped");
    }

    async fn beat_all(&self) {
        let instances: Vec<_> = self
            .beats
            .read()
            .await
            .iter()
            .map(|(id, metadata)| (id.clone(), metadata.clone()))
            .collect();

        for (id, metadata) in instances {
            match self.send_beat(&id, &metadata).await {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(e) = self.register_again(&id).await {
                        warn!(service = %id.key, address = %id.address, error = %e, "Re-registration failed");
                    }
                }
                Err(e) => {
                    warn!(service = %id.key, address = %id.address, error = %e, "Heartbeat failed");
                }
            }
        }
    }

    /// Register an instance Nacos forgot, with its current metadata.
    /// Returns false when it was deregistered since its beat was sent.
    async fn register_again(&self, id: &InstanceId) -> Result<bool> {
        let _membership = self.membership.lock().await;
        let metadata = match self.beats.read().await.get(id) {
            Some(metadata) => metadata.clone(),
            None => return Ok(false),
        };

        info!(service = %id.key, address = %id.address, "Instance unknown to Nacos, registering again");
        self.post_instance(id, &metadata).await?;
        Ok(true)
    }

    /// Caller holds the membership lock
    async fn post_instance(&self, id: &InstanceId, metadata: &BTreeMap<String, String>) -> Result<()> {
        let params = self.register_params(id, metadata)?;
        self.request(Method::POST, INSTANCE_PATH, &params).await?;
        self.beats.write().await.insert(id.clone(), metadata.clone());
        Ok(())
    }

    /// Returns false when the server no longer knows the instance
    async fn send_beat(&self, id: &InstanceId, metadata: &BTreeMap<String, String>) -> Result<bool> {
        let params = self.beat_params(id, metadata)?;
        let body = self.request(Method::PUT, BEAT_PATH, &params).await?;
        let code = serde_json::from_str::<BeatResponse>(&body)
            .map(|r| r.code)
            .unwrap_or_default();
        Ok(code != INSTANCE_NOT_FOUND)
    }

    /// Send the request to each server in turn until one accepts it
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&'static str, String)],
    ) -> Result<String> {
        let mut last_error = NacosError::NoServers;

        for base in &self.base_urls {
            let url = format!("{}{}", base, path);
            match self.transport.send(method.clone(), &url, params).await {
                Ok(response) if response.is_success() => return Ok(response.body),
                Ok(response) => {
                    debug!(%url, status = response.status, "Nacos server rejected request, trying next");
                    last_error = NacosError::Status {
                        url,
                        status: response.status,
                        body: response.body,
                    };
                }
                Err(e) => {
                    debug!(%url, error = %e, "Nacos server unreachable, trying next");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    fn instance_params(&self, id: &InstanceId) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("ip", id.address.ip.clone()),
            ("port", id.address.port.to_string()),
            ("serviceName", grouped_service_name(&id.key)),
            ("groupName", group_name(&id.key).to_string()),
            ("ephemeral", "true".to_string()),
        ];
        if !self.options.namespace_id.is_empty() {
            params.push(("namespaceId", self.options.namespace_id.clone()));
        }
        params
    }

    fn register_params(
        &self,
        id: &InstanceId,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Vec<(&'static str, String)>> {
        let mut params = self.instance_params(id);
        params.extend([
            ("weight", INSTANCE_WEIGHT.to_string()),
            ("enabled", "true".to_string()),
            ("healthy", "true".to_string()),
            ("metadata", serde_json::to_string(metadata)?),
        ]);
        Ok(params)
    }

    fn beat_params(
        &self,
        id: &InstanceId,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Vec<(&'static str, String)>> {
        let beat = BeatInfo {
            ip: &id.address.ip,
            port: id.address.port,
            service_name: grouped_service_name(&id.key),
            cluster: DEFAULT_CLUSTER,
            weight: INSTANCE_WEIGHT,
            metadata,
            scheduled: true,
            period: self.options.beat_interval.as_millis() as u64,
        };

        let mut params = vec![
            ("serviceName", grouped_service_name(&id.key)),
            ("groupName", group_name(&id.key).to_string()),
            ("ephemeral", "true".to_string()),
            ("beat", serde_json::to_string(&beat)?),
        ];
        if !self.options.namespace_id.is_empty() {
            params.push(("namespaceId", self.options.namespace_id.clone()));
        }
        Ok(params)
    }
}

fn group_name(key: &ServiceKey) -> &str {
    if key.group.is_empty() {
        DEFAULT_GROUP
    } else {
        &key.group
    }
}

fn grouped_service_name(key: &ServiceKey) -> String {
    format!("{}@@{}", group_name(key), key.service_name)
}

#[async_trait]
impl RegistryClient for NacosClient {
    async fn register_instances(
        &self,
        key: &ServiceKey,
        metadata: &BTreeMap<String, String>,
        addresses: &[Address],
    ) -> std::result::Result<(), RegistryError> {
        let mut failures = Vec::new();
        for address in addresses {
            let id = InstanceId {
                key: key.clone(),
                address: address.clone(),
            };
            if let Err(e) = self.register_instance(&id, metadata).await {
                failures.push(InstanceFailure {
                    key: key.clone(),
                    address: address.clone(),
                    operation: Operation::Register,
                    reason: e.to_string(),
                });
            }
        }

        debug!(service = %key, instances = addresses.len(), failed = failures.len(), "Registered instances");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::new(failures))
        }
    }

    async fn deregister_instances(
        &self,
        key: &ServiceKey,
        addresses: &[Address],
    ) -> std::result::Result<(), RegistryError> {
        let mut failures = Vec::new();
        for address in addresses {
            let id = InstanceId {
                key: key.clone(),
                address: address.clone(),
            };
            if let Err(e) = self.deregister_instance(&id).await {
                failures.push(InstanceFailure {
                    key: key.clone(),
                    address: address.clone(),
                    operation: Operation::Deregister,
                    reason: e.to_string(),
                });
            }
        }

        debug!(service = %key, instances = addresses.len(), failed = failures.len(), "Deregistered instances");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::new(failures))
        }
    }
}
