//! Connection settings of the Nacos client

use crate::error::{NacosError, Result};
use std::time::Duration;

/// Where and how the client talks to Nacos
#[derive(Clone, Debug)]
pub struct NacosOptions {
    /// Nacos namespace id; empty selects the public namespace
    pub namespace_id: String,
    /// Server hosts, tried in order
    pub servers: Vec<String>,
    pub port: u16,
    pub context_path: String,
    pub timeout: Duration,
    /// Interval between heartbeats of registered ephemeral instances
    pub beat_interval: Duration,
}

impl Default for NacosOptions {
    fn default() -> Self {
        Self {
            namespace_id: String::new(),
            servers: Vec::new(),
            port: 8848,
            context_path: "/nacos".to_string(),
            timeout: Duration::from_millis(5000),
            beat_interval: Duration::from_secs(5),
        }
    }
}

impl NacosOptions {
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(NacosError::NoServers);
        }
        if let Some(bad) = self
            .servers
            .iter()
            .find(|s| s.trim().is_empty() || s.contains('/'))
        {
            return Err(NacosError::InvalidServer(bad.clone()));
        }
        if self.port == 0 {
            return Err(NacosError::InvalidPort);
        }
        Ok(())
    }

    /// Base URL of every server, context path included
    pub fn base_urls(&self) -> Vec<String> {
        let context = self.context_path.trim_matches('/');
        self.servers
            .iter()
            .map(|host| {
                let host = host.trim();
                if context.is_empty() {
                    format!("http://{}:{}", host, self.port)
                } else {
                    format!("http://{}:{}/{}", host, self.port, context)
                }
            })
            .collect()
    }
}
