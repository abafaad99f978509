//! Registry-side model and the notifications that drive reconciliation

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Identity of a service in the registry
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub service_name: String,
    pub group: String,
}

impl ServiceKey {
    pub fn new(service_name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@@{}", self.group, self.service_name)
    }
}

/// Port of the endpoint subset that instances are registered on
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPort {
    Number(u16),
    /// Matches the endpoint port carrying this name
    Name(String),
}

impl fmt::Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPort::Number(port) => write!(f, "{}", port),
            TargetPort::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Everything the registry needs to know about a synced service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub key: ServiceKey,
    pub port: TargetPort,
    pub metadata: BTreeMap<String, String>,
}

/// One registry instance endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub ip: String,
    pub port: u16,
}

impl Address {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

pub type AddressSet = BTreeSet<Address>;

/// Kind of change carried by a notification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Add,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Service,
    Endpoints,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Service => write!(f, "Service"),
            ResourceKind::Endpoints => write!(f, "Endpoints"),
        }
    }
}

/// Deduplication key of queued notifications
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Snapshot of a watched cluster object
#[derive(Clone, Debug)]
pub enum Resource {
    Service(Arc<Service>),
    Endpoints(Arc<Endpoints>),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Service(_) => ResourceKind::Service,
            Resource::Endpoints(_) => ResourceKind::Endpoints,
        }
    }

    pub fn key(&self) -> ResourceKey {
        let (namespace, name) = match self {
            Resource::Service(svc) => (svc.namespace(), svc.name_any()),
            Resource::Endpoints(ep) => (ep.namespace(), ep.name_any()),
        };
        ResourceKey {
            kind: self.kind(),
            namespace: namespace.unwrap_or_default(),
            name,
        }
    }

    pub fn as_service(&self) -> Option<&Arc<Service>> {
        match self {
            Resource::Service(svc) => Some(svc),
            Resource::Endpoints(_) => None,
        }
    }
}

/// A change observed by the cluster watch cache.
///
/// `old` is only present for updates.
#[derive(Clone, Debug)]
pub struct Notification {
    pub event: Event,
    pub old: Option<Resource>,
    pub new: Resource,
}

impl Notification {
    pub fn add(resource: Resource) -> Self {
        Self {
            event: Event::Add,
            old: None,
            new: resource,
        }
    }

    pub fn update(old: Resource, new: Resource) -> Self {
        Self {
            event: Event::Update,
            old: Some(old),
            new,
        }
    }

    pub fn delete(resource: Resource) -> Self {
        Self {
            event: Event::Delete,
            old: None,
            new: resource,
        }
    }

    pub fn key(&self) -> ResourceKey {
        self.new.key()
    }

    /// Collapse a queued notification with a newer one for the same key.
    ///
    /// The newest snapshot always wins; the event is chosen so that the
    /// transition from the state before `self` is not lost.
    pub fn coalesce(self, newer: Notification) -> Notification {
        match (self.event, newer.event) {
            (Event::Add, Event::Update) => Notification::add(newer.new),
            (Event::Update, Event::Update) => Notification {
                event: Event::Update,
                old: self.old,
                new: newer.new,
            },
            (Event::Delete, Event::Add) => Notification::update(self.new, newer.new),
            _ => newer,
        }
    }
}
