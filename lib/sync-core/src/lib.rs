//! Core of the Kubernetes to Nacos service sync
//!
//! This library provides:
//! - Sync policy derived from service annotations
//! - Address diffing and registered-state bookkeeping
//! - A deduplicating work queue with bounded retries
//! - The reconciler and the controller that drives it

pub mod cache;
pub mod controller;
pub mod error;
pub mod model;
pub mod policy;
pub mod queue;
pub mod reconciler;
pub mod registry;

pub use cache::ClusterCache;
pub use controller::{stopped, Controller, ControllerConfig, GateState, Readiness, SyncGate};
pub use error::{InstanceFailure, Operation, PolicyError, RegistryError, Result, SyncError};
pub use model::{
    Address, AddressSet, Event, Notification, Resource, ResourceKey, ResourceKind, ServiceInfo,
    ServiceKey, TargetPort,
};
pub use queue::{Coalesce, NotificationQueue, Task, WorkQueue};
pub use reconciler::Reconciler;
pub use registry::{diff_addresses, RegistryClient, RegistrySync};
