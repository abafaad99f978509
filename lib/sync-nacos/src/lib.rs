//! Nacos naming service client used as the sync target registry

pub mod client;
pub mod error;
pub mod options;
pub mod transport;

pub use client::{InstanceId, NacosClient};
pub use error::{NacosError, Result};
pub use options::NacosOptions;
pub use transport::{HttpResponse, ReqwestTransport, Transport};
