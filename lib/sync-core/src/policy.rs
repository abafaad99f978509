//! Annotation-driven sync policy
//!
//! A service opts into registry sync with annotations under
//! `nacos.alibaba.com/`. Everything here is pure: it reads the resource and
//! never touches the cluster or the registry.

use crate::error::PolicyError;
use crate::model::{Address, AddressSet, ServiceInfo, ServiceKey, TargetPort};
use k8s_openapi::api::core::v1::{EndpointPort, Endpoints, Service};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::debug;

/// Opt-in flag; must parse as a boolean `true`
pub const ANNOTATION_SERVICE_SYNC: &str = "nacos.alibaba.com/service-sync";

/// Overrides the registered service name (defaults to the resource name)
pub const ANNOTATION_SERVICE_NAME: &str = "nacos.alibaba.com/service-name";

/// Registry group (defaults to empty)
pub const ANNOTATION_SERVICE_GROUP: &str = "nacos.alibaba.com/service-group";

/// Instance port: a number or the name of an endpoint port
pub const ANNOTATION_SERVICE_PORT: &str = "nacos.alibaba.com/service-port";

/// Instance metadata as a JSON object of strings
pub const ANNOTATION_SERVICE_META: &str = "nacos.alibaba.com/service-meta";

/// Whether the service opts into sync. Absent or unparsable means no.
pub fn should_sync(svc: &Service) -> bool {
    svc.annotations()
        .get(ANNOTATION_SERVICE_SYNC)
        .and_then(|raw| parse_bool(raw))
        .unwrap_or(false)
}

/// Registry identity of the service. Never fails, so teardown can always
/// compute it.
pub fn service_key(svc: &Service) -> ServiceKey {
    let annotations = svc.annotations();
    let service_name = match annotations.get(ANNOTATION_SERVICE_NAME) {
        Some(name) if !name.is_empty() => name.clone(),
        _ => svc.name_any(),
    };
    let group = annotations
        .get(ANNOTATION_SERVICE_GROUP)
        .cloned()
        .unwrap_or_default();

    ServiceKey::new(service_name, group)
}

/// Derive the registry view of a service from its annotations
pub fn derive_service_info(svc: &Service) -> Result<ServiceInfo, PolicyError> {
    let annotations = svc.annotations();

    let port = match annotations.get(ANNOTATION_SERVICE_PORT) {
        Some(raw) => parse_target_port(raw)?,
        None => return Err(PolicyError::MissingPort),
    };

    let metadata = match annotations.get(ANNOTATION_SERVICE_META) {
        Some(raw) if !raw.is_empty() => serde_json::from_str::<BTreeMap<String, String>>(raw)?,
        _ => BTreeMap::new(),
    };

    let key = service_key(svc);
    debug!(
        service = %key.service_name,
        group = %key.group,
        port = %port,
        "Derived service info"
    );

    Ok(ServiceInfo {
        key,
        port,
        metadata,
    })
}

/// Parse the port annotation: a decimal port number or an IANA service name
pub fn parse_target_port(raw: &str) -> Result<TargetPort, PolicyError> {
    if raw.is_empty() {
        return Err(PolicyError::MissingPort);
    }

    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return match raw.parse::<u16>() {
            Ok(port) if port != 0 => Ok(TargetPort::Number(port)),
            _ => Err(PolicyError::InvalidPort(raw.to_string())),
        };
    }

    if is_port_name(raw) {
        Ok(TargetPort::Name(raw.to_string()))
    } else {
        Err(PolicyError::InvalidPort(raw.to_string()))
    }
}

// IANA_SVC_NAME: at most 15 chars of [a-z0-9-], at least one letter,
// no leading, trailing or doubled hyphen.
fn is_port_name(name: &str) -> bool {
    name.len() <= 15
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && name.bytes().any(|b| b.is_ascii_lowercase())
        && !name.starts_with('-')
        && !name.ends_with('-')
        && !name.contains("--")
}

/// Boolean literals accepted for the opt-in flag
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn port_matches(target: &TargetPort, port: &EndpointPort) -> bool {
    match target {
        TargetPort::Number(number) => port.port == i32::from(*number),
        TargetPort::Name(name) => port.name.as_deref() == Some(name.as_str()),
    }
}

/// Ready addresses of the endpoint resource that expose the target port
pub fn resolve_addresses(endpoints: &Endpoints, target: &TargetPort) -> AddressSet {
    let mut addresses = AddressSet::new();

    for subset in endpoints.subsets.iter().flatten() {
        let ports: Vec<u16> = subset
            .ports
            .iter()
            .flatten()
            .filter(|port| port_matches(target, port))
            .filter_map(|port| u16::try_from(port.port).ok())
            .collect();

        for address in subset.addresses.iter().flatten() {
            for port in &ports {
                addresses.insert(Address::new(address.ip.clone(), *port));
            }
        }
    }

    addresses
}
