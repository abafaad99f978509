use crate::model::{Address, ResourceKind, ServiceKey};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised while reconciling a single notification.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid annotations on service {namespace}/{name}: {source}")]
    Policy {
        namespace: String,
        name: String,
        #[source]
        source: PolicyError,
    },

    #[error("{kind} {namespace}/{name} not found in cluster cache")]
    Lookup {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl SyncError {
    /// Policy errors come from malformed input and will fail the same way
    /// on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::Policy { .. })
    }
}

/// Malformed sync annotations on a service resource.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("annotation nacos.alibaba.com/service-port is missing")]
    MissingPort,

    #[error("annotation nacos.alibaba.com/service-port is not a valid port: {0:?}")]
    InvalidPort(String),

    #[error("annotation nacos.alibaba.com/service-meta is not a JSON object of strings: {0}")]
    InvalidMetadata(#[from] serde_json::Error),
}

/// Which registry call an instance failure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Register,
    Deregister,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Register => write!(f, "register"),
            Operation::Deregister => write!(f, "deregister"),
        }
    }
}

/// A single instance the registry refused or could not be reached for.
#[derive(Clone, Debug)]
pub struct InstanceFailure {
    pub key: ServiceKey,
    pub address: Address,
    pub operation: Operation,
    pub reason: String,
}

impl fmt::Display for InstanceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} on {}: {}",
            self.operation, self.address, self.key, self.reason
        )
    }
}

/// Aggregated per-instance failures of one or more registry calls.
#[derive(Error, Debug, Default)]
pub struct RegistryError {
    pub failures: Vec<InstanceFailure>,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} instance operation(s) failed", self.failures.len())?;
        if let Some(first) = self.failures.first() {
            write!(f, ", first: {}", first)?;
        }
        Ok(())
    }
}

impl RegistryError {
    pub fn new(failures: Vec<InstanceFailure>) -> Self {
        Self { failures }
    }

    pub fn merge(mut self, other: RegistryError) -> Self {
        self.failures.extend(other.failures);
        self
    }

    /// Addresses that failed for the given operation.
    pub fn failed(&self, operation: Operation) -> impl Iterator<Item = &Address> {
        self.failures
            .iter()
            .filter(move |f| f.operation == operation)
            .map(|f| &f.address)
    }
}

/// Fold any number of registry call results into one, keeping every failure.
pub fn combine_results<I>(results: I) -> std::result::Result<(), RegistryError>
where
    I: IntoIterator<Item = std::result::Result<(), RegistryError>>,
{
    let merged = results
        .into_iter()
        .filter_map(|r| r.err())
        .reduce(RegistryError::merge);

    match merged {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(ip: &str, operation: Operation) -> InstanceFailure {
        InstanceFailure {
            key: ServiceKey::new("orders", "g1"),
            address: Address::new(ip, 8080),
            operation,
            reason: "connection refused".to_string(),
        }
    }

    #[test]
    fn test_combine_results_keeps_all_failures() {
        let result = combine_results([
            Ok(()),
            Err(RegistryError::new(vec![failure("10.0.0.1", Operation::Register)])),
            Err(RegistryError::new(vec![failure("10.0.0.2", Operation::Deregister)])),
        ]);

        let err = result.unwrap_err();
        assert_eq!(err.failures.len(), 2);
        assert_eq!(
            err.failed(Operation::Register).collect::<Vec<_>>(),
            vec![&Address::new("10.0.0.1", 8080)]
        );
        assert_eq!(
            err.failed(Operation::Deregister).collect::<Vec<_>>(),
            vec![&Address::new("10.0.0.2", 8080)]
        );
    }

    #[test]
    fn test_combine_results_all_ok() {
        assert!(combine_results([Ok(()), Ok(())]).is_ok());
    }

    #[test]
    fn test_registry_error_display_mentions_first_failure() {
        let err = RegistryError::new(vec![failure("10.0.0.1", Operation::Register)]);
        let msg = err.to_string();
        assert!(msg.starts_with("1 instance operation(s) failed"));
        assert!(msg.contains("register 10.0.0.1:8080"));
    }

    #[test]
    fn test_policy_errors_are_not_retryable() {
        let err = SyncError::Policy {
            namespace: "default".to_string(),
            name: "orders".to_string(),
            source: PolicyError::MissingPort,
        };
        assert!(!err.is_retryable());

        let err = SyncError::Lookup {
            kind: ResourceKind::Endpoints,
            namespace: "default".to_string(),
            name: "orders".to_string(),
        };
        assert!(err.is_retryable());
    }
}
