use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a monoplane-related operation.
pub type MonoplaneResult<T> = Result<T, MonoplaneError>;

/// An error that occurred during a control plane operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum MonoplaneError {
    /// The input was malformed and was rejected before any state was touched.
    #[error("validation error: {0}")]
    Validation(String),

    /// A uniqueness constraint was violated or an optimistic update lost its race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// The kind of entity that was looked up.
        kind: &'static str,

        /// The id or natural key that did not resolve.
        id: String,
    },

    /// A condition blocking the operation must be resolved by the caller first.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A transient failure. Safe to retry with backoff.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// No ready runner in the region has enough free capacity.
    #[error("no runner in region {region} has capacity for cpu={cpu} memory={memory}GiB disk={disk}GiB")]
    NoCapacity {
        /// The region that was searched.
        region: String,

        /// Requested vCPUs.
        cpu: i64,

        /// Requested memory in GiB.
        memory: i64,

        /// Requested disk in GiB.
        disk: i64,
    },

    /// The snapshot is not active or not available in the requested region.
    #[error("snapshot {snapshot} is not available in region {region}")]
    SnapshotUnavailable {
        /// The snapshot id.
        snapshot: String,

        /// The region the sandbox was requested in.
        region: String,
    },

    /// The runner explicitly refused the operation.
    #[error("runner {runner} rejected the operation: {reason}")]
    RunnerRejected {
        /// The runner id.
        runner: String,

        /// What the runner reported.
        reason: String,
    },

    /// The container registry refused the request.
    #[error("registry {registry} rejected the request: {reason}")]
    RegistryRejected {
        /// The registry URL.
        registry: String,

        /// What the registry reported.
        reason: String,
    },

    /// The requested state transition is not part of the sandbox state machine.
    #[error("sandbox {sandbox} cannot transition from {from} to {to}")]
    InvalidTransition {
        /// The sandbox id.
        sandbox: String,

        /// The current state.
        from: String,

        /// The attempted state.
        to: String,
    },

    /// A remote call did not complete within its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error that occurred in the relational store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error that occurred while applying schema migrations.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred during JSON (de)serialization.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred while parsing a TOML configuration.
    #[error("config error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MonoplaneError {
    /// Wraps an opaque error.
    pub fn custom(error: impl Into<anyhow::Error>) -> MonoplaneError {
        MonoplaneError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Creates a `NotFound` error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> MonoplaneError {
        MonoplaneError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the failure is infrastructure-transient and may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            MonoplaneError::Unavailable(_)
            | MonoplaneError::NoCapacity { .. }
            | MonoplaneError::Timeout(_) => true,
            MonoplaneError::HttpRequest(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            MonoplaneError::HttpMiddleware(reqwest_middleware::Error::Reqwest(e)) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }

    /// Whether the error was raised by the sqlx driver for a unique constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            MonoplaneError::Database(sqlx::Error::Database(e)) => e.is_unique_violation(),
            _ => false,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_transient_classification() {
        assert!(MonoplaneError::Unavailable("registry down".into()).is_transient());
        assert!(MonoplaneError::Timeout("health".into()).is_transient());
        assert!(MonoplaneError::NoCapacity {
            region: "eu".into(),
            cpu: 1,
            memory: 1,
            disk: 1
        }
        .is_transient());

        assert!(!MonoplaneError::RunnerRejected {
            runner: "r1".into(),
            reason: "disk full".into()
        }
        .is_transient());
        assert!(!MonoplaneError::Validation("bad name".into()).is_transient());
        assert!(!MonoplaneError::not_found("region", "eu").is_transient());
    }

    #[test]
    fn test_error_not_found_display() {
        let err = MonoplaneError::not_found("sandbox", "sbx-1");
        assert_eq!(err.to_string(), "sandbox not found: sbx-1");
    }

    #[test]
    fn test_error_custom_keeps_source() {
        let err = MonoplaneError::custom(std::io::Error::new(
            std::io::ErrorKind::Other,
            "socket closed",
        ));
        assert_eq!(err.to_string(), "socket closed");

        let MonoplaneError::Custom(any) = err else {
            panic!("expected a custom error");
        };
        assert!(any.downcast::<std::io::Error>().is_some());
    }
}
