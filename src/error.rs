//! Error types shared across the planner.

use std::fmt;
use std::io;

use crate::model::LocationId;
use crate::traits::ProviderError;

#[derive(Debug)]
pub enum PlannerError {
    /// The location cannot be geocoded or routed to. Fatal for that
    /// location only; callers exclude it and report it.
    LocationUnresolvable {
        id: Option<LocationId>,
        address: String,
        reason: String,
    },
    /// Transient provider failures exhausted the retry budget.
    LookupUnavailable {
        operation: String,
        attempts: u32,
        last_error: ProviderError,
    },
    InvalidInput(String),
    Cache(CacheError),
    Config(String),
    WorkerPool(String),
}

impl PlannerError {
    pub fn is_unresolvable(&self) -> bool {
        matches!(self, PlannerError::LocationUnresolvable { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, PlannerError::LookupUnavailable { .. })
    }
}

impl fmt::Display for PlannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannerError::LocationUnresolvable { id, address, reason } => match id {
                Some(id) => write!(f, "location {} ({}) unresolvable: {}", id, address, reason),
                None => write!(f, "address '{}' unresolvable: {}", address, reason),
            },
            PlannerError::LookupUnavailable {
                operation,
                attempts,
                last_error,
            } => write!(
                f,
                "{} unavailable after {} attempts: {}",
                operation, attempts, last_error
            ),
            PlannerError::InvalidInput(message) => write!(f, "invalid input: {}", message),
            PlannerError::Cache(err) => write!(f, "cache error: {}", err),
            PlannerError::Config(message) => write!(f, "configuration error: {}", message),
            PlannerError::WorkerPool(message) => write!(f, "worker pool error: {}", message),
        }
    }
}

impl std::error::Error for PlannerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlannerError::LookupUnavailable { last_error, .. } => Some(last_error),
            PlannerError::Cache(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CacheError> for PlannerError {
    fn from(err: CacheError) -> Self {
        PlannerError::Cache(err)
    }
}

impl From<rayon::ThreadPoolBuildError> for PlannerError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        PlannerError::WorkerPool(err.to_string())
    }
}

#[derive(Debug)]
pub enum CacheError {
    Io(io::Error),
    Serialization(serde_json::Error),
    /// A stored payload or file could not be decoded.
    Corruption(String),
    /// A live entry already holds a different value for this key.
    Conflict { key: String },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(err) => write!(f, "io: {}", err),
            CacheError::Serialization(err) => write!(f, "serialization: {}", err),
            CacheError::Corruption(message) => write!(f, "corrupt cache data: {}", message),
            CacheError::Conflict { key } => {
                write!(f, "entry '{}' already holds a different value", key)
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err),
            CacheError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Io(err)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err)
    }
}
