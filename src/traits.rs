//! Seams to the external collaborators of the planner.
//!
//! Geocoding and travel measurement are provided by outside services (or
//! test doubles); the solver consumes distances through
//! [`DistanceMatrixProvider`] so it never talks to a service directly.

use std::fmt;

use crate::matrix::MatrixOutcome;
use crate::model::{Coordinates, Location, Measurement, TravelMode};

/// Failure reported by an external provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The request did not complete within the client timeout.
    Timeout,
    /// The provider asked us to slow down.
    RateLimited,
    /// Server-side failure (5xx-equivalent).
    Server { status: u16, message: String },
    /// Connection or protocol failure before a response was read.
    Transport(String),
    /// The address or pair of points cannot be resolved by the provider.
    NotFound(String),
    /// The provider rejected the request as malformed.
    InvalidRequest(String),
}

impl ProviderError {
    /// Transient errors are worth retrying; the others fail immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout
                | ProviderError::RateLimited
                | ProviderError::Server { .. }
                | ProviderError::Transport(_)
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Timeout => write!(f, "request timed out"),
            ProviderError::RateLimited => write!(f, "rate limited by provider"),
            ProviderError::Server { status, message } => {
                write!(f, "provider error {}: {}", status, message)
            }
            ProviderError::Transport(message) => write!(f, "transport error: {}", message),
            ProviderError::NotFound(message) => write!(f, "not found: {}", message),
            ProviderError::InvalidRequest(message) => write!(f, "invalid request: {}", message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Resolves a free-form address into coordinates.
pub trait Geocoder {
    fn resolve(&self, address: &str) -> Result<Coordinates, ProviderError>;
}

/// Measures travel between two points.
pub trait TravelProvider {
    fn measure(
        &self,
        from: Coordinates,
        to: Coordinates,
        mode: TravelMode,
    ) -> Result<Measurement, ProviderError>;
}

/// Provides a distance/duration matrix for a set of resolved locations.
///
/// The matrix is indexed by the provided location order.
pub trait DistanceMatrixProvider {
    fn matrix_for(&self, locations: &[Location], mode: TravelMode) -> MatrixOutcome;
}

impl<T: Geocoder + ?Sized> Geocoder for &T {
    fn resolve(&self, address: &str) -> Result<Coordinates, ProviderError> {
        (**self).resolve(address)
    }
}

impl<T: TravelProvider + ?Sized> TravelProvider for &T {
    fn measure(
        &self,
        from: Coordinates,
        to: Coordinates,
        mode: TravelMode,
    ) -> Result<Measurement, ProviderError> {
        (**self).measure(from, to, mode)
    }
}
