//! tour-planner core
//!
//! Resolves addresses, orders them into a short tour and splits the tour
//! into travel days under a daily distance cap.

pub mod cache;
pub mod config;
pub mod error;
pub mod geocode;
pub mod haversine;
pub mod matrix;
pub mod model;
pub mod nominatim;
pub mod oracle;
pub mod osrm;
pub mod partition;
pub mod planner;
pub mod polyline;
pub mod retry;
pub mod solver;
pub mod traits;
pub mod tsp;

pub use error::{CacheError, PlannerError};
pub use model::{Coordinates, Location, LocationId, Route, Strategy, TravelMode};
pub use planner::{Plan, Planner};
