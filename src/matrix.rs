//! Pairwise distance matrix over an ordered list of locations.

use serde::{Deserialize, Serialize};

use crate::error::PlannerError;
use crate::model::{LocationId, Measurement};

/// N×N measurements indexed by position in `ids`.
///
/// A missing entry is an unresolved distance: it is reported as infinitely
/// expensive by [`DistanceMatrix::cost`] and never as zero.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMatrix {
    ids: Vec<LocationId>,
    entries: Vec<Option<Measurement>>,
    symmetric: bool,
}

impl DistanceMatrix {
    /// An empty matrix whose diagonal is already zero.
    pub fn new(ids: Vec<LocationId>, symmetric: bool) -> Self {
        let n = ids.len();
        let mut entries = vec![None; n * n];
        for i in 0..n {
            entries[i * n + i] = Some(Measurement::zero());
        }
        Self {
            ids,
            entries,
            symmetric,
        }
    }

    /// Builds a matrix from plain distances; `None` marks an unresolved pair.
    ///
    /// Durations are left at zero. The matrix is symmetric when every pair
    /// agrees in both directions.
    pub fn from_fn<F>(ids: Vec<LocationId>, mut distance: F) -> Self
    where
        F: FnMut(usize, usize) -> Option<f64>,
    {
        let n = ids.len();
        let mut matrix = Self::new(ids, false);
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    matrix.entries[i * n + j] = distance(i, j).map(|d| Measurement::new(d, 0.0));
                }
            }
        }
        matrix.symmetric = (0..n).all(|i| (0..n).all(|j| matrix.distance(i, j) == matrix.distance(j, i)));
        matrix
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[LocationId] {
        &self.ids
    }

    pub fn index_of(&self, id: LocationId) -> Option<usize> {
        self.ids.iter().position(|candidate| *candidate == id)
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    pub fn get(&self, from: usize, to: usize) -> Option<&Measurement> {
        self.entries.get(from * self.len() + to)?.as_ref()
    }

    pub fn distance(&self, from: usize, to: usize) -> Option<f64> {
        self.get(from, to).map(|m| m.distance_km)
    }

    /// Distance used by the solver; unresolved pairs cost infinity.
    pub fn cost(&self, from: usize, to: usize) -> f64 {
        self.distance(from, to).unwrap_or(f64::INFINITY)
    }

    /// Records a measurement. Existing entries are never replaced.
    ///
    /// For a symmetric matrix the reverse direction is filled as well.
    pub(crate) fn insert(
        &mut self,
        from: usize,
        to: usize,
        measurement: Measurement,
    ) -> Result<(), PlannerError> {
        let n = self.len();
        if from >= n || to >= n {
            return Err(PlannerError::InvalidInput(format!(
                "matrix index ({}, {}) out of bounds for {} locations",
                from, to, n
            )));
        }
        if self.entries[from * n + to].is_none() {
            if self.symmetric && self.entries[to * n + from].is_none() {
                self.entries[to * n + from] = Some(measurement.reversed());
            }
            self.entries[from * n + to] = Some(measurement);
        }
        Ok(())
    }

    /// Number of ordered off-diagonal pairs without a measurement.
    pub fn missing(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_none()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.missing() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupFailureKind {
    /// Provider kept failing transiently; safe to retry the run later.
    Unavailable,
    /// Provider cannot route between the two points.
    Unresolvable,
}

/// A pair whose distance could not be obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupFailure {
    pub from: LocationId,
    pub to: LocationId,
    pub kind: LookupFailureKind,
    pub message: String,
}

impl LookupFailure {
    pub fn from_error(from: LocationId, to: LocationId, err: &PlannerError) -> Self {
        let kind = if err.is_unresolvable() {
            LookupFailureKind::Unresolvable
        } else {
            LookupFailureKind::Unavailable
        };
        Self {
            from,
            to,
            kind,
            message: err.to_string(),
        }
    }
}

/// A populated matrix plus the pairs that failed to resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixOutcome {
    pub matrix: DistanceMatrix,
    pub failures: Vec<LookupFailure>,
}

impl MatrixOutcome {
    pub fn is_partial(&self) -> bool {
        !self.matrix.is_complete()
    }
}
