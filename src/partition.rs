//! Splits a route into travel days under a daily distance cap.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PlannerError;
use crate::model::{DaySegment, LocationId, Route};

/// A day that could not honour the cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintViolation {
    /// A single leg is longer than the daily cap; it forms a day of its own.
    LegExceedsLimit {
        day: usize,
        from: LocationId,
        to: LocationId,
        distance_km: f64,
        limit_km: f64,
    },
    /// The leg's distance is unknown, so the cap cannot be checked.
    UnresolvedLeg {
        day: usize,
        from: LocationId,
        to: LocationId,
    },
}

impl ConstraintViolation {
    pub fn day(&self) -> usize {
        match self {
            ConstraintViolation::LegExceedsLimit { day, .. } => *day,
            ConstraintViolation::UnresolvedLeg { day, .. } => *day,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub days: Vec<DaySegment>,
    pub violations: Vec<ConstraintViolation>,
}

impl Partition {
    /// Concatenation of every day's stops.
    pub fn stops(&self) -> Vec<LocationId> {
        self.days.iter().flat_map(|day| day.stops.iter().copied()).collect()
    }
}

/// Greedy left-to-right split of `route.path()` into days.
///
/// Legs accumulate into the current day until the next one would push it
/// past `max_daily_distance_km`; that leg then opens a new day at its
/// destination. A leg longer than the cap, or one without a known distance,
/// is the only leg of its day and is reported as a violation. Stops are
/// never reordered.
pub fn partition(route: &Route, max_daily_distance_km: f64) -> Result<Partition, PlannerError> {
    if !(max_daily_distance_km.is_finite() && max_daily_distance_km > 0.0) {
        return Err(PlannerError::InvalidInput(format!(
            "max daily distance must be positive, got {}",
            max_daily_distance_km
        )));
    }

    let path = route.path();
    let Some(&first) = path.first() else {
        return Ok(Partition::default());
    };

    let mut days = vec![DaySegment::new(0, first)];
    let mut violations = Vec::new();
    let mut legs_today = 0usize;
    let mut close_after = false;

    for (index, leg) in path.windows(2).enumerate() {
        let (from, to) = (leg[0], leg[1]);
        let distance = route.leg_distances().get(index).copied().flatten();
        let duration = route.leg_durations().get(index).copied().flatten().unwrap_or(0.0);

        let current_km = days.last().map(|day| day.distance_km).unwrap_or(0.0);
        let fits = match distance {
            Some(km) => current_km + km <= max_daily_distance_km,
            None => false,
        };

        if legs_today > 0 && (close_after || !fits) {
            days.push(DaySegment::new(days.len(), to));
            legs_today = 0;
        } else if let Some(today) = days.last_mut() {
            today.stops.push(to);
        }

        legs_today += 1;
        close_after = false;
        let day = days.len() - 1;
        let today = &mut days[day];
        today.duration_secs += duration;

        match distance {
            Some(km) => {
                today.distance_km += km;
                if km > max_daily_distance_km {
                    warn!(
                        day,
                        %from,
                        %to,
                        distance_km = km,
                        limit_km = max_daily_distance_km,
                        "leg exceeds daily limit"
                    );
                    today.over_limit = true;
                    close_after = true;
                    violations.push(ConstraintViolation::LegExceedsLimit {
                        day,
                        from,
                        to,
                        distance_km: km,
                        limit_km: max_daily_distance_km,
                    });
                }
            }
            None => {
                warn!(day, %from, %to, "leg distance unresolved");
                close_after = true;
                violations.push(ConstraintViolation::UnresolvedLeg { day, from, to });
            }
        }
    }

    info!(days = days.len(), violations = violations.len(), "route partitioned");
    Ok(Partition { days, violations })
}
