//! Trip model

use serde::{Deserialize, Serialize};

use super::{EntityId, EntityKind, EntityPayload, SyncEntity};
use crate::error::{Error, Result};

/// A recorded journey, candidate for mileage reimbursement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    /// Vehicle used, if known
    #[serde(default)]
    pub vehicle_id: Option<EntityId>,
    /// Departure timestamp (Unix ms)
    pub started_at: i64,
    /// Arrival timestamp (Unix ms); `None` while the trip is running
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub start_address: Option<String>,
    #[serde(default)]
    pub end_address: Option<String>,
    /// Distance driven in kilometres
    #[serde(default)]
    pub distance_km: f64,
    #[serde(default)]
    pub purpose: Option<String>,
    /// Whether the trip counts towards professional reimbursement
    #[serde(default)]
    pub reimbursable: bool,
}

impl Trip {
    /// Start a new trip at the given time
    #[must_use]
    pub const fn new(started_at: i64) -> Self {
        Self {
            vehicle_id: None,
            started_at,
            ended_at: None,
            start_address: None,
            end_address: None,
            distance_km: 0.0,
            purpose: None,
            reimbursable: false,
        }
    }

    pub const fn is_completed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Elapsed time in milliseconds, once the trip has ended
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at.map(|ended| ended - self.started_at)
    }
}

impl SyncEntity for Trip {
    const KIND: EntityKind = EntityKind::Trip;

    fn into_payload(self) -> EntityPayload {
        EntityPayload::Trip(self)
    }

    fn from_payload(payload: EntityPayload) -> Option<Self> {
        match payload {
            EntityPayload::Trip(trip) => Some(trip),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.distance_km.is_finite() || self.distance_km < 0.0 {
            return Err(Error::InvalidInput(
                "Trip distance must be a non-negative number".to_string(),
            ));
        }
        if let Some(ended_at) = self.ended_at {
            if ended_at < self.started_at {
                return Err(Error::InvalidInput(
                    "Trip cannot end before it starts".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trip_new() {
        let trip = Trip::new(1_000);
        assert!(!trip.is_completed());
        assert_eq!(trip.duration_ms(), None);
        assert!(trip.validate().is_ok());
    }

    #[test]
    fn test_trip_duration() {
        let trip = Trip {
            ended_at: Some(61_000),
            ..Trip::new(1_000)
        };
        assert!(trip.is_completed());
        assert_eq!(trip.duration_ms(), Some(60_000));
    }

    #[test]
    fn test_trip_validation() {
        let backwards = Trip {
            ended_at: Some(500),
            ..Trip::new(1_000)
        };
        assert!(backwards.validate().is_err());

        let negative = Trip {
            distance_km: -3.0,
            ..Trip::new(1_000)
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_trip_deserialize_defaults() {
        let trip: Trip = serde_json::from_str(r#"{"started_at": 5}"#).unwrap();
        assert_eq!(trip, Trip::new(5));
    }
}
