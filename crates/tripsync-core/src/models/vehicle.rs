//! Vehicle model

use serde::{Deserialize, Serialize};

use super::{EntityKind, EntityPayload, SyncEntity};
use crate::error::{Error, Result};

/// Fuel or energy source of a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FuelType {
    #[default]
    Petrol,
    Diesel,
    Electric,
    Hybrid,
    Lpg,
}

/// A vehicle trips can be recorded with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub name: String,
    #[serde(default)]
    pub license_plate: Option<String>,
    /// Administrative horsepower, the input of mileage scales
    #[serde(default)]
    pub fiscal_horsepower: u8,
    #[serde(default)]
    pub fuel_type: FuelType,
    /// Preselected when a new trip starts
    #[serde(default)]
    pub is_default: bool,
}

impl Vehicle {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            license_plate: None,
            fiscal_horsepower: 0,
            fuel_type: FuelType::default(),
            is_default: false,
        }
    }
}

impl SyncEntity for Vehicle {
    const KIND: EntityKind = EntityKind::Vehicle;

    fn into_payload(self) -> EntityPayload {
        EntityPayload::Vehicle(self)
    }

    fn from_payload(payload: EntityPayload) -> Option<Self> {
        match payload {
            EntityPayload::Vehicle(vehicle) => Some(vehicle),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Vehicle name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vehicle_validation() {
        assert!(Vehicle::new("Clio").validate().is_ok());
        assert!(Vehicle::new("   ").validate().is_err());
    }

    #[test]
    fn test_fuel_type_serialization() {
        let json = serde_json::to_string(&FuelType::Lpg).unwrap();
        assert_eq!(json, "\"lpg\"");
    }
}
