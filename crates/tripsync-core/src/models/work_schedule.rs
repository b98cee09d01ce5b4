//! Work schedule model

use serde::{Deserialize, Serialize};

use super::{EntityKind, EntityPayload, SyncEntity};
use crate::error::{Error, Result};

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Working hours for one weekday, used to classify trips as professional
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSchedule {
    /// ISO weekday, 1 = Monday through 7 = Sunday
    pub weekday: u8,
    /// Minutes after midnight
    pub start_minute: u16,
    pub end_minute: u16,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

const fn default_active() -> bool {
    true
}

impl WorkSchedule {
    #[must_use]
    pub const fn new(weekday: u8, start_minute: u16, end_minute: u16) -> Self {
        Self {
            weekday,
            start_minute,
            end_minute,
            is_active: true,
        }
    }

    /// Whether `minute` (after midnight) falls inside the working hours
    pub const fn contains_minute(&self, minute: u16) -> bool {
        self.is_active && minute >= self.start_minute && minute < self.end_minute
    }
}

impl SyncEntity for WorkSchedule {
    const KIND: EntityKind = EntityKind::WorkSchedule;

    fn into_payload(self) -> EntityPayload {
        EntityPayload::WorkSchedule(self)
    }

    fn from_payload(payload: EntityPayload) -> Option<Self> {
        match payload {
            EntityPayload::WorkSchedule(schedule) => Some(schedule),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(1..=7).contains(&self.weekday) {
            return Err(Error::InvalidInput(format!(
                "Weekday must be between 1 and 7, got {}",
                self.weekday
            )));
        }
        if self.start_minute >= self.end_minute || self.end_minute > MINUTES_PER_DAY {
            return Err(Error::InvalidInput(
                "Work schedule must start before it ends, within one day".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_minute() {
        let schedule = WorkSchedule::new(1, 9 * 60, 17 * 60);
        assert!(schedule.contains_minute(9 * 60));
        assert!(!schedule.contains_minute(17 * 60));

        let inactive = WorkSchedule {
            is_active: false,
            ..schedule
        };
        assert!(!inactive.contains_minute(10 * 60));
    }

    #[test]
    fn test_schedule_validation() {
        assert!(WorkSchedule::new(7, 0, MINUTES_PER_DAY).validate().is_ok());
        assert!(WorkSchedule::new(0, 60, 120).validate().is_err());
        assert!(WorkSchedule::new(3, 120, 60).validate().is_err());
        assert!(WorkSchedule::new(3, 60, MINUTES_PER_DAY + 1).validate().is_err());
    }
}
