use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier assigned by the repository when a reading is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadingId(Uuid);

impl ReadingId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ReadingId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One snapshot of all water quality sensors.
///
/// Readings decoded from the broker carry neither `id` nor `timestamp`; the
/// repository fills both in when the reading is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Water temperature in °C
    pub temperature: f64,
    /// Relative humidity in %
    pub humidity: f64,
    /// pH, nominally 0-14
    pub ph: f64,
    /// Nitrate in ppm
    pub nitrate: f64,
    /// Turbidity in %
    pub turbidity: f64,
    /// Tank fill level in %
    pub water_level: f64,
    /// Classification reported by the sensor node, e.g. "Normal"
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ReadingId>,
}

impl SensorReading {
    pub fn is_persisted(&self) -> bool {
        self.id.is_some() && self.timestamp.is_some()
    }

    /// Returns a persisted copy stamped with `id` and, if unset, `now`.
    pub fn persisted(mut self, id: ReadingId, now: DateTime<Utc>) -> Self {
        self.id = Some(id);
        self.timestamp.get_or_insert(now);
        self
    }
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:.1}°C {:.0}%RH pH {:.2} NO3 {:.1}ppm turb {:.0}% level {:.0}% [{}]",
            self.temperature,
            self.humidity,
            self.ph,
            self.nitrate,
            self.turbidity,
            self.water_level,
            self.status
        )
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::reading;
    use super::*;

    #[test]
    fn fresh_reading_is_unsaved() {
        assert!(!reading(20.0).is_persisted());
    }

    #[test]
    fn persisting_keeps_existing_timestamp() {
        let earlier = Utc::now() - chrono::Duration::hours(1);
        let mut r = reading(20.0);
        r.timestamp = Some(earlier);

        let stored = r.persisted(ReadingId::generate(), Utc::now());
        assert!(stored.is_persisted());
        assert_eq!(stored.timestamp, Some(earlier));
    }
}
