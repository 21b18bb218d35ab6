use std::fmt;

use serde::{Deserialize, Serialize};

use super::stats::Metric;
use crate::reading::SensorReading;

/// Acceptable bands for tank water.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub ph_min: f64,
    pub ph_max: f64,
    pub temperature_min: f64,
    pub temperature_max: f64,
    pub nitrate_max: f64,
    pub turbidity_max: f64,
    pub water_level_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            ph_min: 6.5,
            ph_max: 8.5,
            temperature_min: 10.0,
            temperature_max: 30.0,
            nitrate_max: 40.0,
            turbidity_max: 50.0,
            water_level_min: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Below,
    Above,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub metric: Metric,
    pub value: f64,
    pub bound: Bound,
    pub limit: f64,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let relation = match self.bound {
            Bound::Below => "below",
            Bound::Above => "above",
        };
        write!(
            f,
            "{} {:.2}{} {} limit {:.2}",
            self.metric,
            self.value,
            self.metric.unit(),
            relation,
            self.limit
        )
    }
}

impl Thresholds {
    pub fn alerts(&self, reading: &SensorReading) -> Vec<Alert> {
        let checks = [
            (Metric::Ph, Some(self.ph_min), Some(self.ph_max)),
            (
                Metric::Temperature,
                Some(self.temperature_min),
                Some(self.temperature_max),
            ),
            (Metric::Nitrate, None, Some(self.nitrate_max)),
            (Metric::Turbidity, None, Some(self.turbidity_max)),
            (Metric::WaterLevel, Some(self.water_level_min), None),
        ];

        let mut alerts = Vec::new();
        for (metric, min, max) in checks {
            let value = metric.value(reading);
            if let Some(limit) = min.filter(|limit| value < *limit) {
                alerts.push(Alert {
                    metric,
                    value,
                    bound: Bound::Below,
                    limit,
                });
            }
            if let Some(limit) = max.filter(|limit| value > *limit) {
                alerts.push(Alert {
                    metric,
                    value,
                    bound: Bound::Above,
                    limit,
                });
            }
        }
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::fixtures::reading;

    #[test]
    fn nominal_reading_raises_nothing() {
        assert!(Thresholds::default().alerts(&reading(21.5)).is_empty());
    }

    #[test]
    fn flags_acidic_low_tank() {
        let mut r = reading(21.5);
        r.ph = 5.9;
        r.water_level = 12.0;

        let alerts = Thresholds::default().alerts(&r);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].metric, Metric::Ph);
        assert_eq!(alerts[0].bound, Bound::Below);
        assert_eq!(alerts[1].metric, Metric::WaterLevel);
        assert_eq!(alerts[0].to_string(), "pH 5.90 below limit 6.50");
    }

    #[test]
    fn limits_are_exclusive() {
        let mut r = reading(30.0);
        r.nitrate = 40.0;
        assert!(Thresholds::default().alerts(&r).is_empty());
    }
}
