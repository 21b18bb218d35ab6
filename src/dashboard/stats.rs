use std::collections::BTreeMap;
use std::fmt;

use crate::reading::SensorReading;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    Temperature,
    Humidity,
    Ph,
    Nitrate,
    Turbidity,
    WaterLevel,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Temperature,
        Metric::Humidity,
        Metric::Ph,
        Metric::Nitrate,
        Metric::Turbidity,
        Metric::WaterLevel,
    ];

    pub fn value(self, reading: &SensorReading) -> f64 {
        match self {
            Metric::Temperature => reading.temperature,
            Metric::Humidity => reading.humidity,
            Metric::Ph => reading.ph,
            Metric::Nitrate => reading.nitrate,
            Metric::Turbidity => reading.turbidity,
            Metric::WaterLevel => reading.water_level,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Metric::Temperature => "°C",
            Metric::Ph => "",
            Metric::Nitrate => "ppm",
            Metric::Humidity | Metric::Turbidity | Metric::WaterLevel => "%",
        }
    }

    /// Changes smaller than this are reported as steady.
    fn steady_band(self) -> f64 {
        match self {
            Metric::Ph => 0.05,
            Metric::Temperature => 0.2,
            _ => 0.5,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::Ph => "pH",
            Metric::Nitrate => "nitrate",
            Metric::Turbidity => "turbidity",
            Metric::WaterLevel => "water level",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Aggregates over a set of readings, one [`Summary`] per metric.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingStats {
    pub samples: usize,
    summaries: BTreeMap<Metric, Summary>,
}

impl ReadingStats {
    pub fn from_readings(readings: &[SensorReading]) -> Self {
        if readings.is_empty() {
            return Self::default();
        }

        let summaries = Metric::ALL
            .into_iter()
            .map(|metric| {
                let (min, max, sum) = readings.iter().map(|r| metric.value(r)).fold(
                    (f64::INFINITY, f64::NEG_INFINITY, 0.0),
                    |(min, max, sum), v| (min.min(v), max.max(v), sum + v),
                );
                let mean = sum / readings.len() as f64;
                (metric, Summary { min, max, mean })
            })
            .collect();

        Self {
            samples: readings.len(),
            summaries,
        }
    }

    pub fn get(&self, metric: Metric) -> Option<&Summary> {
        self.summaries.get(&metric)
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
}

impl fmt::Display for ReadingStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "no readings");
        }
        write!(f, "{} readings", self.samples)?;
        for (metric, s) in &self.summaries {
            write!(
                f,
                "; {metric} {:.1}..{:.1} (avg {:.2}){}",
                s.min,
                s.max,
                s.mean,
                metric.unit()
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Rising,
    Falling,
    Steady,
}

impl Trend {
    pub fn between(metric: Metric, previous: &SensorReading, latest: &SensorReading) -> Self {
        let delta = metric.value(latest) - metric.value(previous);
        if delta.abs() <= metric.steady_band() {
            Trend::Steady
        } else if delta > 0.0 {
            Trend::Rising
        } else {
            Trend::Falling
        }
    }

    /// Trend of every metric from `previous` to `latest`.
    pub fn all(previous: &SensorReading, latest: &SensorReading) -> Vec<(Metric, Trend)> {
        Metric::ALL
            .into_iter()
            .map(|metric| (metric, Trend::between(metric, previous, latest)))
            .collect()
    }

    pub fn arrow(self) -> &'static str {
        match self {
            Trend::Rising => "↑",
            Trend::Falling => "↓",
            Trend::Steady => "→",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::fixtures::reading;

    #[test]
    fn min_max_mean_per_metric() {
        let mut warm = reading(24.0);
        warm.ph = 8.0;
        let readings = vec![reading(20.0), reading(22.0), warm];

        let stats = ReadingStats::from_readings(&readings);
        assert_eq!(stats.samples, 3);
        let temp = stats.get(Metric::Temperature).unwrap();
        assert_eq!((temp.min, temp.max, temp.mean), (20.0, 24.0, 22.0));
        let ph = stats.get(Metric::Ph).unwrap();
        assert_eq!(ph.max, 8.0);
        assert!((ph.mean - 7.466).abs() < 0.01);
    }

    #[test]
    fn empty_input_has_no_summaries() {
        let stats = ReadingStats::from_readings(&[]);
        assert!(stats.is_empty());
        assert!(stats.get(Metric::Nitrate).is_none());
        assert_eq!(stats.to_string(), "no readings");
    }

    #[test]
    fn trend_uses_steady_band() {
        let before = reading(20.0);
        let mut after = reading(20.1);
        assert_eq!(Trend::between(Metric::Temperature, &before, &after), Trend::Steady);

        after.temperature = 21.0;
        after.ph = 6.9;
        assert_eq!(Trend::between(Metric::Temperature, &before, &after), Trend::Rising);
        assert_eq!(Trend::between(Metric::Ph, &before, &after), Trend::Falling);
        assert_eq!(Trend::all(&before, &after).len(), Metric::ALL.len());
    }
}
