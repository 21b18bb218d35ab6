//! Decoding of inbound sensor payloads.
//!
//! Sensor nodes publish a flat JSON object with short field names. Every value
//! is range checked here so nothing unvalidated reaches the repository.

use crate::error::DecodeError;
use crate::reading::SensorReading;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct WirePayload {
    temp: f64,
    humidity: f64,
    ph: f64,
    nitrate: f64,
    turbidity: f64,
    level: f64,
    #[serde(default = "unknown_status")]
    status: String,
}

fn unknown_status() -> String {
    "Unknown".to_string()
}

fn check(field: &'static str, value: f64, min: f64, max: f64) -> Result<f64, DecodeError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(DecodeError::OutOfRange { field, value })
    }
}

pub fn decode_reading(payload: &[u8]) -> Result<SensorReading, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let wire: WirePayload = serde_json::from_str(text)?;

    Ok(SensorReading {
        temperature: check("temp", wire.temp, -50.0, 100.0)?,
        humidity: check("humidity", wire.humidity, 0.0, 100.0)?,
        ph: check("ph", wire.ph, 0.0, 14.0)?,
        nitrate: check("nitrate", wire.nitrate, 0.0, f64::MAX)?,
        turbidity: check("turbidity", wire.turbidity, 0.0, 100.0)?,
        water_level: check("level", wire.level, 0.0, 100.0)?,
        status: wire.status.trim().to_string(),
        timestamp: None,
        id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"temp":21.5,"humidity":60,"ph":7.2,"nitrate":10,"turbidity":5,"level":80,"status":"Normal"}"#;

    #[test]
    fn decodes_sensor_node_payload() {
        let reading = decode_reading(SAMPLE.as_bytes()).unwrap();
        assert_eq!(reading.temperature, 21.5);
        assert_eq!(reading.humidity, 60.0);
        assert_eq!(reading.ph, 7.2);
        assert_eq!(reading.water_level, 80.0);
        assert_eq!(reading.status, "Normal");
        assert!(reading.timestamp.is_none());
        assert!(reading.id.is_none());
    }

    #[test]
    fn missing_status_is_unknown() {
        let json = r#"{"temp":1,"humidity":2,"ph":3,"nitrate":4,"turbidity":5,"level":6}"#;
        assert_eq!(decode_reading(json.as_bytes()).unwrap().status, "Unknown");
    }

    #[test]
    fn rejects_missing_fields_and_garbage() {
        assert!(matches!(
            decode_reading(br#"{"temp":21.5}"#),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(decode_reading(b"not json"), Err(DecodeError::Json(_))));
        assert!(matches!(
            decode_reading(&[0xff, 0xfe, 0x00]),
            Err(DecodeError::Utf8(_))
        ));
    }

    #[test]
    fn rejects_ph_out_of_range() {
        let json = r#"{"temp":20,"humidity":60,"ph":15.1,"nitrate":10,"turbidity":5,"level":80}"#;
        match decode_reading(json.as_bytes()) {
            Err(DecodeError::OutOfRange { field, .. }) => assert_eq!(field, "ph"),
            other => panic!("expected range error, got {other:?}"),
        }
    }
}
