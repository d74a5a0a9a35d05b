//! Turns raw event payloads into validated readings.
//!
//! Expected shape:
//!
//! ```json
//! { "device": { "id": "sensor-1" },
//!   "data":   { "value": 21.5, "timestamp": "2024-01-01T00:00:00Z" } }
//! ```
//!
//! The timestamp is optional. When it is missing or not valid RFC 3339 the
//! reading is stamped with the current wall-clock time; that substitution is
//! only visible in the logs. Absent and `null` fields are treated alike, and
//! `observed_at` is truncated to microseconds, the history store's precision.

use chrono::{DateTime, SubsecRound, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("device ID is missing or empty")]
    MissingDeviceId,
}

/// A decoded `(device_id, value, observed_at)` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedReading {
    pub device_id: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
struct Payload {
    #[serde(default)]
    device: Option<DevicePart>,
    #[serde(default)]
    data: Option<DataPart>,
}

#[derive(Debug, Default, Deserialize)]
struct DevicePart {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DataPart {
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    timestamp: Option<String>,
}

pub fn decode(payload: &[u8]) -> Result<DecodedReading, DecodeError> {
    let payload: Payload = serde_json::from_slice(payload)?;

    let device_id = match payload.device.and_then(|device| device.id) {
        Some(id) if !id.is_empty() => id,
        _ => return Err(DecodeError::MissingDeviceId),
    };
    let data = payload.data.unwrap_or_default();

    let observed_at = match data.timestamp.as_deref() {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(e) => {
                warn!(
                    device_id = %device_id,
                    timestamp = raw,
                    "Failed to parse timestamp ({}), using current time",
                    e
                );
                Utc::now()
            }
        },
        None => {
            warn!(device_id = %device_id, "No timestamp in payload, using current time");
            Utc::now()
        }
    };

    Ok(DecodedReading {
        device_id,
        value: data.value.unwrap_or_default(),
        observed_at: observed_at.trunc_subsecs(6),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_full_payload() {
        let payload =
            br#"{"device":{"id":"sensor-1"},"data":{"value":21.5,"timestamp":"2024-01-01T00:00:00Z"}}"#;

        let reading = decode(payload).unwrap();
        assert_eq!(reading.device_id, "sensor-1");
        assert_eq!(reading.value, 21.5);
        assert_eq!(
            reading.observed_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_decode_keeps_offset_timestamp_instant() {
        let payload = br#"{"device":{"id":"d"},"data":{"value":1,"timestamp":"2024-06-01T12:30:00.250+02:00"}}"#;

        let reading = decode(payload).unwrap();
        let expected = DateTime::parse_from_rfc3339("2024-06-01T10:30:00.250Z").unwrap();
        assert_eq!(reading.observed_at, expected);
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(matches!(
            decode(b"invalid json"),
            Err(DecodeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decode_wrong_value_type_is_malformed() {
        let payload = br#"{"device":{"id":"d"},"data":{"value":"hot"}}"#;
        assert!(matches!(
            decode(payload),
            Err(DecodeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decode_missing_device() {
        let payload = br#"{"data":{"value":1.0,"timestamp":"2024-01-01T00:00:00Z"}}"#;
        assert!(matches!(decode(payload), Err(DecodeError::MissingDeviceId)));
    }

    #[test]
    fn test_decode_empty_device_id() {
        let payload = br#"{"device":{"id":""},"data":{"value":1.0}}"#;
        assert!(matches!(decode(payload), Err(DecodeError::MissingDeviceId)));
    }

    #[test]
    fn test_decode_device_id_not_normalized() {
        let payload = br#"{"device":{"id":" Sensor-1 "},"data":{"value":1.0}}"#;
        assert_eq!(decode(payload).unwrap().device_id, " Sensor-1 ");
    }

    #[test]
    fn test_decode_missing_timestamp_defaults_to_now() {
        let before = Utc::now().trunc_subsecs(6);
        let reading = decode(br#"{"device":{"id":"d"},"data":{"value":2.0}}"#).unwrap();
        let after = Utc::now();

        assert!(reading.observed_at >= before && reading.observed_at <= after);
    }

    #[test]
    fn test_decode_unparseable_timestamp_defaults_to_now() {
        let before = Utc::now().trunc_subsecs(6);
        let reading =
            decode(br#"{"device":{"id":"d"},"data":{"value":2.0,"timestamp":"01/02/2024 10:00"}}"#)
                .unwrap();
        let after = Utc::now();

        assert_eq!(reading.value, 2.0);
        assert!(reading.observed_at >= before && reading.observed_at <= after);
    }

    #[test]
    fn test_decode_null_fields_match_absent_ones() {
        assert!(matches!(
            decode(br#"{"device":null,"data":{"value":1.0}}"#),
            Err(DecodeError::MissingDeviceId)
        ));
        assert!(matches!(
            decode(br#"{"device":{"id":null},"data":{"value":1.0}}"#),
            Err(DecodeError::MissingDeviceId)
        ));

        let reading = decode(br#"{"device":{"id":"d"},"data":{"value":null}}"#).unwrap();
        assert_eq!(reading.value, 0.0);

        let reading = decode(br#"{"device":{"id":"d"},"data":null}"#).unwrap();
        assert_eq!(reading.value, 0.0);
    }

    #[test]
    fn test_decode_truncates_to_microseconds() {
        let payload = br#"{"device":{"id":"d"},"data":{"value":1,"timestamp":"2024-01-01T00:00:00.123456789Z"}}"#;
        let reading = decode(payload).unwrap();
        assert_eq!(reading.observed_at.timestamp_subsec_nanos(), 123_456_000);

        let reading = decode(br#"{"device":{"id":"d"},"data":{"value":1}}"#).unwrap();
        assert_eq!(reading.observed_at.timestamp_subsec_nanos() % 1_000, 0);
    }
}
