use serde::Deserialize;

use super::{DeviceId, Mode, SensorReading};
use crate::error::DecodeError;

/// Payload published on `<prefix>/<deviceId>/sensor`. Unknown fields are ignored.
#[derive(Deserialize)]
struct SensorPayload {
    temperature: Option<f64>,
    humidity: Option<f64>,
    soil_moisture: Option<f64>,
    light: Option<f64>,
    relay_status: Option<bool>,
    mode: Option<Mode>,
    ts: Option<i64>,
}

/// Turn an inbound telemetry message into a reading stamped with `received_at`.
pub fn decode(topic: &str, payload: &[u8], received_at: i64) -> Result<SensorReading, DecodeError> {
    let device_id = device_id_from_topic(topic)
        .ok_or_else(|| DecodeError::MalformedTopic(topic.to_string()))?;

    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| DecodeError::InvalidPayload(e.to_string()))?;
    let Some(fields) = value.as_object() else {
        return Err(DecodeError::InvalidPayload("expected a JSON object".into()));
    };
    if fields.is_empty() {
        return Err(DecodeError::InvalidPayload("empty object".into()));
    }

    let parsed: SensorPayload = serde_json::from_value(value)
        .map_err(|e| DecodeError::InvalidPayload(e.to_string()))?;

    Ok(SensorReading {
        device_id,
        temperature: parsed.temperature,
        humidity: parsed.humidity,
        soil_moisture: parsed.soil_moisture,
        light: parsed.light,
        relay_status: parsed.relay_status,
        mode: parsed.mode,
        device_timestamp: parsed.ts,
        received_at,
    })
}

/// `farm/node-1/sensor` → `node-1`
fn device_id_from_topic(topic: &str) -> Option<DeviceId> {
    topic
        .split('/')
        .nth(1)
        .filter(|segment| !segment.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decodes_full_payload() {
        let payload = br#"{"temperature":30.5,"humidity":55,"soil_moisture":40,"light":300,
            "relay_status":false,"mode":"auto","ts":1000}"#;
        let reading = decode("farm/node-1/sensor", payload, 42).unwrap();
        assert_eq!(
            reading,
            SensorReading {
                device_id: "node-1".into(),
                temperature: Some(30.5),
                humidity: Some(55.0),
                soil_moisture: Some(40.0),
                light: Some(300.0),
                relay_status: Some(false),
                mode: Some(Mode::Auto),
                device_timestamp: Some(1000),
                received_at: 42,
            }
        );
    }

    #[test]
    fn sparse_payload_leaves_missing_fields_empty() {
        let reading = decode("farm/node-2/sensor", br#"{"humidity":12.5,"fw":"1.2"}"#, 7).unwrap();
        assert_eq!(reading.humidity, Some(12.5));
        assert_eq!(reading.temperature, None);
        assert_eq!(reading.relay_status, None);
        assert_eq!(reading.mode, None);
    }

    #[test]
    fn rejects_topic_without_device_segment() {
        assert!(matches!(
            decode("farm", br#"{"temperature":1}"#, 0),
            Err(DecodeError::MalformedTopic(_))
        ));
        assert!(matches!(
            decode("farm//sensor", br#"{"temperature":1}"#, 0),
            Err(DecodeError::MalformedTopic(_))
        ));
    }

    #[test]
    fn rejects_bad_payloads() {
        let payloads: [&[u8]; 4] = [b"not json", b"{}", b"[1,2]", br#"{"mode":"turbo"}"#];
        for payload in payloads {
            assert!(
                matches!(
                    decode("farm/node-1/sensor", payload, 0),
                    Err(DecodeError::InvalidPayload(_))
                ),
                "payload {:?} should be rejected",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn serializes_with_device_field_names() {
        let reading = decode("farm/node-1/sensor", br#"{"soil_moisture":40,"ts":5}"#, 9).unwrap();
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"deviceId":"node-1","soil_moisture":40.0,"ts":5,"receivedAt":9})
        );
    }
}
