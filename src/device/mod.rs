pub mod codec;
pub mod liveness;
pub mod registry;

use serde::{Deserialize, Serialize};

/// Taken from the device segment of the telemetry topic.
pub type DeviceId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Manual,
}

/// One telemetry sample. Field names on the wire match what devices publish.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    #[serde(rename = "deviceId")]
    pub device_id: DeviceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soil_moisture: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_status: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    /// Device-side epoch millis, if the device sent one.
    #[serde(rename = "ts", skip_serializing_if = "Option::is_none")]
    pub device_timestamp: Option<i64>,
    #[serde(rename = "receivedAt")]
    pub received_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub device_id: DeviceId,
    pub latest: SensorReading,
    pub online: bool,
    pub last_seen_at: i64,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
