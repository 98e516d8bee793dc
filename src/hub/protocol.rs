//! JSON frames exchanged with real-time subscribers over the WebSocket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::{DeviceId, DeviceState, SensorReading};
use crate::rules::RuleSet;

/// Server → client events, framed as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "sensor:snapshot")]
    SensorSnapshot(Vec<DeviceState>),
    #[serde(rename = "sensor:data")]
    SensorData(SensorData),
    #[serde(rename = "device:status")]
    DeviceStatus(DeviceStatus),
    #[serde(rename = "rules:snapshot")]
    RulesSnapshot(Vec<RuleSet>),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SensorSnapshot(_) => "sensor:snapshot",
            ServerEvent::SensorData(_) => "sensor:data",
            ServerEvent::DeviceStatus(_) => "device:status",
            ServerEvent::RulesSnapshot(_) => "rules:snapshot",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorData {
    #[serde(flatten)]
    pub reading: SensorReading,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub online: bool,
    pub at: i64,
}

/// Client → server request. `id` is echoed back on the ack.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRulesRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub rules: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckReply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            saved_at: None,
            error: None,
        }
    }

    pub fn saved(saved_at: i64) -> Self {
        Self {
            saved_at: Some(saved_at),
            ..Self::ok()
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            ok: false,
            saved_at: None,
            error: Some(error.to_string()),
        }
    }
}

/// `{"event":"ack","id":..,"data":{..}}`, sent only to the requesting subscriber.
#[derive(Debug, Serialize)]
pub struct AckFrame {
    pub event: &'static str,
    pub id: Option<u64>,
    pub data: AckReply,
}

impl AckFrame {
    pub fn new(id: Option<u64>, data: AckReply) -> Self {
        Self {
            event: "ack",
            id,
            data,
        }
    }
}
