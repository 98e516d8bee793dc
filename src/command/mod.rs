pub mod router;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::{DeviceId, Mode};
use crate::error::ValidationError;
use crate::rules::Rule;

/// Payload published on `<prefix>/<deviceId>/control`, discriminated by `cmd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum ControlCommand {
    SetPump {
        pump: bool,
    },
    SetMode {
        mode: Mode,
    },
    #[serde(rename_all = "camelCase")]
    SetThresholds {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_on: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hum_air_below: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        soil_below: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lux_below: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    SetRules { rules: Vec<Rule>, saved_at: i64 },
}

impl ControlCommand {
    /// Split a client request `{deviceId, cmd, ...fields}` into its target and command.
    pub fn from_request(request: Value) -> Result<(DeviceId, Self), ValidationError> {
        let Value::Object(mut fields) = request else {
            return Err(ValidationError::InvalidCommand(
                "request must be a JSON object".into(),
            ));
        };

        let device_id = match fields.remove("deviceId") {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            _ => return Err(ValidationError::MissingDeviceId),
        };

        let command = serde_json::from_value(Value::Object(fields))
            .map_err(|e| ValidationError::InvalidCommand(e.to_string()))?;
        Ok((device_id, command))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::SetPump { .. } => "setPump",
            ControlCommand::SetMode { .. } => "setMode",
            ControlCommand::SetThresholds { .. } => "setThresholds",
            ControlCommand::SetRules { .. } => "setRules",
        }
    }
}
