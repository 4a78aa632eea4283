//! API request and response types for HTTP/MQTT communication.

use serde::{Deserialize, Serialize};

use crate::commands::{AccessoryValue, DecoderProtocol, Direction};
use crate::state::SensorState;

use super::shared::SharedStation;

// ============================================================================
// Request Types
// ============================================================================

/// Track power request: `{"on": true}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerRequest {
    /// Desired power state
    pub on: bool,
}

/// Locomotive speed request: `{"speed": 40, "protocol": "dcc"}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedRequest {
    /// Speed in backend steps
    pub speed: u16,
    /// Decoder protocol (default MM)
    #[serde(default)]
    pub protocol: DecoderProtocol,
}

/// Locomotive direction request: `{"direction": "backward"}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionRequest {
    /// Desired direction
    pub direction: Direction,
    /// Decoder protocol (default MM)
    #[serde(default)]
    pub protocol: DecoderProtocol,
}

/// Locomotive function request: `{"on": true}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FunctionRequest {
    /// Desired function state
    pub on: bool,
    /// Decoder protocol (default MM)
    #[serde(default)]
    pub protocol: DecoderProtocol,
}

/// Accessory request: `{"value": "green", "switch_time_ms": 200}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccessoryRequest {
    /// Coil to energize
    pub value: AccessoryValue,
    /// Decoder protocol (default MM)
    #[serde(default)]
    pub protocol: DecoderProtocol,
    /// Pulse length, 0 = maximum dwell
    #[serde(default)]
    pub switch_time_ms: u32,
}

// ============================================================================
// Response Types
// ============================================================================

/// API response wrapper for consistent JSON structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response data (present when success=true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (present when success=false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response with data
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Command result response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Whether the command was accepted
    pub accepted: bool,
    /// Result details
    pub result: String,
}

impl CommandResponse {
    /// Command accepted
    pub fn accepted(result: impl Into<String>) -> Self {
        Self {
            accepted: true,
            result: result.into(),
        }
    }

    /// Command not accepted
    pub fn rejected(result: impl Into<String>) -> Self {
        Self {
            accepted: false,
            result: result.into(),
        }
    }

    /// Accepted or rejected with the same result string
    pub fn from_outcome(accepted: bool, result: impl Into<String>) -> Self {
        if accepted {
            Self::accepted(result)
        } else {
            Self::rejected(result)
        }
    }
}

/// Station status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Backend name
    pub backend: String,
    /// Whether the station is connected
    pub connected: bool,
    /// Track power as last reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<bool>,
    /// Sequence number of the newest journaled event
    pub last_event: u64,
}

impl From<&SharedStation> for StatusResponse {
    fn from(shared: &SharedStation) -> Self {
        Self {
            backend: shared.station().name().to_string(),
            connected: shared.station().is_connected(),
            power: shared.journal().power(),
            last_event: shared.journal().last_seq(),
        }
    }
}

/// Raw feedback module reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackResponse {
    /// Module number
    pub module: u16,
    /// The two raw bytes
    pub bytes: [u8; 2],
    /// Active contacts, 1-based
    pub active: Vec<u16>,
}

impl FeedbackResponse {
    /// Decode the contact list from the raw bytes
    pub fn new(module: u16, bytes: [u8; 2]) -> Self {
        let bits = u16::from_be_bytes(bytes);
        let active = (1..=16).filter(|c| bits & (0x8000 >> (c - 1)) != 0).collect();
        Self {
            module,
            bytes,
            active,
        }
    }
}

/// Committed sensor state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorResponse {
    /// Sensor id
    pub id: u32,
    /// Current value
    pub active: bool,
    /// Value before the last change
    pub previous_active: bool,
    /// Whether the last commit changed the value
    pub changed: bool,
    /// Time of the last change in milliseconds
    pub last_change_ms: u64,
}

impl SensorResponse {
    /// Build from a committed state
    pub fn new(id: u32, state: &SensorState) -> Self {
        Self {
            id,
            active: state.active,
            previous_active: state.previous_active,
            changed: state.is_changed(),
            last_change_ms: state.last_change_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Request Types Tests
    // ========================================================================

    #[test]
    fn speed_request_protocol_defaults_to_motorola() {
        let req: SpeedRequest = serde_json::from_str(r#"{"speed": 7}"#).unwrap();
        assert_eq!(req.speed, 7);
        assert_eq!(req.protocol, DecoderProtocol::Mm);

        let req: SpeedRequest = serde_json::from_str(r#"{"speed": 40, "protocol": "dcc"}"#).unwrap();
        assert_eq!(req.protocol, DecoderProtocol::Dcc);
    }

    #[test]
    fn direction_request_uses_lowercase_names() {
        let req: DirectionRequest = serde_json::from_str(r#"{"direction": "backward"}"#).unwrap();
        assert_eq!(req.direction, Direction::Backward);
        assert!(serde_json::from_str::<DirectionRequest>(r#"{"direction": "stopped"}"#).is_err());
    }

    #[test]
    fn accessory_request_defaults() {
        let req: AccessoryRequest = serde_json::from_str(r#"{"value": "red"}"#).unwrap();
        assert_eq!(req.value, AccessoryValue::Red);
        assert_eq!(req.switch_time_ms, 0);
    }

    // ========================================================================
    // ApiResponse Tests
    // ========================================================================

    #[test]
    fn api_response_ok() {
        let response = ApiResponse::ok(CommandResponse::accepted("power_on"));
        assert!(response.success);
        assert_eq!(response.error, None);
        let data = response.data.unwrap();
        assert!(data.accepted);
        assert_eq!(data.result, "power_on");
    }

    #[test]
    fn api_response_skip_serializing_none() {
        let json = serde_json::to_string(&ApiResponse::ok(42)).unwrap();
        assert!(!json.contains("error"));

        let json = serde_json::to_string(&ApiResponse::<i32>::err("failed")).unwrap();
        assert!(!json.contains("data"));
        assert!(json.contains("failed"));
    }

    #[test]
    fn command_response_from_outcome() {
        assert!(CommandResponse::from_outcome(true, "x").accepted);
        assert!(!CommandResponse::from_outcome(false, "x").accepted);
    }

    // ========================================================================
    // Derived Responses
    // ========================================================================

    #[test]
    fn feedback_response_lists_active_contacts() {
        let response = FeedbackResponse::new(1, [0x40, 0x01]);
        assert_eq!(response.active, vec![2, 16]);
    }

    #[test]
    fn sensor_response_reports_change() {
        let state = SensorState {
            active: true,
            previous_active: false,
            last_change_ms: 120,
        };
        let response = SensorResponse::new(1002, &state);
        assert!(response.changed);
        assert_eq!(response.last_change_ms, 120);
    }
}
