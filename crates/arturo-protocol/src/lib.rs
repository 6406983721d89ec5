//! arturo-protocol: envelope and payload types for the controller <-> station
//! wire protocol.
//!
//! Every message on the broker is an [`Envelope`] wrapping a [`Payload`].
//! The payload carries its own `type` tag so decode/encode stays total and
//! type-unsafe partial results are never produced: either the whole envelope
//! decodes, or [`decode`] returns a [`ParseError`].

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const SCHEMA_VERSION: &str = "v1.0.0";

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Identifies the emitter of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub service: String,
    pub instance: String,
    pub version: String,
}

// ---------------------------------------------------------------------------
// Payload variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub device_id: String,
    pub command_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub device_id: String,
    pub command_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: String,
    pub uptime_seconds: u64,
    pub devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_types: Option<Vec<String>>,
    pub free_heap: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_free_heap: Option<u64>,
    pub wifi_rssi: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_reconnects: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_reconnects: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands_failed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_resets: Option<u64>,
    pub firmware_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstopReason {
    ButtonPress,
    OperatorCommand,
    SafetyInterlock,
    DeviceFault,
    SoftwareError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyStop {
    pub reason: EstopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaRequest {
    pub firmware_url: String,
    pub version: String,
    pub sha256: String,
    #[serde(default)]
    pub force: bool,
}

/// Closed set of payload kinds. Tagged on the wire by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    #[serde(rename = "command.request")]
    CommandRequest(CommandRequest),
    #[serde(rename = "command.response")]
    CommandResponse(CommandResponse),
    Heartbeat(Heartbeat),
    EmergencyStop(EmergencyStop),
    #[serde(rename = "ota.request")]
    OtaRequest(OtaRequest),
}

impl Payload {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Payload::CommandRequest(_) => "command.request",
            Payload::CommandResponse(_) => "command.response",
            Payload::Heartbeat(_) => "heartbeat",
            Payload::EmergencyStop(_) => "emergency_stop",
            Payload::OtaRequest(_) => "ota.request",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub timestamp: i64,
    pub source: Source,
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(flatten)]
    pub payload: Payload,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("bad value at {0}")]
    BadValue(String),
    #[error("schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: String, found: String },
    #[error("unknown payload type: {0}")]
    UnknownType(String),
}

const KNOWN_PAYLOAD_TYPES: &[&str] = &[
    "command.request",
    "command.response",
    "heartbeat",
    "emergency_stop",
    "ota.request",
];

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

/// Encodes an envelope to its wire bytes. Total: fails only on bugs (an
/// envelope that was constructed through [`build_command_request`] or
/// validated by [`decode`] always serializes).
pub fn encode(message: &Envelope) -> Vec<u8> {
    serde_json::to_vec(message).expect("envelope must always serialize")
}

/// Decodes and validates an envelope. All-or-nothing: a partially valid
/// message is never returned.
pub fn decode(bytes: &[u8]) -> Result<Envelope, ParseError> {
    let raw: serde_json::Value = serde_json::from_slice(bytes)?;
    match raw.get("type").and_then(serde_json::Value::as_str) {
        Some(type_tag) if KNOWN_PAYLOAD_TYPES.contains(&type_tag) => {}
        Some(type_tag) => return Err(ParseError::UnknownType(type_tag.to_owned())),
        None => return Err(ParseError::MissingField("type".to_owned())),
    }

    let envelope: Envelope = serde_json::from_value(raw)?;

    if envelope.id.is_empty() {
        return Err(ParseError::MissingField("id".to_owned()));
    }
    if envelope.schema_version != SCHEMA_VERSION {
        return Err(ParseError::SchemaMismatch {
            expected: SCHEMA_VERSION.to_owned(),
            found: envelope.schema_version.clone(),
        });
    }

    validate_correlation_shape(&envelope)?;
    validate_payload(&envelope.payload)?;

    Ok(envelope)
}

fn validate_correlation_shape(envelope: &Envelope) -> Result<(), ParseError> {
    match &envelope.payload {
        Payload::CommandRequest(_) | Payload::OtaRequest(_) => {
            if envelope.correlation_id.is_none() {
                return Err(ParseError::MissingField("correlation_id".to_owned()));
            }
            if envelope.reply_to.is_none() {
                return Err(ParseError::MissingField("reply_to".to_owned()));
            }
        }
        Payload::CommandResponse(_) => {
            if envelope.correlation_id.is_none() {
                return Err(ParseError::MissingField("correlation_id".to_owned()));
            }
        }
        Payload::Heartbeat(_) | Payload::EmergencyStop(_) => {}
    }
    Ok(())
}

fn validate_payload(payload: &Payload) -> Result<(), ParseError> {
    match payload {
        Payload::CommandResponse(resp) => {
            if !resp.success && resp.error.is_none() {
                return Err(ParseError::MissingField(
                    "command.response.error (required when success=false)".to_owned(),
                ));
            }
            Ok(())
        }
        Payload::OtaRequest(ota) => {
            validate_semver(&ota.version)?;
            validate_sha256(&ota.sha256)?;
            Ok(())
        }
        Payload::CommandRequest(_) | Payload::Heartbeat(_) | Payload::EmergencyStop(_) => Ok(()),
    }
}

fn validate_semver(version: &str) -> Result<(), ParseError> {
    semver::Version::parse(version)
        .map(|_| ())
        .map_err(|_| ParseError::BadValue(format!("ota.request.version '{version}'")))
}

fn validate_sha256(sha256: &str) -> Result<(), ParseError> {
    let is_lowercase_hex = sha256.len() == 64
        && sha256
            .bytes()
            .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
    if !is_lowercase_hex {
        return Err(ParseError::BadValue("ota.request.sha256".to_owned()));
    }
    Ok(())
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// Builds a well-formed `command.request` envelope with a fresh id and
/// correlation id, and `reply_to` set to the source's own response stream.
pub fn build_command_request(
    source: Source,
    device_id: impl Into<String>,
    command_name: impl Into<String>,
    parameters: Option<serde_json::Value>,
    timeout_ms: Option<u64>,
) -> Envelope {
    let reply_to = response_stream_name(&source.instance);
    Envelope {
        id: Uuid::new_v4().to_string(),
        timestamp: now_seconds(),
        correlation_id: Some(Uuid::new_v4().to_string()),
        reply_to: Some(reply_to),
        schema_version: SCHEMA_VERSION.to_owned(),
        source,
        payload: Payload::CommandRequest(CommandRequest {
            device_id: device_id.into(),
            command_name: command_name.into(),
            parameters,
            timeout_ms: timeout_ms.unwrap_or_else(default_timeout_ms),
        }),
    }
}

/// Builds a well-formed `ota.request` envelope, validating `version` and
/// `sha256` up front so a malformed request is rejected at the call site
/// rather than surfacing as a [`ParseError`] deep in the broker pipeline.
pub fn build_ota_request(
    source: Source,
    firmware_url: impl Into<String>,
    version: impl Into<String>,
    sha256: impl Into<String>,
    force: bool,
) -> Result<Envelope, ParseError> {
    let version = version.into();
    let sha256 = sha256.into();
    validate_semver(&version)?;
    validate_sha256(&sha256)?;

    let reply_to = response_stream_name(&source.instance);
    Ok(Envelope {
        id: Uuid::new_v4().to_string(),
        timestamp: now_seconds(),
        correlation_id: Some(Uuid::new_v4().to_string()),
        reply_to: Some(reply_to),
        schema_version: SCHEMA_VERSION.to_owned(),
        source,
        payload: Payload::OtaRequest(OtaRequest {
            firmware_url: firmware_url.into(),
            version,
            sha256,
            force,
        }),
    })
}

pub fn command_stream_name(instance: &str) -> String {
    format!("commands:{instance}")
}

pub fn response_stream_name(instance: &str) -> String {
    format!("responses:{instance}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn source() -> Source {
        Source {
            service: "controller".to_owned(),
            instance: "ctrl-01".to_owned(),
            version: "1.0.0".to_owned(),
        }
    }

    #[test]
    fn command_request_round_trips() {
        let msg = build_command_request(source(), "PUMP-01", "pump_status", None, None);
        let bytes = encode(&msg);
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn heartbeat_round_trips() {
        let msg = Envelope {
            id: Uuid::new_v4().to_string(),
            timestamp: 1_700_000_000,
            source: Source {
                service: "station".to_owned(),
                instance: "station-01".to_owned(),
                version: "2.1.0".to_owned(),
            },
            schema_version: SCHEMA_VERSION.to_owned(),
            correlation_id: None,
            reply_to: None,
            payload: Payload::Heartbeat(Heartbeat {
                status: "ok".to_owned(),
                uptime_seconds: 42,
                devices: vec!["PUMP-01".to_owned()],
                device_types: None,
                free_heap: 1024,
                min_free_heap: None,
                wifi_rssi: -55,
                wifi_reconnects: None,
                redis_reconnects: None,
                commands_processed: None,
                commands_failed: None,
                last_error: None,
                watchdog_resets: None,
                firmware_version: "1.2.3".to_owned(),
            }),
        };
        let bytes = encode(&msg);
        assert_eq!(decode(&bytes).expect("decode"), msg);
    }

    #[test]
    fn command_request_without_correlation_is_rejected() {
        let mut msg = build_command_request(source(), "PUMP-01", "pump_status", None, None);
        msg.correlation_id = None;
        let bytes = encode(&msg);
        assert!(matches!(decode(&bytes), Err(ParseError::MissingField(_))));
    }

    #[test]
    fn command_response_without_error_on_failure_is_rejected() {
        let msg = Envelope {
            id: Uuid::new_v4().to_string(),
            timestamp: now_seconds(),
            source: source(),
            schema_version: SCHEMA_VERSION.to_owned(),
            correlation_id: Some(Uuid::new_v4().to_string()),
            reply_to: None,
            payload: Payload::CommandResponse(CommandResponse {
                device_id: "PUMP-01".to_owned(),
                command_name: "pump_status".to_owned(),
                success: false,
                response: None,
                error: None,
                duration_ms: 10,
            }),
        };
        let bytes = encode(&msg);
        assert!(matches!(decode(&bytes), Err(ParseError::MissingField(_))));
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let mut msg = build_command_request(source(), "PUMP-01", "pump_status", None, None);
        msg.schema_version = "v0.9.0".to_owned();
        let bytes = encode(&msg);
        assert!(matches!(decode(&bytes), Err(ParseError::SchemaMismatch { .. })));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let bytes = br#"{"id":"x","timestamp":1,"source":{"service":"a","instance":"b","version":"1"},"schema_version":"v1.0.0","type":"frobnicate"}"#;
        assert!(matches!(decode(bytes), Err(ParseError::UnknownType(ref t)) if t == "frobnicate"));
    }

    #[test]
    fn ota_request_validates_semver_and_sha256() {
        let ok = build_ota_request(source(), "https://fw/1", "1.2.3", "a".repeat(64), false);
        assert!(ok.is_ok());

        let bad_semver = build_ota_request(source(), "https://fw/1", "not-semver", "a".repeat(64), false);
        assert!(bad_semver.is_err());

        let bad_sha = build_ota_request(source(), "https://fw/1", "1.2.3", "xyz", false);
        assert!(bad_sha.is_err());
    }

    #[test]
    fn correlation_ids_are_overwhelmingly_unique() {
        let mut ids = HashSet::new();
        for _ in 0..10_000 {
            let msg = build_command_request(source(), "PUMP-01", "pump_status", None, None);
            assert!(ids.insert(msg.correlation_id.clone()));
            assert!(ids.insert(msg.id.clone()));
        }
    }

    #[test]
    fn stream_names_follow_convention() {
        assert_eq!(command_stream_name("station-01"), "commands:station-01");
        assert_eq!(response_stream_name("ctrl-01"), "responses:ctrl-01");
    }
}
