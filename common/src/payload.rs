use serde::{Deserialize, Serialize};

use crate::reading::Reading;

/// Largest inbound payload that is parsed. Bigger messages are dropped.
pub const MAX_INBOUND_BYTES: usize = 512;

/// The JSON object published once per tick.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TelemetryPayload {
    pub device: String,
    pub temperature_celsius: f32,
    pub temperature_fahrenheit: f32,
    /// Milliseconds since boot.
    pub timestamp: u64,
}

impl TelemetryPayload {
    pub fn new(device: &str, reading: &Reading) -> Self {
        Self {
            device: device.to_string(),
            temperature_celsius: reading.celsius,
            temperature_fahrenheit: reading.fahrenheit,
            timestamp: reading.timestamp_ms,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Inbound command document. Every other field is ignored.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct InboundCommand {
    #[serde(default)]
    pub message: Option<String>,
}

/// Why an inbound payload did not yield a `message` string.
#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("payload too large ({0} bytes)")]
    TooLarge(usize),

    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("no \"message\" string field")]
    NoMessage,
}

/// Extracts the top-level `message` string from an inbound payload.
pub fn parse_message(payload: &[u8]) -> Result<String, InboundError> {
    if payload.len() > MAX_INBOUND_BYTES {
        return Err(InboundError::TooLarge(payload.len()));
    }

    let command: InboundCommand = serde_json::from_slice(payload)?;
    command.message.ok_or(InboundError::NoMessage)
}

#[test]
fn test_payload_schema() {
    let reading = Reading::new(21.5, 70.7, 42_000);
    let json = TelemetryPayload::new("ESP32_Dallas", &reading).to_json().unwrap();

    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    let object = value.as_object().unwrap();
    assert_eq!(object.len(), 4);
    assert_eq!(object["device"], "ESP32_Dallas");
    assert_eq!(object["timestamp"], 42_000);
    assert!((object["temperature_celsius"].as_f64().unwrap() - 21.5).abs() < 1e-4);
    assert!((object["temperature_fahrenheit"].as_f64().unwrap() - 70.7).abs() < 1e-4);
}

#[test]
fn test_payload_round_trip_keeps_values() {
    let reading = Reading::from_celsius(-10.0625, 5);
    let json = TelemetryPayload::new("ESP32_Dallas", &reading).to_json().unwrap();
    let parsed: TelemetryPayload = serde_json::from_str(&json).unwrap();

    assert!((parsed.temperature_celsius - reading.celsius).abs() < 1e-4);
    assert!((parsed.temperature_fahrenheit - reading.fahrenheit).abs() < 1e-4);
    assert_eq!(parsed.timestamp, 5);
}

#[test]
fn test_parse_message() {
    assert_eq!(parse_message(br#"{"message": "ping"}"#).unwrap(), "ping");
    assert_eq!(
        parse_message(br#"{"message": "hello", "extra": [1, 2]}"#).unwrap(),
        "hello"
    );
}

#[test]
fn test_parse_message_rejects_garbage() {
    assert!(matches!(
        parse_message(b"not json"),
        Err(InboundError::Malformed(_))
    ));
    assert!(matches!(
        parse_message(br#"{"other": 1}"#),
        Err(InboundError::NoMessage)
    ));
    assert!(matches!(
        parse_message(br#"{"message": 7}"#),
        Err(InboundError::Malformed(_))
    ));
    assert!(matches!(
        parse_message(&[b' '; MAX_INBOUND_BYTES + 1]),
        Err(InboundError::TooLarge(_))
    ));
}
