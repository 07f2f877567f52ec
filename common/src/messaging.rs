//! Publish/subscribe client contract and inbound message handling.

use crate::config::Credentials;
use crate::payload::{parse_message, InboundError};

/// Session status of a [`MessagingClient`].
///
/// A session only ever moves `Disconnected -> Connecting -> Connected -> Disconnected`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// A message received on a subscribed topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Why a connect attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The broker could not be reached or the link dropped mid-handshake.
    #[error("network: {0}")]
    Network(String),

    /// TLS validation failed or the broker refused the device credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("no CONNACK within {0} ms")]
    Timeout(u64),
}

impl ConnectError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ConnectError::Auth(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessagingError {
    #[error("not connected")]
    NotConnected,

    #[error("rejected by the client: {0}")]
    Rejected(String),

    #[error("credentials: {0}")]
    Credentials(String),
}

/// Receives inbound messages.
///
/// Handlers run inline within [`MessagingClient::service`] and must not block.
pub trait InboundHandler {
    fn on_message(&mut self, message: &InboundMessage);
}

/// Publish/subscribe client on top of a secure transport.
///
/// Everything happens on the caller's thread: inbound messages are only delivered
/// while [`MessagingClient::service`] runs.
pub trait MessagingClient {
    /// Hands the TLS material to the underlying transport. Must be called before
    /// [`MessagingClient::connect`].
    fn install_credentials(&mut self, credentials: &Credentials) -> Result<(), MessagingError>;

    /// Opens a new session. Subscriptions from earlier sessions are gone.
    fn connect(&mut self, client_id: &str) -> Result<(), ConnectError>;

    /// Registers interest in `topic`. Only effective while connected.
    fn subscribe(&mut self, topic: &str) -> Result<(), MessagingError>;

    /// Hands a message to the transport. Success means the transport accepted it,
    /// not that anybody received it.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), MessagingError>;

    fn state(&self) -> ConnectionState;

    /// Number of sessions the transport has opened so far, counting sessions it
    /// reopened on its own. A change means the subscriptions are gone.
    fn session(&self) -> u64;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Processes keep-alives and delivers pending inbound messages to `handler`.
    fn service(&mut self, handler: &mut dyn InboundHandler);
}

impl<M: MessagingClient + ?Sized> MessagingClient for Box<M> {
    fn install_credentials(&mut self, credentials: &Credentials) -> Result<(), MessagingError> {
        (**self).install_credentials(credentials)
    }

    fn connect(&mut self, client_id: &str) -> Result<(), ConnectError> {
        (**self).connect(client_id)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), MessagingError> {
        (**self).subscribe(topic)
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), MessagingError> {
        (**self).publish(topic, payload)
    }

    fn state(&self) -> ConnectionState {
        (**self).state()
    }

    fn session(&self) -> u64 {
        (**self).session()
    }

    fn service(&mut self, handler: &mut dyn InboundHandler) {
        (**self).service(handler)
    }
}

/// Logs inbound commands. Nothing is executed.
#[derive(Debug, Default)]
pub struct CommandLogger {
    received: u64,
    last_message: Option<String>,
}

impl CommandLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages seen, parsable or not.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// The last `message` string extracted from a well-formed payload.
    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }
}

impl InboundHandler for CommandLogger {
    fn on_message(&mut self, message: &InboundMessage) {
        self.received += 1;
        log::info!("Incoming message from topic: {}", message.topic);

        match parse_message(&message.payload) {
            Ok(text) => {
                log::info!("Parsed message: {}", text);
                self.last_message = Some(text);
            }
            Err(InboundError::TooLarge(len)) => {
                log::warn!("Dropping {} byte message on {}", len, message.topic);
            }
            Err(e) => {
                log::info!("Message: {}", String::from_utf8_lossy(&message.payload));
                log::debug!("Not a command document: {}", e);
            }
        }
    }
}

#[test]
fn test_command_logger_extracts_message() {
    let mut logger = CommandLogger::new();
    logger.on_message(&InboundMessage::new("esp32/sub", r#"{"message": "ping"}"#));

    assert_eq!(logger.received(), 1);
    assert_eq!(logger.last_message(), Some("ping"));
}

#[test]
fn test_command_logger_discards_malformed_payloads() {
    let mut logger = CommandLogger::new();
    logger.on_message(&InboundMessage::new("esp32/sub", "not json"));
    logger.on_message(&InboundMessage::new("esp32/sub", r#""not json""#));
    logger.on_message(&InboundMessage::new("esp32/sub", vec![0xFF, 0xFE, 0x00]));
    logger.on_message(&InboundMessage::new("esp32/sub", r#"{"status": "ok"}"#));

    assert_eq!(logger.received(), 4);
    assert_eq!(logger.last_message(), None);
}

#[test]
fn test_command_logger_keeps_last_good_message() {
    let mut logger = CommandLogger::new();
    logger.on_message(&InboundMessage::new("esp32/sub", r#"{"message": "first"}"#));
    logger.on_message(&InboundMessage::new("esp32/sub", "garbage"));

    assert_eq!(logger.last_message(), Some("first"));
}
