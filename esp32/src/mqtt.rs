use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use dallas_iot_common::{
    ConnectError, ConnectionState, Credentials, InboundHandler, InboundMessage, MessagingClient,
    MessagingError,
};
use esp_idf_svc::mqtt::client::{
    Details, EspMqttClient, EspMqttEvent, EventPayload, MessageId, MqttClientConfiguration, QoS,
};
use esp_idf_svc::tls::X509;
use log::{debug, warn};

/// First ESP-TLS error code. mbedTLS handshake and certificate failures are above it.
const ESP_ERR_ESP_TLS_BASE: i32 = 0x8000;

/// Subset of the ESP-IDF MQTT events the node cares about.
enum Notice {
    Connected,
    Disconnected,
    Subscribed(MessageId),
    Received(InboundMessage),
    Error { code: i32, text: String },
}

/// PEM buffers with their terminating NUL, as ESP-TLS wants them. Leaked once per
/// boot since every session needs them for its whole lifetime.
#[derive(Clone, Copy)]
struct Certificates {
    ca: &'static [u8],
    certificate: &'static [u8],
    private_key: &'static [u8],
}

fn leak_nul_terminated(pem: &str) -> &'static [u8] {
    let mut bytes = pem.as_bytes().to_vec();
    bytes.push(0);
    Box::leak(bytes.into_boxed_slice())
}

/// Runs on the MQTT task. Only forwards, the node consumes events in `service`.
fn forward(events: &Sender<Notice>, event: EspMqttEvent<'_>) {
    let notice = match event.payload() {
        EventPayload::Connected(_) => Notice::Connected,
        EventPayload::Disconnected => Notice::Disconnected,
        EventPayload::Subscribed(id) => Notice::Subscribed(id),
        EventPayload::Received {
            topic: Some(topic),
            data,
            details: Details::Complete,
            ..
        } => Notice::Received(InboundMessage::new(topic, data)),
        EventPayload::Received { .. } => {
            warn!("Dropping fragmented MQTT message");
            return;
        }
        EventPayload::Error(e) => Notice::Error {
            code: e.code(),
            text: e.to_string(),
        },
        _ => return,
    };

    // The receiver is gone once the session was closed.
    let _ = events.send(notice);
}

fn classify(code: i32, text: String) -> ConnectError {
    if (ESP_ERR_ESP_TLS_BASE..ESP_ERR_ESP_TLS_BASE + 0x100).contains(&code) {
        ConnectError::Auth(text)
    } else {
        ConnectError::Network(text)
    }
}

/// AWS IoT session on top of the ESP-IDF MQTT client.
///
/// Every connect creates a new ESP-IDF client and every disconnect destroys it, so
/// a session ESP-IDF reopens on its own never reaches the node.
pub struct EspIotClient {
    url: String,
    certificates: Option<Certificates>,
    client: Option<EspMqttClient<'static>>,
    events: Option<Receiver<Notice>>,
    /// CONNECTED events seen so far.
    sessions: u64,
    state: ConnectionState,
    pending: VecDeque<InboundMessage>,
}

impl EspIotClient {
    const KEEP_ALIVE: Duration = Duration::from_secs(60);
    const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    const ACK_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(host: &str, port: u16) -> Self {
        Self {
            url: format!("mqtts://{}:{}", host, port),
            certificates: None,
            client: None,
            events: None,
            sessions: 0,
            state: ConnectionState::Disconnected,
            pending: VecDeque::new(),
        }
    }

    fn close(&mut self) {
        self.client = None;
        self.events = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Takes the next event off the channel and applies it to the session state.
    ///
    /// A disconnect destroys the ESP-IDF client together with the channel, so
    /// anything it queued afterwards, a reconnect included, is never seen.
    fn next_notice(&mut self, timeout: Duration) -> Option<Notice> {
        let notice = self.events.as_ref()?.recv_timeout(timeout).ok()?;

        match &notice {
            Notice::Connected => {
                self.sessions += 1;
                self.state = ConnectionState::Connected;
            }
            Notice::Disconnected => {
                warn!("MQTT session closed");
                self.close();
            }
            Notice::Received(message) => self.pending.push_back(message.clone()),
            Notice::Error { text, .. } => warn!("MQTT error: {}", text),
            Notice::Subscribed(id) => debug!("SUBACK for {}", id),
        }

        Some(notice)
    }

    fn drain(&mut self) {
        while self.next_notice(Duration::ZERO).is_some() {}
    }

    fn client_mut(&mut self) -> Result<&mut EspMqttClient<'static>, MessagingError> {
        match self.client.as_mut() {
            Some(client) if self.state == ConnectionState::Connected => Ok(client),
            _ => Err(MessagingError::NotConnected),
        }
    }
}

impl MessagingClient for EspIotClient {
    fn install_credentials(&mut self, credentials: &Credentials) -> Result<(), MessagingError> {
        credentials
            .validate()
            .map_err(|e| MessagingError::Credentials(e.to_string()))?;

        if self.certificates.is_none() {
            self.certificates = Some(Certificates {
                ca: leak_nul_terminated(credentials.ca_certificate),
                certificate: leak_nul_terminated(credentials.device_certificate),
                private_key: leak_nul_terminated(credentials.private_key),
            });
        }
        Ok(())
    }

    fn connect(&mut self, client_id: &str) -> Result<(), ConnectError> {
        self.close();

        let certificates = self
            .certificates
            .ok_or_else(|| ConnectError::Auth("no credentials installed".into()))?;

        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            keep_alive_interval: Some(Self::KEEP_ALIVE),
            network_timeout: Self::NETWORK_TIMEOUT,
            server_certificate: Some(X509::pem_until_nul(certificates.ca)),
            client_certificate: Some(X509::pem_until_nul(certificates.certificate)),
            private_key: Some(X509::pem_until_nul(certificates.private_key)),
            ..Default::default()
        };

        let (tx, rx) = mpsc::channel();
        let client = EspMqttClient::new_cb(&self.url, &conf, move |event| forward(&tx, event))
            .map_err(|e| classify(e.code(), e.to_string()))?;

        self.client = Some(client);
        self.events = Some(rx);
        self.state = ConnectionState::Connecting;

        let deadline = Instant::now() + Self::CONNECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_notice(remaining) {
                Some(Notice::Connected) => return Ok(()),
                Some(Notice::Error { code, text }) => {
                    self.close();
                    return Err(classify(code, text));
                }
                Some(Notice::Disconnected) => {
                    self.close();
                    return Err(ConnectError::Network("closed during handshake".into()));
                }
                Some(_) => {}
                None => {
                    self.close();
                    return Err(ConnectError::Timeout(
                        Self::CONNECT_TIMEOUT.as_millis() as u64
                    ));
                }
            }
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), MessagingError> {
        self.drain();

        let id = self
            .client_mut()?
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| MessagingError::Rejected(e.to_string()))?;

        let deadline = Instant::now() + Self::ACK_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_notice(remaining) {
                Some(Notice::Subscribed(acked)) if acked == id => return Ok(()),
                Some(Notice::Disconnected) => return Err(MessagingError::NotConnected),
                Some(_) => {}
                None => return Err(MessagingError::Rejected("no SUBACK".into())),
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), MessagingError> {
        self.drain();

        self.client_mut()?
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| MessagingError::Rejected(e.to_string()))?;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn session(&self) -> u64 {
        self.sessions
    }

    fn service(&mut self, handler: &mut dyn InboundHandler) {
        self.drain();

        while let Some(message) = self.pending.pop_front() {
            handler.on_message(&message);
        }
    }
}
