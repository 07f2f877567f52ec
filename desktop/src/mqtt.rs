use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dallas_iot_common::{
    ConnectError, ConnectionState, Credentials, InboundHandler, InboundMessage, MessagingClient,
    MessagingError,
};
use log::{debug, warn};
use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet,
    QoS, RecvTimeoutError, SubscribeReasonCode, TlsConfiguration, Transport,
};

/// PEM material as handed to rustls.
struct Pem {
    ca: Vec<u8>,
    certificate: Vec<u8>,
    private_key: Vec<u8>,
}

/// Blocking MQTT client on top of rumqttc.
///
/// The connection is only driven while one of the trait methods runs. Publishes that
/// arrive while waiting for an acknowledgement are kept until the next `service`.
pub struct RumqttClient {
    host: String,
    port: u16,
    pem: Option<Pem>,
    session: Option<(Client, Connection)>,
    /// CONNACKs seen so far.
    sessions: u64,
    state: ConnectionState,
    pending: VecDeque<InboundMessage>,
}

impl RumqttClient {
    const KEEP_ALIVE: Duration = Duration::from_secs(60);
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    const ACK_TIMEOUT: Duration = Duration::from_secs(5);
    const SERVICE_WINDOW: Duration = Duration::from_millis(50);

    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            pem: None,
            session: None,
            sessions: 0,
            state: ConnectionState::Disconnected,
            pending: VecDeque::new(),
        }
    }

    fn close(&mut self) {
        self.session = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Polls the connection until `done` accepts an event or `timeout` passes.
    /// Returns whether `done` fired.
    fn drive<F>(&mut self, timeout: Duration, mut done: F) -> Result<bool, ConnectionError>
    where
        F: FnMut(&Event) -> bool,
    {
        let Some((_, connection)) = self.session.as_mut() else {
            return Ok(false);
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }

            match connection.recv_timeout(remaining) {
                Ok(Ok(event)) => {
                    debug!("{:?}", event);
                    if let Event::Incoming(Packet::ConnAck(_)) = &event {
                        self.sessions += 1;
                    }
                    if let Event::Incoming(Packet::Publish(publish)) = &event {
                        self.pending.push_back(InboundMessage::new(
                            publish.topic.clone(),
                            publish.payload.to_vec(),
                        ));
                    }
                    if done(&event) {
                        return Ok(true);
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => return Err(ConnectionError::RequestsDone),
            }
        }
    }

    fn lost(&mut self, e: ConnectionError) -> MessagingError {
        warn!("Connection to {} lost: {}", self.host, e);
        self.close();
        MessagingError::NotConnected
    }

    fn client(&self) -> Result<&Client, MessagingError> {
        match &self.session {
            Some((client, _)) if self.state == ConnectionState::Connected => Ok(client),
            _ => Err(MessagingError::NotConnected),
        }
    }
}

/// Credential problems are reported by rustls or by the broker's CONNACK.
fn classify(e: &ConnectionError) -> ConnectError {
    match e {
        ConnectionError::Tls(e) => ConnectError::Auth(e.to_string()),
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword),
        ) => ConnectError::Auth(format!("{:?}", code)),
        other => ConnectError::Network(other.to_string()),
    }
}

impl MessagingClient for RumqttClient {
    fn install_credentials(&mut self, credentials: &Credentials) -> Result<(), MessagingError> {
        credentials
            .validate()
            .map_err(|e| MessagingError::Credentials(e.to_string()))?;

        self.pem = Some(Pem {
            ca: credentials.ca_certificate.as_bytes().to_vec(),
            certificate: credentials.device_certificate.as_bytes().to_vec(),
            private_key: credentials.private_key.as_bytes().to_vec(),
        });
        Ok(())
    }

    fn connect(&mut self, client_id: &str) -> Result<(), ConnectError> {
        self.close();

        let Some(pem) = &self.pem else {
            return Err(ConnectError::Auth("no credentials installed".into()));
        };

        let mut options = MqttOptions::new(client_id, self.host.as_str(), self.port);
        options
            .set_keep_alive(Self::KEEP_ALIVE)
            .set_clean_session(true)
            .set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: pem.ca.clone(),
                alpn: None,
                client_auth: Some((pem.certificate.clone(), pem.private_key.clone())),
            }));

        self.session = Some(Client::new(options, 16));
        self.state = ConnectionState::Connecting;

        let connack = |event: &Event| matches!(event, Event::Incoming(Packet::ConnAck(_)));
        match self.drive(Self::CONNECT_TIMEOUT, connack) {
            Ok(true) => {
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Ok(false) => {
                self.close();
                Err(ConnectError::Timeout(Self::CONNECT_TIMEOUT.as_millis() as u64))
            }
            Err(e) => {
                self.close();
                Err(classify(&e))
            }
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), MessagingError> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| MessagingError::Rejected(e.to_string()))?;

        let mut granted = true;
        let suback = |event: &Event| match event {
            Event::Incoming(Packet::SubAck(ack)) => {
                granted = !ack.return_codes.contains(&SubscribeReasonCode::Failure);
                true
            }
            _ => false,
        };

        match self.drive(Self::ACK_TIMEOUT, suback) {
            Ok(true) if granted => Ok(()),
            Ok(true) => Err(MessagingError::Rejected(format!("subscription to {} refused", topic))),
            Ok(false) => Err(MessagingError::Rejected("no SUBACK".into())),
            Err(e) => Err(self.lost(e)),
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), MessagingError> {
        self.client()?
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| MessagingError::Rejected(e.to_string()))?;

        let sent = |event: &Event| matches!(event, Event::Outgoing(Outgoing::Publish(_)));
        match self.drive(Self::ACK_TIMEOUT, sent) {
            Ok(true) => Ok(()),
            Ok(false) => Err(MessagingError::Rejected("publish not written in time".into())),
            Err(e) => Err(self.lost(e)),
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn session(&self) -> u64 {
        self.sessions
    }

    fn service(&mut self, handler: &mut dyn InboundHandler) {
        if self.state == ConnectionState::Connected {
            if let Err(e) = self.drive(Self::SERVICE_WINDOW, |_| false) {
                self.lost(e);
            }
        }

        while let Some(message) = self.pending.pop_front() {
            handler.on_message(&message);
        }
    }
}

#[test]
fn test_credential_rejections_are_auth_errors() {
    let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
    assert!(classify(&refused).is_auth());

    let unavailable = ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable);
    assert!(!classify(&unavailable).is_auth());

    let io = ConnectionError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
    assert!(!classify(&io).is_auth());
}

#[test]
fn test_publish_requires_a_session() {
    let mut client = RumqttClient::new("broker.test", 8883);
    assert_eq!(
        client.publish("esp32/pub", b"{}"),
        Err(MessagingError::NotConnected)
    );
    assert!(client.connect("node").unwrap_err().is_auth());
}
