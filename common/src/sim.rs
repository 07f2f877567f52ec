//! Stand-ins for the hardware and the broker.
//!
//! The desktop runner uses them when no probe or broker is available, and the
//! tests drive the orchestrator through them.

use std::collections::VecDeque;

use serde::Deserialize;

use crate::config::Credentials;
use crate::messaging::{
    ConnectError, ConnectionState, InboundHandler, InboundMessage, MessagingClient,
    MessagingError,
};
use crate::reading::{celsius_to_fahrenheit, DISCONNECTED_C, DISCONNECTED_F};
use crate::sensor::{SensorError, TemperatureProbe};

/// A probe replaying a fixed list of Celsius samples, wrapping around at the end.
///
/// A sample equal to the disconnected sentinel simulates an unplugged probe.
#[derive(Deserialize, Debug, Default)]
pub struct ScriptedProbe {
    samples: Vec<f32>,
    #[serde(skip)]
    next: usize,
    #[serde(skip)]
    current: Option<f32>,
    #[serde(skip)]
    pending_fault: Option<&'static str>,
    #[serde(skip)]
    conversions: usize,
}

impl ScriptedProbe {
    pub fn new(samples: impl IntoIterator<Item = f32>) -> Self {
        Self {
            samples: samples.into_iter().collect(),
            ..Default::default()
        }
    }

    /// A day-in-the-life trace, including a short unplugged period.
    pub fn demo() -> Result<Self, serde_json::Error> {
        let json_data = std::include_str!("./simulated_probe.json");

        serde_json::from_str::<Self>(json_data)
    }

    /// Makes the next conversion fail with a bus fault.
    pub fn fail_next_conversion(&mut self, reason: &'static str) {
        self.pending_fault = Some(reason);
    }

    /// Number of successful conversions so far.
    pub fn conversions(&self) -> usize {
        self.conversions
    }
}

impl TemperatureProbe for ScriptedProbe {
    fn begin(&mut self) -> Result<usize, SensorError> {
        Ok(if self.samples.is_empty() { 0 } else { 1 })
    }

    fn request_temperatures(&mut self) -> Result<(), SensorError> {
        if let Some(reason) = self.pending_fault.take() {
            return Err(SensorError::Bus(reason));
        }

        self.current = if self.samples.is_empty() {
            None
        } else {
            let sample = self.samples[self.next % self.samples.len()];
            self.next += 1;
            Some(sample)
        };
        self.conversions += 1;
        Ok(())
    }

    fn temp_c_by_index(&mut self, index: usize) -> f32 {
        match (index, self.current) {
            (0, Some(celsius)) => celsius,
            _ => DISCONNECTED_C,
        }
    }

    fn temp_f_by_index(&mut self, index: usize) -> f32 {
        match self.temp_c_by_index(index) {
            celsius if celsius == DISCONNECTED_C => DISCONNECTED_F,
            celsius => celsius_to_fahrenheit(celsius),
        }
    }
}

/// What happened on a [`LoopbackClient`], in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Connect,
    Subscribe(String),
    Publish(String),
    Service,
}

const LOOPBACK_PEM: &str = "-----BEGIN LOOPBACK-----\nbG9vcGJhY2s=\n-----END LOOPBACK-----\n";

/// An in-memory broker session.
///
/// Publishes are recorded instead of sent, inbound messages are queued by the
/// caller, and connects, publishes and subscribes can be made to fail on demand.
/// Only the most recent [`LoopbackClient::HISTORY`] publishes and events are kept.
#[derive(Debug, Default)]
pub struct LoopbackClient {
    state: ConnectionState,
    credentials_installed: bool,
    subscriptions: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    inbound: VecDeque<InboundMessage>,
    connect_results: VecDeque<Result<(), ConnectError>>,
    publish_failures: u32,
    subscribe_failures: u32,
    drop_on_service: bool,
    session: u64,
    events: Vec<ClientEvent>,
}

/// Appends to a log holding at most [`LoopbackClient::HISTORY`] entries.
fn record<T>(log: &mut Vec<T>, entry: T) {
    if log.len() >= LoopbackClient::HISTORY {
        log.remove(0);
    }
    log.push(entry);
}

impl LoopbackClient {
    pub const HISTORY: usize = 64;

    pub fn new() -> Self {
        Self::default()
    }

    /// Placeholder TLS material. Only shaped like PEM, nothing can verify it.
    pub fn credentials() -> Credentials {
        Credentials {
            ca_certificate: LOOPBACK_PEM,
            device_certificate: LOOPBACK_PEM,
            private_key: LOOPBACK_PEM,
        }
    }

    /// Queues the outcome of upcoming connect attempts. Once the queue is empty,
    /// connects succeed.
    pub fn script_connects(&mut self, results: impl IntoIterator<Item = Result<(), ConnectError>>) {
        self.connect_results.extend(results);
    }

    /// Rejects the next `count` publishes.
    pub fn fail_publishes(&mut self, count: u32) {
        self.publish_failures = count;
    }

    /// Rejects the next `count` subscribes.
    pub fn fail_subscribes(&mut self, count: u32) {
        self.subscribe_failures = count;
    }

    /// Drops the session at the end of the next [`MessagingClient::service`] call.
    pub fn drop_on_next_service(&mut self) {
        self.drop_on_service = true;
    }

    /// Drops the session right away, as a lost transport would.
    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.subscriptions.clear();
    }

    /// Drops the session and opens a fresh one without being asked, like a
    /// transport with automatic reconnects. Subscriptions do not carry over.
    pub fn resume_session(&mut self) {
        self.disconnect();
        self.session += 1;
        self.state = ConnectionState::Connected;
    }

    /// Queues a message from the broker.
    pub fn deliver(&mut self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.inbound.push_back(InboundMessage::new(topic, payload));
    }

    pub fn published(&self) -> &[(String, Vec<u8>)] {
        &self.published
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn events(&self) -> &[ClientEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|filter| topic_matches(filter, topic))
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

impl MessagingClient for LoopbackClient {
    fn install_credentials(&mut self, credentials: &Credentials) -> Result<(), MessagingError> {
        credentials
            .validate()
            .map_err(|e| MessagingError::Credentials(e.to_string()))?;
        self.credentials_installed = true;
        Ok(())
    }

    fn connect(&mut self, _client_id: &str) -> Result<(), ConnectError> {
        record(&mut self.events, ClientEvent::Connect);
        self.disconnect();

        if !self.credentials_installed {
            return Err(ConnectError::Auth("no credentials installed".into()));
        }

        self.state = ConnectionState::Connecting;
        match self.connect_results.pop_front().unwrap_or(Ok(())) {
            Ok(()) => {
                self.session += 1;
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), MessagingError> {
        record(&mut self.events, ClientEvent::Subscribe(topic.to_string()));
        if !self.is_connected() {
            return Err(MessagingError::NotConnected);
        }
        if self.subscribe_failures > 0 {
            self.subscribe_failures -= 1;
            return Err(MessagingError::Rejected("SUBACK failure".into()));
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), MessagingError> {
        record(&mut self.events, ClientEvent::Publish(topic.to_string()));
        if !self.is_connected() {
            return Err(MessagingError::NotConnected);
        }
        if self.publish_failures > 0 {
            self.publish_failures -= 1;
            return Err(MessagingError::Rejected("broker rejected the message".into()));
        }
        record(&mut self.published, (topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn session(&self) -> u64 {
        self.session
    }

    fn service(&mut self, handler: &mut dyn InboundHandler) {
        record(&mut self.events, ClientEvent::Service);

        if self.is_connected() {
            while let Some(message) = self.inbound.pop_front() {
                if self.is_subscribed(&message.topic) {
                    handler.on_message(&message);
                }
            }
        }

        if std::mem::take(&mut self.drop_on_service) {
            self.disconnect();
        }
    }
}

#[cfg(test)]
pub(crate) use self::testing::{FlakyNetwork, ManualClock};

#[cfg(test)]
mod testing {
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    use crate::clock::Clock;
    use crate::network::{Network, NetworkError};

    /// A clock that only moves when somebody sleeps.
    #[derive(Debug, Default)]
    pub struct ManualClock {
        now_ms: Cell<u64>,
        sleeps: RefCell<Vec<Duration>>,
    }

    impl ManualClock {
        pub fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.borrow().clone()
        }

        pub fn clear_sleeps(&self) {
            self.sleeps.borrow_mut().clear();
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.now_ms.get()
        }

        fn sleep(&self, duration: Duration) {
            self.now_ms.set(self.now_ms.get() + duration.as_millis() as u64);
            self.sleeps.borrow_mut().push(duration);
        }
    }

    /// A link failing a given number of association attempts first.
    #[derive(Debug, Default)]
    pub struct FlakyNetwork {
        pub failures_left: u32,
        pub attempts: u32,
        up: bool,
    }

    impl FlakyNetwork {
        pub fn failing(failures: u32) -> Self {
            Self {
                failures_left: failures,
                ..Default::default()
            }
        }

        pub fn drop_link(&mut self) {
            self.up = false;
        }
    }

    impl Network for FlakyNetwork {
        fn associate(&mut self) -> Result<(), NetworkError> {
            self.attempts += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(NetworkError::Association("no AP in range".into()));
            }
            self.up = true;
            Ok(())
        }

        fn is_up(&self) -> bool {
            self.up
        }
    }
}

#[test]
fn test_scripted_probe_wraps_around() {
    let mut probe = ScriptedProbe::new([20.0, 21.0]);
    let mut seen = Vec::new();
    for _ in 0..3 {
        probe.request_temperatures().unwrap();
        seen.push(probe.temp_c_by_index(0));
    }
    assert_eq!(seen, vec![20.0, 21.0, 20.0]);
    assert_eq!(probe.temp_c_by_index(1), DISCONNECTED_C);
}

#[test]
fn test_demo_trace_loads() {
    let mut probe = ScriptedProbe::demo().unwrap();
    assert_eq!(probe.begin().unwrap(), 1);
    assert!(probe.samples.contains(&DISCONNECTED_C));
}

#[test]
fn test_topic_matches() {
    assert!(topic_matches("esp32/sub", "esp32/sub"));
    assert!(topic_matches("esp32/+", "esp32/sub"));
    assert!(topic_matches("esp32/#", "esp32/sub/deeper"));
    assert!(!topic_matches("esp32/sub", "esp32/pub"));
    assert!(!topic_matches("esp32/sub", "esp32/sub/deeper"));
}

#[test]
fn test_loopback_forgets_subscriptions_between_sessions() {
    let mut client = LoopbackClient::new();
    client
        .install_credentials(&crate::config::test_credentials())
        .unwrap();
    client.connect("node").unwrap();
    client.subscribe("esp32/sub").unwrap();
    assert_eq!(client.subscriptions(), ["esp32/sub".to_string()]);

    client.disconnect();
    assert!(!client.is_connected());
    assert_eq!(client.publish("esp32/pub", b"{}"), Err(MessagingError::NotConnected));

    client.connect("node").unwrap();
    assert!(client.subscriptions().is_empty());
}

#[test]
fn test_loopback_requires_credentials() {
    let mut client = LoopbackClient::new();
    assert!(client.connect("node").unwrap_err().is_auth());

    client
        .install_credentials(&LoopbackClient::credentials())
        .unwrap();
    assert_eq!(client.connect("node"), Ok(()));
}

#[test]
fn test_loopback_history_is_bounded() {
    let mut client = LoopbackClient::new();
    client
        .install_credentials(&LoopbackClient::credentials())
        .unwrap();
    client.connect("node").unwrap();

    for n in 0..1000 {
        client.publish("esp32/pub", format!("{n}").as_bytes()).unwrap();
    }

    assert_eq!(client.published().len(), LoopbackClient::HISTORY);
    assert_eq!(client.events().len(), LoopbackClient::HISTORY);
    assert_eq!(client.published().last().unwrap().1, b"999".to_vec());
    assert_eq!(client.events().last(), Some(&ClientEvent::Publish("esp32/pub".into())));
}
