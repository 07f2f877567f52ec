use std::time::Duration;

use log::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::Error;
use crate::messaging::{CommandLogger, MessagingClient};
use crate::network::Network;
use crate::payload::TelemetryPayload;
use crate::reading::Reading;
use crate::sensor::{SensorReader, TemperatureProbe};

/// Observable status of the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    Booting,
    /// Trying to open a broker session.
    Connecting { attempt: u32 },
    /// Connected and the last tick published.
    Online,
    /// The last tick could not read the probe.
    SensorFault,
    /// Retry budget exhausted; the next tick starts over.
    Offline,
    /// Gave up for good. Needs new provisioning material.
    Failed,
}

/// Counters since boot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub ticks: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub sensor_faults: u64,
    /// Broker sessions opened, including the first one.
    pub sessions: u64,
    pub inbound: u64,
}

/// What a single tick did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Published,
    PublishFailed,
    SensorFault,
    Offline,
}

/// The node: owns the probe, the broker client, the network link and the clock.
///
/// Everything runs on the caller's thread. [`App::run`] brings the node up and then
/// ticks forever: read the probe, publish the reading, service the broker session
/// and reconnect whenever the session is gone.
pub struct App<P, M, N, C> {
    config: Config,
    sensor: SensorReader<P>,
    client: M,
    network: N,
    clock: C,
    commands: CommandLogger,
    health: Health,
    stats: Stats,
    /// Session of the client the subscription was made on.
    subscribed: Option<u64>,
    /// Consecutive credential rejections, across connect sequences.
    auth_failures: u32,
}

impl<P, M, N, C> App<P, M, N, C>
where
    P: TemperatureProbe,
    M: MessagingClient,
    N: Network,
    C: Clock,
{
    pub fn new(config: Config, probe: P, client: M, network: N, clock: C) -> Self {
        Self {
            config,
            sensor: SensorReader::new(probe),
            client,
            network,
            clock,
            commands: CommandLogger::new(),
            health: Health::Booting,
            stats: Stats::default(),
            subscribed: None,
            auth_failures: 0,
        }
    }

    /// Brings the node up and ticks until a terminal error occurs.
    ///
    /// A startup connect that runs out of attempts is not terminal: the first tick
    /// simply tries again.
    pub fn run(&mut self) -> Result<(), Error> {
        match self.start() {
            Ok(()) => {}
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => warn!("Startup incomplete, retrying on the next tick: {}", e),
        }

        loop {
            self.step()?;
        }
    }

    /// Startup sequence: check provisioning, initialize the sensor bus, then
    /// connect (network, credentials, broker, subscription).
    pub fn start(&mut self) -> Result<(), Error> {
        info!("{} starting...", self.config.device_name);

        if let Err(e) = self.config.validate() {
            self.health = Health::Failed;
            error!("Provisioning incomplete: {}", e);
            return Err(e.into());
        }

        if let Err(e) = self.sensor.begin() {
            warn!("Sensor bus initialization failed: {}", e);
        }

        self.connect()
    }

    /// The full connect sequence. Subscriptions never outlive a session, so every
    /// reconnect goes through here, including the subscription.
    pub fn connect(&mut self) -> Result<(), Error> {
        self.subscribed = None;

        self.associate_network()?;

        if let Err(e) = self.client.install_credentials(&self.config.credentials) {
            self.health = Health::Failed;
            error!("Could not install device credentials: {}", e);
            return Err(Error::Credentials(e));
        }

        self.connect_broker()?;

        if let Err(e) = self.client.subscribe(self.config.subscribe_topic) {
            self.health = Health::Offline;
            warn!("Subscribing to {} failed: {}", self.config.subscribe_topic, e);
            return Err(Error::Subscribe(e));
        }
        self.subscribed = Some(self.client.session());

        self.stats.sessions += 1;
        self.health = Health::Online;
        info!("Broker connected, subscribed to {}", self.config.subscribe_topic);
        Ok(())
    }

    fn associate_network(&mut self) -> Result<(), Error> {
        if self.network.is_up() {
            return Ok(());
        }

        info!("Connecting to Wi-Fi");
        let policy = self.config.network_retry;
        let mut attempt = 1;
        loop {
            match self.network.associate() {
                Ok(()) => {
                    info!("Wi-Fi connected after {} attempt(s)", attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Wi-Fi attempt {} failed: {}", attempt, e);
                    if !policy.allows(attempt + 1) {
                        self.health = Health::Offline;
                        return Err(Error::NetworkUnavailable {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    self.clock.sleep(policy.delay_for(attempt));
                    attempt += 1;
                }
            }
        }
    }

    fn connect_broker(&mut self) -> Result<(), Error> {
        let policy = self.config.broker_retry;
        let mut attempt = 1;
        loop {
            self.health = Health::Connecting { attempt };
            info!(
                "Connecting to {}:{} as {} (attempt {})",
                self.config.broker_host, self.config.broker_port, self.config.client_id, attempt
            );

            let e = match self.client.connect(self.config.client_id) {
                Ok(()) => {
                    self.auth_failures = 0;
                    return Ok(());
                }
                Err(e) => e,
            };

            if e.is_auth() {
                self.auth_failures += 1;
                if self.auth_failures >= self.config.max_auth_failures {
                    self.health = Health::Failed;
                    error!(
                        "Broker rejected the credentials {} times in a row, giving up: {}",
                        self.auth_failures, e
                    );
                    return Err(Error::TransportAuth {
                        failures: self.auth_failures,
                    });
                }
            } else {
                self.auth_failures = 0;
            }

            warn!("Broker connect attempt {} failed: {}", attempt, e);
            if !policy.allows(attempt + 1) {
                self.health = Health::Offline;
                return Err(Error::BrokerUnreachable {
                    attempts: attempt,
                    source: e,
                });
            }
            self.clock.sleep(policy.delay_for(attempt));
            attempt += 1;
        }
    }

    /// Reconnects if needed. `Ok(false)` means the node is offline for this tick.
    ///
    /// A session the transport reopened on its own lacks the subscription and is
    /// treated like a lost one.
    fn ensure_session(&mut self) -> Result<bool, Error> {
        if self.client.is_connected() && self.subscribed == Some(self.client.session()) {
            return Ok(true);
        }

        warn!("Lost connection to the broker. Attempting to reconnect...");
        match self.connect() {
            Ok(()) => Ok(true),
            Err(e) if e.is_terminal() => Err(e),
            Err(e) => {
                warn!("Reconnect failed: {}", e);
                Ok(false)
            }
        }
    }

    /// One iteration of the loop, without the pause that follows it.
    ///
    /// Only terminal errors are returned; everything else is logged and reported
    /// through the outcome.
    pub fn tick(&mut self) -> Result<TickOutcome, Error> {
        self.stats.ticks += 1;

        if !self.ensure_session()? {
            return Ok(TickOutcome::Offline);
        }

        let reading = match self.sensor.request_reading(self.clock.now_ms()) {
            Ok(reading) => reading,
            Err(e) => {
                error!("Could not read temperature data from Dallas sensor: {}", e);
                self.stats.sensor_faults += 1;
                self.health = Health::SensorFault;
                return Ok(TickOutcome::SensorFault);
            }
        };
        info!(
            "Temperature: {:.2}°C / {:.2}°F",
            reading.celsius, reading.fahrenheit
        );

        let outcome = match self.publish(&reading) {
            Ok(()) => {
                self.stats.published += 1;
                self.health = Health::Online;
                TickOutcome::Published
            }
            Err(e) => {
                warn!("Failed to publish message: {}", e);
                self.stats.publish_failures += 1;
                TickOutcome::PublishFailed
            }
        };

        // Keep-alives and inbound messages
        self.client.service(&mut self.commands);
        self.stats.inbound = self.commands.received();

        if !self.ensure_session()? {
            return Ok(TickOutcome::Offline);
        }

        Ok(outcome)
    }

    /// A tick followed by its pause. A tick that could not read the probe waits
    /// the shorter sensor retry delay.
    pub fn step(&mut self) -> Result<TickOutcome, Error> {
        let outcome = self.tick()?;
        self.clock.sleep(self.pause_after(outcome));
        Ok(outcome)
    }

    fn pause_after(&self, outcome: TickOutcome) -> Duration {
        match outcome {
            TickOutcome::SensorFault => self.config.sensor_retry_delay,
            _ => self.config.tick_interval,
        }
    }

    fn publish(&mut self, reading: &Reading) -> Result<(), Error> {
        let json = TelemetryPayload::new(self.config.device_name, reading).to_json()?;

        self.client
            .publish(self.config.publish_topic, json.as_bytes())
            .map_err(Error::Publish)?;

        info!("Message published successfully!");
        debug!("{}", json);
        Ok(())
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn commands(&self) -> &CommandLogger {
        &self.commands
    }

    pub fn probe(&self) -> &P {
        self.sensor.probe()
    }

    pub fn client(&self) -> &M {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut M {
        &mut self.client
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::test_credentials;
    use crate::messaging::ConnectError;
    use crate::payload::TelemetryPayload;
    use crate::reading::DISCONNECTED_C;
    use crate::retry::RetryPolicy;
    use crate::sim::{ClientEvent, FlakyNetwork, LoopbackClient, ManualClock, ScriptedProbe};

    type TestApp = App<ScriptedProbe, LoopbackClient, FlakyNetwork, ManualClock>;

    const TICK: Duration = Duration::from_secs(5);
    const SENSOR_RETRY: Duration = Duration::from_secs(1);

    fn test_config() -> Config {
        Config {
            client_id: "test-node",
            broker_host: "broker.test",
            tick_interval: TICK,
            sensor_retry_delay: SENSOR_RETRY,
            network_retry: RetryPolicy::exponential(
                Duration::from_millis(500),
                Duration::from_secs(4),
                Some(4),
            ),
            broker_retry: RetryPolicy::fixed(Duration::from_millis(100), Some(5)),
            max_auth_failures: 3,
            credentials: test_credentials(),
            ..Config::default()
        }
    }

    fn app_with(samples: impl IntoIterator<Item = f32>) -> TestApp {
        let _ = env_logger::builder().is_test(true).try_init();
        App::new(
            test_config(),
            ScriptedProbe::new(samples),
            LoopbackClient::new(),
            FlakyNetwork::default(),
            ManualClock::default(),
        )
    }

    fn started(samples: impl IntoIterator<Item = f32>) -> TestApp {
        let mut app = app_with(samples);
        app.start().unwrap();
        app.client_mut().clear_events();
        app.clock().clear_sleeps();
        app
    }

    fn payloads(app: &TestApp) -> Vec<TelemetryPayload> {
        app.client()
            .published()
            .iter()
            .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
            .collect()
    }

    #[test]
    fn test_start_connects_and_subscribes() {
        let mut app = app_with([20.0]);
        app.start().unwrap();

        assert_eq!(
            app.client().events(),
            [ClientEvent::Connect, ClientEvent::Subscribe("esp32/sub".into())]
        );
        assert_eq!(app.client().subscriptions(), ["esp32/sub".to_string()]);
        assert_eq!(app.health(), Health::Online);
        assert_eq!(app.stats().sessions, 1);
    }

    #[test]
    fn test_disconnected_sensor_skips_publish_but_waits() {
        let mut app = started([DISCONNECTED_C]);

        assert_eq!(app.step().unwrap(), TickOutcome::SensorFault);

        assert!(app.client().published().is_empty());
        assert!(!app.client().events().contains(&ClientEvent::Publish("esp32/pub".into())));
        assert_eq!(app.clock().sleeps(), vec![SENSOR_RETRY]);
        assert_eq!(app.health(), Health::SensorFault);
        assert_eq!(app.stats().sensor_faults, 1);
    }

    #[test]
    fn test_bus_fault_is_not_fatal() {
        let mut probe = ScriptedProbe::new([19.5]);
        probe.fail_next_conversion("no presence pulse");
        let mut app = App::new(
            test_config(),
            probe,
            LoopbackClient::new(),
            FlakyNetwork::default(),
            ManualClock::default(),
        );
        app.start().unwrap();

        assert_eq!(app.step().unwrap(), TickOutcome::SensorFault);
        assert_eq!(app.step().unwrap(), TickOutcome::Published);
        assert_eq!(app.health(), Health::Online);
    }

    #[test]
    fn test_readings_round_trip_with_monotonic_timestamps() {
        let samples = [21.0625, -3.5, 0.0, 85.0];
        let mut app = started(samples);

        for _ in 0..samples.len() {
            assert_eq!(app.step().unwrap(), TickOutcome::Published);
        }

        let payloads = payloads(&app);
        assert_eq!(payloads.len(), samples.len());
        for (payload, celsius) in payloads.iter().zip(samples) {
            assert_eq!(payload.device, "ESP32_Dallas");
            assert!((payload.temperature_celsius - celsius).abs() < 1e-4);
            assert!((payload.temperature_fahrenheit - (celsius * 1.8 + 32.0)).abs() < 1e-3);
        }
        assert!(payloads.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(app
            .client()
            .published()
            .iter()
            .all(|(topic, _)| topic == "esp32/pub"));
        assert_eq!(app.clock().sleeps(), vec![TICK; samples.len()]);
    }

    #[test]
    fn test_reconnects_before_publishing_when_disconnected() {
        let mut app = started([20.0]);
        app.client_mut().disconnect();

        assert_eq!(app.step().unwrap(), TickOutcome::Published);

        assert_eq!(
            app.client().events(),
            [
                ClientEvent::Connect,
                ClientEvent::Subscribe("esp32/sub".into()),
                ClientEvent::Publish("esp32/pub".into()),
                ClientEvent::Service,
            ]
        );
        assert_eq!(app.stats().sessions, 2);
    }

    #[test]
    fn test_session_dropped_during_service_is_restored_in_the_same_tick() {
        let mut app = started([20.0]);
        app.client_mut().drop_on_next_service();

        assert_eq!(app.tick().unwrap(), TickOutcome::Published);

        assert!(app.client().is_connected());
        assert_eq!(app.client().subscriptions(), ["esp32/sub".to_string()]);
        assert_eq!(
            app.client().events(),
            [
                ClientEvent::Publish("esp32/pub".into()),
                ClientEvent::Service,
                ClientEvent::Connect,
                ClientEvent::Subscribe("esp32/sub".into()),
            ]
        );
    }

    #[test]
    fn test_session_reopened_by_the_transport_is_resubscribed() {
        let mut app = started([20.0]);
        app.client_mut().resume_session();
        assert!(app.client().is_connected());
        assert!(app.client().subscriptions().is_empty());

        assert_eq!(app.step().unwrap(), TickOutcome::Published);

        assert_eq!(
            app.client().events(),
            [
                ClientEvent::Connect,
                ClientEvent::Subscribe("esp32/sub".into()),
                ClientEvent::Publish("esp32/pub".into()),
                ClientEvent::Service,
            ]
        );
        assert_eq!(app.client().subscriptions(), ["esp32/sub".to_string()]);
        assert_eq!(app.stats().sessions, 2);
    }

    #[test]
    fn test_session_reopened_during_a_sensor_fault_is_resubscribed() {
        let mut app = started([DISCONNECTED_C, 20.0]);

        assert_eq!(app.step().unwrap(), TickOutcome::SensorFault);
        app.client_mut().resume_session();
        app.client_mut().deliver("esp32/sub", r#"{"message": "ping"}"#);

        assert_eq!(app.step().unwrap(), TickOutcome::Published);
        assert_eq!(app.client().subscriptions(), ["esp32/sub".to_string()]);
        assert_eq!(app.commands().last_message(), Some("ping"));
    }

    #[test]
    fn test_publish_failures_do_not_stop_the_loop() {
        let mut app = started([20.0, 20.5, 21.0, 21.5]);
        app.client_mut().fail_publishes(3);

        for _ in 0..3 {
            assert_eq!(app.step().unwrap(), TickOutcome::PublishFailed);
        }
        assert_eq!(app.step().unwrap(), TickOutcome::Published);

        // Every tick took a fresh reading; the published one is the fourth.
        assert_eq!(app.probe().conversions(), 4);
        assert_eq!(payloads(&app)[0].temperature_celsius, 21.5);
        assert_eq!(app.stats().publish_failures, 3);
        assert_eq!(app.stats().published, 1);
        assert_eq!(app.clock().sleeps(), vec![TICK; 4]);
    }

    #[test]
    fn test_inbound_message_is_logged_during_service() {
        let mut app = started([20.0]);
        app.client_mut().deliver("esp32/sub", r#"{"message": "ping"}"#);

        app.step().unwrap();

        assert_eq!(app.commands().last_message(), Some("ping"));
        assert_eq!(app.stats().inbound, 1);
    }

    #[test]
    fn test_malformed_inbound_message_is_discarded() {
        let mut app = started([20.0, 20.0]);
        app.client_mut().deliver("esp32/sub", "not json");

        assert_eq!(app.step().unwrap(), TickOutcome::Published);
        assert_eq!(app.step().unwrap(), TickOutcome::Published);

        assert_eq!(app.commands().received(), 1);
        assert_eq!(app.commands().last_message(), None);
    }

    #[test]
    fn test_network_association_backs_off() {
        let mut app = app_with([20.0]);
        app.network_mut().failures_left = 3;

        app.start().unwrap();

        assert_eq!(app.network().attempts, 4);
        assert_eq!(
            app.clock().sleeps(),
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
            ]
        );
    }

    #[test]
    fn test_network_budget_exhaustion_is_recoverable() {
        let mut app = App::new(
            test_config(),
            ScriptedProbe::new([20.0]),
            LoopbackClient::new(),
            FlakyNetwork::failing(10),
            ManualClock::default(),
        );

        let err = app.start().unwrap_err();
        assert!(matches!(err, Error::NetworkUnavailable { attempts: 4, .. }));
        assert!(!err.is_terminal());
        assert_eq!(app.health(), Health::Offline);

        // Still down for the next four attempts.
        assert_eq!(app.step().unwrap(), TickOutcome::Offline);
        assert!(app.client().published().is_empty());

        // The link is back on the following tick.
        assert_eq!(app.step().unwrap(), TickOutcome::Published);
        assert_eq!(app.health(), Health::Online);
    }

    #[test]
    fn test_wifi_drop_is_reassociated_on_reconnect() {
        let mut app = started([20.0]);
        app.network_mut().drop_link();
        app.client_mut().disconnect();
        let attempts = app.network().attempts;

        assert_eq!(app.step().unwrap(), TickOutcome::Published);
        assert_eq!(app.network().attempts, attempts + 1);
    }

    #[test]
    fn test_transient_broker_failures_are_retried() {
        let mut app = app_with([20.0]);
        app.client_mut().script_connects([
            Err(ConnectError::Network("connection reset".into())),
            Err(ConnectError::Timeout(5000)),
        ]);

        app.start().unwrap();

        assert_eq!(
            app.client()
                .events()
                .iter()
                .filter(|event| **event == ClientEvent::Connect)
                .count(),
            3
        );
        assert_eq!(app.clock().sleeps(), vec![Duration::from_millis(100); 2]);
    }

    #[test]
    fn test_broker_budget_exhaustion_goes_offline() {
        let mut app = app_with([20.0]);
        app.client_mut()
            .script_connects((0..5).map(|_| Err(ConnectError::Network("refused".into()))));

        let err = app.start().unwrap_err();
        assert!(matches!(err, Error::BrokerUnreachable { attempts: 5, .. }));
        assert!(!err.is_terminal());

        assert_eq!(app.step().unwrap(), TickOutcome::Published);
    }

    #[test]
    fn test_repeated_auth_failures_are_terminal() {
        let mut app = app_with([20.0]);
        app.client_mut().script_connects(
            (0..3).map(|_| Err(ConnectError::Auth("certificate unknown".into()))),
        );

        let err = app.run().unwrap_err();

        assert!(matches!(err, Error::TransportAuth { failures: 3 }));
        assert!(err.is_terminal());
        assert_eq!(app.health(), Health::Failed);
        assert!(app.client().published().is_empty());
    }

    #[test]
    fn test_auth_failure_streak_resets_on_other_errors() {
        let mut app = app_with([20.0]);
        app.client_mut().script_connects([
            Err(ConnectError::Auth("handshake failed".into())),
            Err(ConnectError::Auth("handshake failed".into())),
            Err(ConnectError::Network("timed out".into())),
            Err(ConnectError::Auth("handshake failed".into())),
        ]);

        app.start().unwrap();
        assert_eq!(app.health(), Health::Online);
    }

    #[test]
    fn test_missing_provisioning_is_terminal() {
        let mut config = test_config();
        config.broker_host = "";
        let mut app = App::new(
            config,
            ScriptedProbe::new([20.0]),
            LoopbackClient::new(),
            FlakyNetwork::default(),
            ManualClock::default(),
        );

        let err = app.run().unwrap_err();

        assert!(matches!(err, Error::Provisioning(_)));
        assert!(app.client().events().is_empty());
        assert_eq!(app.health(), Health::Failed);
    }

    #[test]
    fn test_failed_subscription_is_retried_next_tick() {
        let mut app = app_with([20.0]);
        app.client_mut().fail_subscribes(1);

        assert!(matches!(app.start(), Err(Error::Subscribe(_))));
        assert!(app.client().is_connected());

        assert_eq!(app.step().unwrap(), TickOutcome::Published);
        assert_eq!(app.client().subscriptions(), ["esp32/sub".to_string()]);
        assert_eq!(app.stats().sessions, 1);
    }
}
