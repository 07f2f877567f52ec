use anyhow::Context;
use log::{error, info};

use dallas_iot_common::config::SUBSCRIBE_TOPIC;
use dallas_iot_common::sim::{LoopbackClient, ScriptedProbe};
use dallas_iot_common::{App, Config, HostNetwork, MessagingClient, SystemClock};

mod mqtt;

/// Picks the broker client.
///
/// If the endpoint and the certificates were provisioned at build time, the node talks
/// to the real broker. Otherwise it runs against the loopback client, which gets a
/// command queued so the inbound path shows up in the log as well.
fn messaging(config: &mut Config) -> Box<dyn MessagingClient> {
    match config.validate() {
        Ok(()) => {
            info!("Using broker {}:{}", config.broker_host, config.broker_port);
            Box::new(mqtt::RumqttClient::new(config.broker_host, config.broker_port))
        }
        Err(e) => {
            info!("No broker provisioned ({}), using the loopback client", e);
            config.broker_host = "loopback";
            config.credentials = LoopbackClient::credentials();

            let mut client = LoopbackClient::new();
            client.deliver(SUBSCRIBE_TOPIC, r#"{"message": "hello from the loopback broker"}"#);
            Box::new(client)
        }
    }
}

/// A minimal main function that wires the node to the simulated probe and runs it.
fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut config = Config::default();
    let client = messaging(&mut config);
    let probe = ScriptedProbe::demo().context("Failed to load the simulated probe trace")?;

    let mut app = App::new(config, probe, client, HostNetwork, SystemClock::new());

    app.run()
        .inspect_err(|e| error!("Stopping: {}", e))
        .context("Node stopped")
}
