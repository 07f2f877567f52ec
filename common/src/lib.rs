//! Platform independent part of the Dallas temperature node.
//!
//! The node reads a DS18B20 probe, publishes every reading as JSON to an MQTT broker
//! over mutually authenticated TLS and logs commands arriving on its subscription.
//! Everything touching hardware or the network sits behind a trait, implemented by
//! the ESP32 firmware, the desktop runner and the simulations in [`sim`].

pub mod app;
pub mod clock;
pub mod config;
pub mod ds18b20;
pub mod error;
pub mod messaging;
pub mod network;
pub mod onewire;
pub mod payload;
pub mod reading;
pub mod retry;
pub mod sensor;
pub mod sim;

pub use app::{App, Health, Stats, TickOutcome};
pub use clock::{Clock, SystemClock};
pub use config::{Config, Credentials};
pub use error::{Error, ProvisioningError};
pub use messaging::{
    CommandLogger, ConnectError, ConnectionState, InboundHandler, InboundMessage,
    MessagingClient, MessagingError,
};
pub use network::{HostNetwork, Network, NetworkError};
pub use reading::Reading;
pub use sensor::{SensorError, SensorReader, TemperatureProbe};
