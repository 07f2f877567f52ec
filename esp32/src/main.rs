use std::time::Duration;

use dallas_iot_common::ds18b20::Ds18b20;
use dallas_iot_common::{App, Config, SystemClock};

use esp_idf_svc::hal::prelude::Peripherals;
use esp_idf_svc::log::EspLogger;
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};

use log::{error, info};

mod mqtt;
mod onewire;
mod wifi;

/// Data line of the DS18B20.
const ONE_WIRE_GPIO: i32 = 15;

fn main() -> anyhow::Result<()> {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    EspLogger::initialize_default();

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sysloop.clone(), Some(nvs))?,
        sysloop,
    )?;
    let network = wifi::WifiLink::new(wifi)?;

    // The pin is driven through the raw GPIO API, keep the HAL away from it.
    let _one_wire_pin = peripherals.pins.gpio15;
    let probe = Ds18b20::new(onewire::GpioBus::new(ONE_WIRE_GPIO)?);

    let config = Config::default();
    let client = mqtt::EspIotClient::new(config.broker_host, config.broker_port);

    let mut app = App::new(config, probe, client, network, SystemClock::new());

    if let Err(e) = app.run() {
        error!("{:?}", anyhow::Error::from(e).context("Node stopped"));
    }

    // Only terminal errors end up here. Stay parked instead of rebooting into the
    // same failure.
    info!("Parked, reflash with new provisioning material");
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
