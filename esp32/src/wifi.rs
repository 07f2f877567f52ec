use dallas_iot_common::config::provisioning::{WIFI_PASS, WIFI_SSID};
use dallas_iot_common::{Network, NetworkError};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
use log::info;

type Wifi = BlockingWifi<EspWifi<'static>>;

/// Wi-Fi station joining the provisioned access point.
pub struct WifiLink {
    wifi: Wifi,
}

impl WifiLink {
    /// Configures the station. Nothing is started until the first association.
    pub fn new(mut wifi: Wifi) -> anyhow::Result<Self> {
        let wifi_configuration: Configuration = Configuration::Client(ClientConfiguration {
            ssid: WIFI_SSID
                .try_into()
                .map_err(|_| anyhow::anyhow!("SSID longer than 32 bytes"))?,
            bssid: None,
            auth_method: AuthMethod::WPA2Personal,
            password: WIFI_PASS
                .try_into()
                .map_err(|_| anyhow::anyhow!("password longer than 64 bytes"))?,
            channel: None,
            ..Default::default()
        });

        wifi.set_configuration(&wifi_configuration)?;

        Ok(Self { wifi })
    }

    fn try_associate(&mut self) -> Result<(), esp_idf_svc::sys::EspError> {
        if !self.wifi.is_started()? {
            self.wifi.start()?;
            info!("Wifi started");
        }

        if self.wifi.is_connected()? {
            // Associated but without an address; start over.
            self.wifi.disconnect()?;
        }

        self.wifi.connect()?;
        info!("Wifi connected");

        self.wifi.wait_netif_up()?;
        info!("Wifi netif up");

        let ip_info = self.wifi.wifi().sta_netif().get_ip_info()?;
        info!("Wifi DHCP info: {:?}", ip_info);

        Ok(())
    }
}

impl Network for WifiLink {
    fn associate(&mut self) -> Result<(), NetworkError> {
        self.try_associate()
            .map_err(|e| NetworkError::Association(e.to_string()))
    }

    fn is_up(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }
}
