use std::net::Ipv4Addr;

use common::node::{LinkError, WirelessLink};

#[cfg(target_os = "espidf")]
pub use esp::Wifi;

#[cfg(not(target_os = "espidf"))]
pub use host::Wifi;

#[cfg(target_os = "espidf")]
mod esp {
    use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
    use esp_idf_hal::peripheral;
    use esp_idf_svc::{eventloop::EspSystemEventLoop, wifi::EspWifi};
    use esp_idf_sys::EspError;
    use heapless::String;
    use log::info;

    use super::*;

    fn wifi_err(err: EspError) -> LinkError {
        LinkError::Wifi(err.to_string())
    }

    pub struct Wifi {
        wifi: Box<EspWifi<'static>>,
    }

    impl Wifi {
        pub fn new(
            modem: impl peripheral::Peripheral<P = esp_idf_hal::modem::Modem> + 'static,
            sys_loop: EspSystemEventLoop,
        ) -> anyhow::Result<Self> {
            let wifi = Box::new(EspWifi::new(modem, sys_loop, None)?);
            Ok(Self { wifi })
        }
    }

    impl WirelessLink for Wifi {
        fn begin(&mut self, ssid: &str, passphrase: &str) -> Result<(), LinkError> {
            let mut h_ssid = String::<32>::new();
            h_ssid
                .push_str(ssid)
                .map_err(|_| LinkError::Wifi("SSID too long".into()))?;

            let mut password = String::<64>::new();
            password
                .push_str(passphrase)
                .map_err(|_| LinkError::Wifi("password too long".into()))?;

            let auth_method = if passphrase.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            };

            let client_config = ClientConfiguration {
                ssid: h_ssid,
                password,
                auth_method,
                ..Default::default()
            };
            self.wifi
                .set_configuration(&Configuration::Client(client_config))
                .map_err(wifi_err)?;

            info!("Starting Wifi...");
            self.wifi.start().map_err(wifi_err)?;
            self.wifi.connect().map_err(wifi_err)?;
            Ok(())
        }

        fn is_connected(&mut self) -> bool {
            // associated is not enough, wait for the DHCP lease too
            self.wifi.is_connected().unwrap_or(false) && self.local_ip().is_some()
        }

        fn local_ip(&self) -> Option<Ipv4Addr> {
            self.wifi
                .sta_netif()
                .get_ip_info()
                .ok()
                .map(|info| info.ip)
                .filter(|ip| !ip.is_unspecified())
        }
    }
}

#[cfg(not(target_os = "espidf"))]
mod host {
    use log::debug;

    use super::*;

    const POLLS_UNTIL_ASSOCIATED: u32 = 3;

    /// Desktop stand-in: "associates" after a few status polls and reports
    /// the loopback address.
    #[derive(Debug, Default)]
    pub struct Wifi {
        polls: u32,
        started: bool,
    }

    impl Wifi {
        pub fn new() -> anyhow::Result<Self> {
            Ok(Self::default())
        }
    }

    impl WirelessLink for Wifi {
        fn begin(&mut self, ssid: &str, _passphrase: &str) -> Result<(), LinkError> {
            debug!("simulated Wi-Fi association with '{}'", ssid);
            self.started = true;
            self.polls = 0;
            Ok(())
        }

        fn is_connected(&mut self) -> bool {
            if !self.started {
                return false;
            }
            self.polls += 1;
            self.polls > POLLS_UNTIL_ASSOCIATED
        }

        fn local_ip(&self) -> Option<Ipv4Addr> {
            self.started.then_some(Ipv4Addr::LOCALHOST)
        }
    }

}
