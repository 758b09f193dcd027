mod dht;
mod mqtt;
mod utils;
mod wifi;

use anyhow::Context;
use common::node::{ConnectionManager, Node, WirelessLink};
use common::NodeConfig;
use log::info;

const ENV_STR: &str = include_str!("../.env");

// -----------------
// pin definitions
// -----------------
// DHT_PIN (default IO4): DHT11/DHT22 data, open drain with pull-up
//
// flash command:
// cargo build --target xtensa-esp32-espidf && espflash flash target/xtensa-esp32-espidf/debug/sensor-node --monitor

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;

    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    dotenvy::from_read(ENV_STR.as_bytes()).ok();
    let config = NodeConfig::from_env().context("bad node configuration")?;

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;

    let link = wifi::Wifi::new(peripherals.modem, sys_loop)?;
    run(config, link)
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // a local .env wins over the bundled one
    dotenvy::dotenv().ok();
    dotenvy::from_read(ENV_STR.as_bytes()).ok();
    let config = NodeConfig::from_env().context("bad node configuration")?;

    let link = wifi::Wifi::new()?;
    run(config, link)
}

fn run<L: WirelessLink>(config: NodeConfig, link: L) -> anyhow::Result<()> {
    info!(
        "publishing to {}:{} '{}' every {} ms",
        config.broker_host, config.broker_port, config.topic, config.publish_interval_ms
    );

    let sensor = dht::Dht::new(config.sensor.pin, config.sensor.kind)?;
    let broker = mqtt::Broker::new(&config.broker_host, config.broker_port);
    let conn = ConnectionManager::new(link, broker, utils::random_u16);

    Node::new(&config, conn, sensor, utils::SystemClock::new()).run()?;
    Ok(())
}
