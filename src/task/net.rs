use alloc::boxed::Box;
use embassy_net::{self as net};
use esp_hal::rng::Rng;
use esp_wifi::wifi;

use crate::config::{setup_net_config, station_net_config};

/// Sockets on the station interface: discovery, pairing, credential link,
/// two front-end connections and the DHCP client.
const STATION_SOCKETS: usize = 7;
/// Sockets on the setup interface: DHCP server, credential link and two
/// portal connections.
const SETUP_SOCKETS: usize = 5;

pub type NetRunner = net::Runner<'static, wifi::WifiDevice<'static>>;

/// The station stack takes its address over DHCP.
pub fn init_station(driver: wifi::WifiDevice<'static>, rng: &mut Rng) -> (net::Stack<'static>, NetRunner) {
    let net_resources =
        Box::leak::<'static>(Box::new(net::StackResources::<STATION_SOCKETS>::new()));
    net::new(driver, station_net_config(), net_resources, seed(rng))
}

/// The setup stack sits on the SoftAP interface with a fixed address.
pub fn init_setup(driver: wifi::WifiDevice<'static>, rng: &mut Rng) -> (net::Stack<'static>, NetRunner) {
    let net_resources = Box::leak::<'static>(Box::new(net::StackResources::<SETUP_SOCKETS>::new()));
    net::new(driver, setup_net_config(), net_resources, seed(rng))
}

fn seed(rng: &mut Rng) -> u64 {
    (rng.random() as u64) << 32 | rng.random() as u64
}

/// Drives a network stack.
#[embassy_executor::task(pool_size = 2)]
pub async fn stack_runner(mut runner: NetRunner) {
    runner.run().await
}
