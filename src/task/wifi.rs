use alloc::{boxed::Box, format, vec::Vec};
use embassy_sync::{blocking_mutex::raw::NoopRawMutex, channel};
use esp_hal::{
    peripherals::{RADIO_CLK, WIFI},
    rng::Rng,
    timer::timg,
};
use esp_wifi::wifi::{
    AccessPointConfiguration, AccessPointInfo, AuthMethod, ClientConfiguration, Configuration,
    Interfaces, ScanConfig, WifiController, WifiError,
};
use hbfc_core::{
    Event,
    config::SETUP_SSID,
    event::{ApMode, ApScan, Config},
    scan::{ScanEntry, strongest},
};
use thiserror::Error;

use crate::{
    bus::SharedBus,
    config::{SETUP_CHANNEL, SETUP_MAX_CLIENTS},
    memlog::SharedLogger,
    storage::SharedCredentials,
};

const WIFI_COMMAND_QUEUE: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WifiCommand {
    /// Scan for the stored network and join its strongest access point.
    Scan,
    /// Raise the open setup network.
    StartAp,
    StopAp,
    /// Exterior: join the interior's setup network.
    JoinSetup,
    CheckAssoc,
    /// Exterior: drop off the setup network.
    Leave,
}

pub type WifiChannel = &'static channel::Channel<NoopRawMutex, WifiCommand, WIFI_COMMAND_QUEUE>;
pub type WifiSender = channel::Sender<'static, NoopRawMutex, WifiCommand, WIFI_COMMAND_QUEUE>;
pub type WifiReceiver = channel::Receiver<'static, NoopRawMutex, WifiCommand, WIFI_COMMAND_QUEUE>;

#[derive(Debug, Error)]
pub enum WifiInitError {
    #[error("radio init failed: {0:?}")]
    Radio(esp_wifi::InitializationError),
    #[error("wifi driver init failed: {0:?}")]
    Driver(WifiError),
}

pub fn init(
    timer: timg::Timer<'static>,
    radio_clock: RADIO_CLK<'static>,
    wifi: WIFI<'static>,
    rng: Rng,
) -> Result<(WifiController<'static>, Interfaces<'static>, WifiChannel), WifiInitError> {
    let radio = esp_wifi::init(timer, rng, radio_clock).map_err(WifiInitError::Radio)?;
    let radio = Box::leak(Box::new(radio));
    let (controller, interfaces) = esp_wifi::wifi::new(radio, wifi).map_err(WifiInitError::Driver)?;
    Ok((controller, interfaces, Box::leak(Box::new(channel::Channel::new()))))
}

/// Owns the radio. Every mode change goes through here.
#[embassy_executor::task]
pub async fn wifi_service(
    mut controller: WifiController<'static>,
    commands: WifiReceiver,
    credentials: SharedCredentials,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    loop {
        match commands.receive().await {
            WifiCommand::Scan => {
                let outcome = join_stored_network(&mut controller, credentials, memlog).await;
                bus.report(Event::ApScan(outcome));
            }

            WifiCommand::StartAp => {
                let configuration = Configuration::AccessPoint(AccessPointConfiguration {
                    ssid: SETUP_SSID.into(),
                    channel: SETUP_CHANNEL,
                    auth_method: AuthMethod::None,
                    max_connections: SETUP_MAX_CLIENTS,
                    ..Default::default()
                });
                let outcome = match restart_with(&mut controller, &configuration).await {
                    Ok(()) => {
                        memlog.info(format!("wifi: setup network '{SETUP_SSID}' up"));
                        ApMode::SetupComplete
                    }
                    Err(ModeError::Config(error)) => {
                        memlog.error(format!("wifi: setup network config rejected: {error:?}"));
                        ApMode::ModeConfigFailure
                    }
                    Err(ModeError::Start(error)) => {
                        memlog.error(format!("wifi: setup network failed to start: {error:?}"));
                        ApMode::ApModeFailure
                    }
                };
                bus.report(Event::ApMode(outcome));
            }

            WifiCommand::StopAp => {
                if let Err(error) = controller.stop_async().await {
                    memlog.warn(format!("wifi: stopping setup network: {error:?}"));
                }
                bus.report(Event::ApMode(ApMode::CleanupComplete));
            }

            WifiCommand::JoinSetup => {
                let configuration = Configuration::Client(ClientConfiguration {
                    ssid: SETUP_SSID.into(),
                    auth_method: AuthMethod::None,
                    ..Default::default()
                });
                match restart_with(&mut controller, &configuration).await {
                    Ok(()) => {
                        bus.report(Event::Config(Config::AssocInit));
                        if let Err(error) = controller.connect_async().await {
                            memlog.warn(format!("wifi: setup network not joined yet: {error:?}"));
                        }
                    }
                    Err(ModeError::Config(error)) => {
                        memlog.error(format!("wifi: station config rejected: {error:?}"));
                        bus.report(Event::Config(Config::ConfigFailure));
                    }
                    Err(ModeError::Start(error)) => {
                        memlog.error(format!("wifi: station failed to start: {error:?}"));
                        bus.report(Event::Config(Config::StationModeFailure));
                    }
                }
            }

            WifiCommand::CheckAssoc => match controller.is_connected() {
                Ok(true) => bus.report(Event::Config(Config::Assoc)),
                _ => {
                    // Keep knocking until the interior's network shows up.
                    if let Err(error) = controller.connect_async().await {
                        memlog.trace(format!("wifi: setup network not joined yet: {error:?}"));
                    }
                }
            },

            WifiCommand::Leave => {
                if let Err(error) = controller.disconnect_async().await {
                    memlog.warn(format!("wifi: leaving setup network: {error:?}"));
                }
                bus.report(Event::Config(Config::CleanupComplete));
            }
        }
    }
}

enum ModeError {
    Config(WifiError),
    Start(WifiError),
}

async fn restart_with(
    controller: &mut WifiController<'static>,
    configuration: &Configuration,
) -> Result<(), ModeError> {
    if matches!(controller.is_started(), Ok(true)) {
        controller.stop_async().await.map_err(ModeError::Start)?;
    }
    controller
        .set_configuration(configuration)
        .map_err(ModeError::Config)?;
    controller.start_async().await.map_err(ModeError::Start)
}

struct Candidate(AccessPointInfo);

impl ScanEntry for Candidate {
    fn ssid(&self) -> &str {
        self.0.ssid.as_str()
    }

    fn rssi(&self) -> i8 {
        self.0.signal_strength
    }
}

async fn join_stored_network(
    controller: &mut WifiController<'static>,
    credentials: SharedCredentials,
    memlog: SharedLogger,
) -> ApScan {
    let stored = match credentials.load() {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            memlog.info("wifi: no stored credentials");
            return ApScan::NoAp;
        }
        Err(error) => {
            memlog.error(format!("wifi: reading credentials: {error}"));
            return ApScan::FlashFailure;
        }
    };
    let (Some(ssid), Some(password)) = (stored.ssid_str(), stored.password_str()) else {
        memlog.warn("wifi: stored credentials are not valid UTF-8");
        return ApScan::NoAp;
    };

    let auth_method = if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    let mut client = ClientConfiguration {
        ssid: ssid.into(),
        password: password.into(),
        auth_method,
        ..Default::default()
    };

    match restart_with(controller, &Configuration::Client(client.clone())).await {
        Ok(()) => {}
        Err(ModeError::Config(error)) => {
            memlog.error(format!("wifi: station config rejected: {error:?}"));
            return ApScan::FailedConfig;
        }
        Err(ModeError::Start(error)) => {
            memlog.error(format!("wifi: station failed to start: {error:?}"));
            return ApScan::StationModeFailure;
        }
    }

    let scan_config = ScanConfig {
        ssid: Some(ssid),
        ..Default::default()
    };
    let found = match controller.scan_with_config_async(scan_config).await {
        Ok(found) => found,
        Err(error) => {
            memlog.error(format!("wifi: scan failed: {error:?}"));
            return ApScan::FailedScan;
        }
    };
    let candidates: Vec<Candidate> = found.into_iter().map(Candidate).collect();
    let Some(Candidate(best)) = strongest(&candidates, ssid) else {
        memlog.info(format!("wifi: '{ssid}' not in range"));
        return ApScan::NoAp;
    };

    memlog.info(format!(
        "wifi: joining '{ssid}' via {:02x?} on channel {} ({} dBm)",
        best.bssid, best.channel, best.signal_strength
    ));
    client.bssid = Some(best.bssid);
    client.channel = Some(best.channel);
    if let Err(error) = controller.set_configuration(&Configuration::Client(client)) {
        memlog.error(format!("wifi: station config rejected: {error:?}"));
        return ApScan::FailedConfig;
    }
    match controller.connect_async().await {
        Ok(()) => ApScan::Connected,
        Err(error) => {
            memlog.error(format!("wifi: connect failed: {error:?}"));
            ApScan::FailedConnect
        }
    }
}
