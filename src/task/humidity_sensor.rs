use alloc::{boxed::Box, format};
use embassy_sync::{blocking_mutex::raw::NoopRawMutex, channel, watch};
use embassy_time::Timer;
use esp_hal::{Blocking, i2c::master::I2c};
use hbfc_core::{
    Event,
    event::Humidity,
    humidity::{DEFAULT_THRESHOLD, Hih8121, MEASUREMENT_TIME, Reading, SensorStatus, fan_demand},
};

use crate::{
    bus::SharedBus,
    memlog::SharedLogger,
    task::{fan::FAN, peer::ExteriorHumidityDynReceiver},
};

const SENSOR_COMMAND_QUEUE: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorCommand {
    Measure,
}

pub type SensorChannel = &'static channel::Channel<NoopRawMutex, SensorCommand, SENSOR_COMMAND_QUEUE>;
pub type SensorSender = channel::Sender<'static, NoopRawMutex, SensorCommand, SENSOR_COMMAND_QUEUE>;
pub type SensorReceiver =
    channel::Receiver<'static, NoopRawMutex, SensorCommand, SENSOR_COMMAND_QUEUE>;

pub type HumidityWatch<const W: usize> = &'static watch::Watch<NoopRawMutex, Reading, W>;
pub type HumidityDynSender = watch::DynSender<'static, Reading>;
pub type HumidityDynReceiver = watch::DynReceiver<'static, Reading>;

/// Interior humidity above which the fan may run, in percent.
pub type ThresholdWatch<const W: usize> = &'static watch::Watch<NoopRawMutex, f32, W>;
pub type ThresholdDynSender = watch::DynSender<'static, f32>;
pub type ThresholdDynReceiver = watch::DynReceiver<'static, f32>;

pub fn init<const WATCHERS: usize>() -> (SensorChannel, HumidityWatch<WATCHERS>) {
    (
        Box::leak(Box::new(channel::Channel::new())),
        Box::leak(Box::new(watch::Watch::new())),
    )
}

pub fn init_threshold<const WATCHERS: usize>() -> ThresholdWatch<WATCHERS> {
    Box::leak(Box::new(watch::Watch::new_with(DEFAULT_THRESHOLD)))
}

/// What the interior weighs its own reading against.
pub struct FanInputs {
    pub exterior: ExteriorHumidityDynReceiver,
    pub threshold: ThresholdDynReceiver,
}

/// Takes a measurement on every humidity tick. On the interior, also decides
/// whether the fan runs.
#[embassy_executor::task]
pub async fn humidity_sensor(
    i2c: I2c<'static, Blocking>,
    commands: SensorReceiver,
    humidity_sender: HumidityDynSender,
    mut fan_inputs: Option<FanInputs>,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    let mut sensor = Hih8121::new(i2c);

    loop {
        let SensorCommand::Measure = commands.receive().await;

        // Try block to catch I2C and status errors.
        let reading = async {
            sensor.request_measurement()?;
            Timer::after(MEASUREMENT_TIME).await;
            sensor.fetch()
        }
        .await;

        match reading {
            Ok(reading) => {
                if reading.status == SensorStatus::Stale {
                    memlog.trace("humidity: stale reading");
                }
                humidity_sender.send(reading);
                if let Some(inputs) = fan_inputs.as_mut() {
                    let threshold = inputs.threshold.try_get().unwrap_or(DEFAULT_THRESHOLD);
                    let demand = fan_demand(reading.humidity, inputs.exterior.try_get(), threshold);
                    if demand != FAN.drive() {
                        memlog.info(format!(
                            "humidity: {:.1}%RH, fan {}",
                            reading.humidity,
                            if demand { "on" } else { "off" }
                        ));
                        FAN.set_drive(demand);
                    }
                }
                bus.report(Event::Humidity(Humidity::ReadDone));
            }
            Err(error) => {
                memlog.warn(format!("humidity: {error}"));
                bus.report(Event::Humidity(Humidity::ReadFailure));
            }
        }
    }
}
