#![no_std]
#![no_main]
#![feature(impl_trait_in_assoc_type)]

use alloc::boxed::Box;
use embassy_executor::{SpawnError, Spawner};
use esp_backtrace as _;
use esp_hal::clock::CpuClock;
use esp_hal::gpio;
use esp_hal::i2c::master as i2c;
use esp_hal::interrupt::{Priority as InterruptPriority, software::SoftwareInterruptControl};
use esp_hal::time::Rate;
use esp_hal::timer::systimer::SystemTimer;
use esp_hal::timer::timg::TimerGroup;
use esp_hal_embassy::InterruptExecutor;
use hbfc_core::Role;

use crate::config::{MEMLOG_CAPACITY, NODE_NAME, ROLE};
use crate::memlog::Level;
use crate::task::{
    config_link, control, discovery, fan, httpd, humidity_sensor, peer, serial_console, timers,
};

extern crate alloc;

mod bus;
mod config;
mod memlog;
mod storage;
mod task;

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) {
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::_160MHz);
    let peripherals = esp_hal::init(config);
    esp_alloc::heap_allocator!(size: 96 * 1024);
    let timer0 = SystemTimer::new(peripherals.SYSTIMER);
    esp_hal_embassy::init(timer0.alarm0);
    let mut rng = esp_hal::rng::Rng::new(peripherals.RNG);
    let timer1 = TimerGroup::new(peripherals.TIMG0);

    //
    // M5Stamp-S3 pinout
    //
    // G13 and G15 are the I2C bus to the HIH8121 humidity sensor.
    let pin_i2c_sda = peripherals.GPIO13;
    let pin_i2c_scl = peripherals.GPIO15;
    // G5 reads the mains zero-crossing detector, pulled low at each crossing.
    let pin_zero_cross = peripherals.GPIO5;
    // G7 reads the fan tachometer, open-collector.
    let pin_tachometer = peripherals.GPIO7;
    // G9 drives the triac gate through an optocoupler.
    let pin_triac = peripherals.GPIO9;
    // UART pins.
    let pin_uart_tx = peripherals.GPIO43;
    let pin_uart_rx = peripherals.GPIO44;

    // Initialize an in-memory logger.
    let memlog = memlog::init(MEMLOG_CAPACITY);
    memlog.enable_print(Level::Info);
    memlog.enable_watch();
    memlog.info(alloc::format!("hbfc {NODE_NAME} node initialized"));

    let bus = bus::init(memlog);
    let credentials = storage::init();

    let i2c_config = i2c::Config::default().with_frequency(Rate::from_khz(100));
    let humidity_i2c = i2c::I2c::new(peripherals.I2C0, i2c_config)
        .unwrap()
        .with_sda(pin_i2c_sda)
        .with_scl(pin_i2c_scl);

    // Set up the WiFi.
    let (wifi_controller, wifi_interfaces, wifi_channel) =
        task::wifi::init(timer1.timer0, peripherals.RADIO_CLK, peripherals.WIFI, rng).unwrap();

    // Set up the station network stack.
    let (station_stack, station_runner) = task::net::init_station(wifi_interfaces.sta, &mut rng);

    //
    // Watcher counts: serial console and front-end on most; the peer link also
    // watches our own readings, the sensor task the exterior readings and threshold.
    let control_status_watch = control::init::<2>();
    let (sensor_channel, humidity_watch) = humidity_sensor::init::<3>();
    let threshold_watch = humidity_sensor::init_threshold::<3>();
    let (peer_channel, exterior_humidity_watch) = peer::init::<3>();
    let (discovery_channel, peer_address_watch) = discovery::init::<1>();
    let (link_channel, link_status_watch) = config_link::init::<1>();
    let (fan_channel, fan_status_watch, regulator) = fan::init::<2>();
    let timer_channel = timers::init();
    let front_end_start = httpd::init_front_end();

    let services = control::Services {
        timers: timer_channel.sender(),
        wifi: wifi_channel.sender(),
        discovery: discovery_channel.sender(),
        peer: peer_channel.sender(),
        link: link_channel.sender(),
        sensor: sensor_channel.sender(),
        fan: match ROLE {
            Role::Interior => Some(fan_channel.sender()),
            Role::Exterior => None,
        },
        front_end: front_end_start,
    };

    //
    // Spawn tasks.
    || -> Result<(), SpawnError> {
        // Run the station network stack.
        spawner.spawn(task::net::stack_runner(station_runner))?;

        // Own the radio.
        spawner.spawn(task::wifi::wifi_service(
            wifi_controller,
            wifi_channel.receiver(),
            credentials,
            bus,
            memlog,
        ))?;

        // Service timer deadlines.
        spawner.spawn(timers::timers(timer_channel.receiver(), bus, memlog))?;

        // Discovery and the pairing link both live on the station network.
        spawner.spawn(discovery::discovery(
            station_stack,
            discovery_channel.receiver(),
            peer_address_watch.dyn_sender(),
            bus,
            memlog,
        ))?;
        spawner.spawn(peer::peer(
            station_stack,
            peer_channel.receiver(),
            peer::PeerLinks {
                peer_address: peer_address_watch.dyn_receiver().unwrap(),
                exterior_humidity: exterior_humidity_watch.dyn_sender(),
                own_humidity: humidity_watch.dyn_receiver().unwrap(),
                discovery: discovery_channel.sender(),
            },
            bus,
            memlog,
        ))?;

        // Take a humidity measurement whenever the dispatcher asks.
        let fan_inputs = match ROLE {
            Role::Interior => Some(humidity_sensor::FanInputs {
                exterior: exterior_humidity_watch.dyn_receiver().unwrap(),
                threshold: threshold_watch.dyn_receiver().unwrap(),
            }),
            Role::Exterior => None,
        };
        spawner.spawn(task::humidity_sensor(
            humidity_i2c,
            sensor_channel.receiver(),
            humidity_watch.dyn_sender(),
            fan_inputs,
            bus,
            memlog,
        ))?;

        // Launch a diagnostic interface on UART0.
        spawner.spawn(task::serial_console(
            peripherals.UART0.into(),
            pin_uart_rx.into(),
            pin_uart_tx.into(),
            serial_console::ConsoleLinks {
                control_status: control_status_watch.dyn_receiver().unwrap(),
                interior_humidity: humidity_watch.dyn_receiver().unwrap(),
                exterior_humidity: exterior_humidity_watch.dyn_receiver().unwrap(),
                fan_status: fan_status_watch.dyn_receiver().unwrap(),
                threshold_sender: threshold_watch.dyn_sender(),
                threshold_receiver: threshold_watch.dyn_receiver().unwrap(),
                regulator,
            },
            bus,
            memlog,
        ))?;

        match ROLE {
            Role::Interior => {
                // The setup network on the SoftAP interface.
                let (setup_stack, setup_runner) =
                    task::net::init_setup(wifi_interfaces.ap, &mut rng);
                spawner.spawn(task::net::stack_runner(setup_runner))?;
                spawner.spawn(task::dhcp::dhcp_server(setup_stack, bus, memlog))?;
                spawner.spawn(config_link::config_link(
                    setup_stack,
                    link_channel.receiver(),
                    credentials,
                    link_status_watch.dyn_sender(),
                    bus,
                    memlog,
                ))?;
                spawner.spawn(httpd::portal(
                    setup_stack,
                    link_status_watch.dyn_receiver().unwrap(),
                    credentials,
                    bus,
                    memlog,
                ))?;

                // The status front-end, once the nodes are paired.
                spawner.spawn(httpd::front_end(
                    station_stack,
                    front_end_start,
                    httpd::FrontEndLinks {
                        control_status: control_status_watch.dyn_receiver().unwrap(),
                        interior_humidity: humidity_watch.dyn_receiver().unwrap(),
                        exterior_humidity: exterior_humidity_watch.dyn_receiver().unwrap(),
                        fan_status: fan_status_watch.dyn_receiver().unwrap(),
                        threshold_sender: threshold_watch.dyn_sender(),
                        threshold_receiver: threshold_watch.dyn_receiver().unwrap(),
                        regulator,
                    },
                    bus,
                    memlog,
                ))?;

                // Fan speed regulation.
                spawner.spawn(fan::fan_regulator(
                    fan_channel.receiver(),
                    regulator,
                    fan_status_watch.dyn_sender(),
                    memlog,
                ))?;

                // The zero-crossing and tachometer edges run at interrupt priority.
                let pull_up = gpio::InputConfig::default().with_pull(gpio::Pull::Up);
                let pin_zero_cross = gpio::Input::new(pin_zero_cross, pull_up);
                let pin_tachometer = gpio::Input::new(pin_tachometer, pull_up);
                let output_5ma = gpio::OutputConfig::default()
                    .with_drive_strength(gpio::DriveStrength::_5mA)
                    .with_drive_mode(gpio::DriveMode::PushPull)
                    .with_pull(gpio::Pull::None);
                let pin_triac = gpio::Output::new(pin_triac, gpio::Level::Low, output_5ma);

                let software_interrupts = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
                let edge_executor = Box::leak(Box::new(InterruptExecutor::new(
                    software_interrupts.software_interrupt2,
                )));
                let edge_spawner = edge_executor.start(InterruptPriority::Priority3);
                edge_spawner.spawn(fan::zero_cross(pin_zero_cross, pin_triac))?;
                edge_spawner.spawn(fan::tachometer(pin_tachometer))?;
            }
            Role::Exterior => {
                // The exterior receives its credentials over the interior's setup network.
                spawner.spawn(config_link::config_link(
                    station_stack,
                    link_channel.receiver(),
                    credentials,
                    link_status_watch.dyn_sender(),
                    bus,
                    memlog,
                ))?;
            }
        }

        // Everything above is waiting for commands; start the state machine.
        spawner.spawn(task::dispatcher(
            station_stack,
            services,
            credentials,
            control_status_watch.dyn_sender(),
            bus,
            memlog,
        ))?;

        Ok(())
    }()
    .unwrap();
}
