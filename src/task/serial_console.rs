use crate::{
    bus::SharedBus,
    memlog::SharedLogger,
    task::{
        control::ControlStatusDynReceiver,
        fan::{self, FanStatusDynReceiver, SharedRegulator},
        humidity_sensor::{HumidityDynReceiver, ThresholdDynReceiver, ThresholdDynSender},
        peer::ExteriorHumidityDynReceiver,
    },
};
use alloc::{format, string::String};
use embassy_futures::select;
use embassy_time::{Duration, Timer};
use esp_hal::{Async, gpio, uart};
use hbfc_core::{Priority, humidity::DEFAULT_THRESHOLD};

// Number of bytes to allocate to keep a history of commands.
const COMMAND_HISTORY_BUFFER_SIZE: usize = 1000; // in bytes
const SERIAL_MOTD: &str = const_format::formatcp!(
    "\r\n{} {} ({})\r\n",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_VERSION"),
    crate::config::NODE_NAME,
);

// Uart::write_async doesn't guarantee it will send everything.
trait UartWriteAllAsync {
    async fn write_all_async(&mut self, data: &[u8]) -> Result<(), uart::TxError>;
}
impl UartWriteAllAsync for uart::Uart<'_, Async> {
    async fn write_all_async(&mut self, mut data: &[u8]) -> Result<(), uart::TxError> {
        while !data.is_empty() {
            let bytes_written = self.write_async(data).await?;
            data = &data[bytes_written..];
        }
        Ok(())
    }
}

pub struct ConsoleLinks {
    pub control_status: ControlStatusDynReceiver,
    pub interior_humidity: HumidityDynReceiver,
    pub exterior_humidity: ExteriorHumidityDynReceiver,
    pub fan_status: FanStatusDynReceiver,
    pub threshold_sender: ThresholdDynSender,
    pub threshold_receiver: ThresholdDynReceiver,
    pub regulator: SharedRegulator,
}

/// Diagnostic console on UART0.
#[embassy_executor::task]
pub async fn serial_console(
    peripheral_uart: uart::AnyUart<'static>,
    pin_uart_rx: gpio::AnyPin<'static>,
    pin_uart_tx: gpio::AnyPin<'static>,
    mut links: ConsoleLinks,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    // UART setup. When in loopback mode, ensure TX is configured first (#2914).
    let Ok(uart) = uart::Uart::new(peripheral_uart, uart::Config::default()) else {
        memlog.error("console: uart config rejected");
        return;
    };
    let mut uart = uart.with_tx(pin_uart_tx).with_rx(pin_uart_rx).into_async();

    // Line editor setup.
    let mut input_buffer = [0u8; 100]; // Commands are short, could be smaller
    let mut history_buffer = [0u8; COMMAND_HISTORY_BUFFER_SIZE];
    let Ok(mut editor) = noline::builder::EditorBuilder::from_slice(&mut input_buffer)
        .with_slice_history(&mut history_buffer)
        .build_async(&mut uart)
        .await
    else {
        memlog.error("console: line editor setup failed");
        return;
    };

    loop {
        // Try block to catch UART errors.
        let catch: Result<(), uart::TxError> = async {
            // Write the MOTD out.
            uart.write_all_async(SERIAL_MOTD.as_bytes()).await?;

            let prompt = "> ";
            // Note: Ctrl-C and Ctrl-D break the readline while loop.
            while let Ok(line) = editor.readline(prompt, &mut uart).await {
                cli_parser(line, &mut uart, &mut links, bus, memlog).await?;
            }

            Ok(())
        }
        .await;

        if let Err(tx_error) = catch {
            // Push the UART error to the memlog.
            memlog.warn(format!("uart error: {}", tx_error));
        }

        // Pause before trying the UART again after an error.
        Timer::after(Duration::from_secs(1)).await;
    } // loop
}

async fn cli_parser(
    line: &str,
    uart: &mut uart::Uart<'static, Async>,
    links: &mut ConsoleLinks,
    bus: SharedBus,
    memlog: SharedLogger,
) -> Result<(), uart::TxError> {
    // Get the command from the first argument.
    let mut chunks = line.split_whitespace();
    let response = match (chunks.next(), chunks.next()) {
        //
        // Help message.
        (Some("help"), None) => {
            "state\r\n\
             events\r\n\
             humidity\r\n\
             · watch\r\n\
             fan\r\n\
             target <rpm>\r\n\
             threshold <rh>\r\n\
             log\r\n\
             · clear\r\n\
             · watch\r\n\
             reboot\r\n\
             help"
        }

        //
        // Control state.
        (Some("state"), None) => match links.control_status.try_get() {
            Some(status) => &format!(
                "{:?} node, phase {:?}, config mode {}, {} fallbacks",
                status.role, status.phase, status.config_mode, status.fallbacks
            ),
            None => "Dispatcher not running",
        },
        (Some("events"), None) => &{
            let mut listing = bus
                .history()
                .iter()
                .map(|(priority, event)| format!("{priority:?} {event}\r\n"))
                .collect::<String>();
            listing.push_str(&format!(
                "pending: control {}, worker {}, bookkeeping {}",
                bus.pending(Priority::Control),
                bus.pending(Priority::Worker),
                bus.pending(Priority::Bookkeeping)
            ));
            listing
        },

        //
        // Humidity.
        (Some("humidity"), None) => &format!(
            "interior {:?}\r\nexterior {:?}",
            links.interior_humidity.try_get(),
            links.exterior_humidity.try_get()
        ),
        (Some("humidity"), Some("watch")) => {
            let mut buf = [0u8; 1];
            'watch_loop: loop {
                // Watch for new readings until the user interrupts.
                let wait_for_sensor = links.interior_humidity.changed();
                let wait_for_input = uart.read_async(&mut buf);
                match select::select(wait_for_sensor, wait_for_input).await {
                    select::Either::First(reading) => {
                        let formatted = format!("{:?}\r\n", reading);
                        uart.write_all_async(formatted.as_bytes()).await?;
                    }
                    select::Either::Second(bytes_read) => {
                        // Accept a Ctrl-C or Ctrl-D to interrupt (ASCII End of Text, End of Transmission)
                        if let Ok(1) = bytes_read {
                            if (buf[0] == 0x03) | (buf[0] == 0x04) {
                                break 'watch_loop;
                            }
                        }
                    }
                };
            }
            ""
        }
        (Some("humidity"), Some(_)) => "Invalid subcommand for 'humidity'",

        //
        // Fan.
        (Some("fan"), None) => &format!("{:?}", links.fan_status.try_get()),
        (Some("target"), Some(rpm_str)) => match rpm_str.parse::<u32>() {
            Ok(rpm) => match fan::set_target(links.regulator, rpm) {
                Ok(()) => {
                    memlog.info(format!("console: fan target set to {rpm} rpm"));
                    "Fan target set"
                }
                Err(error) => &format!("{error}"),
            },
            Err(_parse_error) => "Failed to parse fan target.",
        },
        (Some("target"), None) => {
            &format!("{} rpm", links.regulator.lock(|r| r.borrow().target()))
        }
        (Some("threshold"), Some(rh_str)) => match rh_str.parse::<u8>() {
            Ok(rh) if rh <= 100 => {
                links.threshold_sender.send(f32::from(rh));
                "Humidity threshold set"
            }
            Ok(_) => "Humidity threshold must be between 0 and 100",
            Err(_parse_error) => "Failed to parse humidity threshold.",
        },
        (Some("threshold"), None) => &format!(
            "{:.1}%",
            links.threshold_receiver.try_get().unwrap_or(DEFAULT_THRESHOLD)
        ),

        //
        // Log control.
        (Some("log"), None) => &memlog.render("\r\n"),
        (Some("log"), Some("clear")) => {
            memlog.clear();
            "Logs cleared"
        }
        (Some("log"), Some("watch")) => match memlog.watch() {
            None => "Log watching unavailable",
            Some(mut log_receiver) => {
                let mut buf = [0u8; 1];
                'watch_loop: loop {
                    let wait_for_record = log_receiver.changed();
                    let wait_for_input = uart.read_async(&mut buf);
                    match select::select(wait_for_record, wait_for_input).await {
                        select::Either::First(record) => {
                            let formatted = format!("{record}\r\n");
                            uart.write_all_async(formatted.as_bytes()).await?;
                        }
                        select::Either::Second(bytes_read) => {
                            if let Ok(1) = bytes_read {
                                if (buf[0] == 0x03) | (buf[0] == 0x04) {
                                    break 'watch_loop;
                                }
                            }
                        }
                    };
                }
                ""
            }
        },
        (Some("log"), Some(_)) => "Invalid subcommand for 'log'",

        (Some("reboot"), None) => {
            uart.write_all_async(b"Rebooting\r\n").await?;
            esp_hal::system::software_reset()
        }

        //
        //
        (None, None) => "Please enter a command",
        _ => "Unrecognized command",
    };

    if !response.is_empty() {
        uart.write_all_async(response.as_bytes()).await?;
        uart.write_all_async(b"\r\n").await?;
    }

    Ok(())
}
