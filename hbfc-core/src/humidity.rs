//! Honeywell HIH8121 humidity sensor and the fan decision built on it.
use embassy_time::Duration;
use embedded_hal::i2c::I2c;
use serde::Serialize;
use thiserror::Error;

pub const HIH8121_ADDRESS: u8 = 0x27;
/// Conversion time after a measurement request. The datasheet quotes 36.65 ms typical.
pub const MEASUREMENT_TIME: Duration = Duration::from_millis(100);
/// Interior humidity above which the fan may run.
pub const DEFAULT_THRESHOLD: f32 = 40.0;

const COUNT_SPAN: f32 = ((1u32 << 14) - 2) as f32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SensorStatus {
    Valid,
    /// Already fetched since the last measurement.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Reading {
    /// Relative humidity, in percent.
    pub humidity: f32,
    pub status: SensorStatus,
}

#[derive(Debug, Error)]
pub enum SensorError<E> {
    #[error("i2c transfer failed")]
    Bus(E),
    #[error("sensor is in command mode")]
    CommandMode,
    #[error("sensor reported a diagnostic fault")]
    Diagnostic,
}

/// `%RH = count / (2^14 - 2) * 100`.
pub fn count_to_percent(count: u16) -> f32 {
    f32::from(count & 0x3FFF) / COUNT_SPAN * 100.0
}

/// Decodes the two bytes the sensor returns: 2 status bits, then 14 bits of humidity.
pub fn decode<E>(frame: [u8; 2]) -> Result<Reading, SensorError<E>> {
    let status = match frame[0] >> 6 {
        0 => SensorStatus::Valid,
        1 => SensorStatus::Stale,
        2 => return Err(SensorError::CommandMode),
        _ => return Err(SensorError::Diagnostic),
    };
    let count = (u16::from(frame[0] & 0x3F) << 8) | u16::from(frame[1]);
    Ok(Reading {
        humidity: count_to_percent(count),
        status,
    })
}

pub struct Hih8121<I2C> {
    i2c: I2C,
    address: u8,
}

impl<I2C: I2c> Hih8121<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Hih8121 {
            i2c,
            address: HIH8121_ADDRESS,
        }
    }

    /// Starts a conversion. The result is ready after [`MEASUREMENT_TIME`].
    pub fn request_measurement(&mut self) -> Result<(), SensorError<I2C::Error>> {
        self.i2c.write(self.address, &[]).map_err(SensorError::Bus)
    }

    pub fn fetch(&mut self) -> Result<Reading, SensorError<I2C::Error>> {
        let mut frame = [0u8; 2];
        self.i2c
            .read(self.address, &mut frame)
            .map_err(SensorError::Bus)?;
        decode(frame)
    }

    pub fn release(self) -> I2C {
        self.i2c
    }
}

/// Run the fan when it is humid inside and drier outside.
///
/// Without a reading from the exterior there is nothing to compare against,
/// so the fan stays off.
pub fn fan_demand(interior: f32, exterior: Option<f32>, threshold: f32) -> bool {
    match exterior {
        Some(exterior) => interior > threshold && interior > exterior,
        None => false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("report frame has {0} bytes, expected 4")]
    Length(usize),
    #[error("reported humidity is not a percentage")]
    OutOfRange,
}

/// The exterior's periodic report: one little-endian `f32`.
pub fn encode_report(humidity: f32) -> [u8; 4] {
    humidity.to_le_bytes()
}

pub fn decode_report(frame: &[u8]) -> Result<f32, ReportError> {
    let bytes: [u8; REPORT_LEN] = frame
        .try_into()
        .map_err(|_| ReportError::Length(frame.len()))?;
    let humidity = f32::from_le_bytes(bytes);
    if !(0.0..=100.0).contains(&humidity) {
        return Err(ReportError::OutOfRange);
    }
    Ok(humidity)
}

pub const REPORT_LEN: usize = 4;

/// Cuts the pairing link's byte stream back into report frames.
///
/// Reads may carry several frames, or end partway through one; the tail is
/// held until the rest arrives.
#[derive(Debug, Default)]
pub struct ReportStream {
    partial: [u8; REPORT_LEN],
    held: usize,
}

impl ReportStream {
    pub const fn new() -> Self {
        ReportStream {
            partial: [0; REPORT_LEN],
            held: 0,
        }
    }

    /// Feeds one read's worth of bytes, handing each completed frame to `on_report`.
    pub fn feed(&mut self, mut bytes: &[u8], mut on_report: impl FnMut(Result<f32, ReportError>)) {
        while !bytes.is_empty() {
            let take = (REPORT_LEN - self.held).min(bytes.len());
            self.partial[self.held..self.held + take].copy_from_slice(&bytes[..take]);
            self.held += take;
            bytes = &bytes[take..];

            if self.held == REPORT_LEN {
                self.held = 0;
                on_report(decode_report(&self.partial));
            }
        }
    }

    /// Drops any partial frame, for a fresh connection.
    pub fn reset(&mut self) {
        self.held = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, ErrorType, Operation};

    struct FakeBus {
        response: [u8; 2],
        writes: usize,
        nack: bool,
    }

    impl ErrorType for FakeBus {
        type Error = ErrorKind;
    }

    impl I2c for FakeBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            assert_eq!(address, HIH8121_ADDRESS);
            if self.nack {
                return Err(ErrorKind::NoAcknowledge(
                    embedded_hal::i2c::NoAcknowledgeSource::Address,
                ));
            }
            for operation in operations {
                match operation {
                    Operation::Write(bytes) => {
                        assert!(bytes.is_empty());
                        self.writes += 1;
                    }
                    Operation::Read(buffer) => buffer.copy_from_slice(&self.response),
                }
            }
            Ok(())
        }
    }

    fn close_to(value: f32, expected: f32) -> bool {
        (value - expected).abs() < 0.01
    }

    #[test]
    fn converts_counts_to_percent() {
        assert!(close_to(count_to_percent(8192), 50.0));
        assert_eq!(count_to_percent(0), 0.0);
        assert!(close_to(count_to_percent(16382), 100.0));
    }

    #[test]
    fn decodes_status_and_count() {
        let reading = decode::<()>([0x20, 0x00]).unwrap();
        assert_eq!(reading.status, SensorStatus::Valid);
        assert!(close_to(reading.humidity, 50.0));

        let reading = decode::<()>([0x60, 0x00]).unwrap();
        assert_eq!(reading.status, SensorStatus::Stale);

        assert!(matches!(decode::<()>([0x80, 0x00]), Err(SensorError::CommandMode)));
        assert!(matches!(decode::<()>([0xC0, 0x00]), Err(SensorError::Diagnostic)));
    }

    #[test]
    fn driver_requests_then_fetches() {
        let mut sensor = Hih8121::new(FakeBus {
            response: [0x20, 0x00],
            writes: 0,
            nack: false,
        });
        sensor.request_measurement().unwrap();
        let reading = sensor.fetch().unwrap();

        assert!(close_to(reading.humidity, 50.0));
        assert_eq!(sensor.release().writes, 1);
    }

    #[test]
    fn bus_errors_surface() {
        let mut sensor = Hih8121::new(FakeBus {
            response: [0; 2],
            writes: 0,
            nack: true,
        });
        assert!(matches!(sensor.request_measurement(), Err(SensorError::Bus(_))));
    }

    #[test]
    fn fan_runs_only_when_humid_inside_and_drier_outside() {
        assert!(fan_demand(55.0, Some(45.0), DEFAULT_THRESHOLD));
        assert!(!fan_demand(55.0, Some(60.0), DEFAULT_THRESHOLD));
        assert!(!fan_demand(38.0, Some(20.0), DEFAULT_THRESHOLD));
        assert!(!fan_demand(55.0, None, DEFAULT_THRESHOLD));
    }

    #[test]
    fn losing_the_exterior_reading_stops_the_fan() {
        let interior = 62.0;
        assert!(fan_demand(interior, Some(35.0), DEFAULT_THRESHOLD));
        // The pairing link dropped and the exterior value was cleared.
        assert!(!fan_demand(interior, None, DEFAULT_THRESHOLD));
    }

    #[test]
    fn stream_splits_coalesced_reports() {
        let mut wire = [0u8; 8];
        wire[..4].copy_from_slice(&encode_report(41.0));
        wire[4..].copy_from_slice(&encode_report(42.5));

        let mut stream = ReportStream::new();
        let mut reports = std::vec::Vec::new();
        stream.feed(&wire, |report| reports.push(report));

        assert_eq!(reports, [Ok(41.0), Ok(42.5)]);
    }

    #[test]
    fn stream_joins_a_report_split_across_reads() {
        let frame = encode_report(57.25);
        let mut stream = ReportStream::new();
        let mut reports = std::vec::Vec::new();

        stream.feed(&frame[..2], |report| reports.push(report));
        assert!(reports.is_empty());
        stream.feed(&frame[2..], |report| reports.push(report));

        assert_eq!(reports, [Ok(57.25)]);
    }

    #[test]
    fn stream_carries_a_tail_into_the_next_read() {
        let first = encode_report(30.0);
        let second = encode_report(70.0);
        let mut chunk = [0u8; 6];
        chunk[..4].copy_from_slice(&first);
        chunk[4..].copy_from_slice(&second[..2]);

        let mut stream = ReportStream::new();
        let mut reports = std::vec::Vec::new();
        stream.feed(&chunk, |report| reports.push(report));
        stream.feed(&second[2..], |report| reports.push(report));
        assert_eq!(reports, [Ok(30.0), Ok(70.0)]);

        // A reset forgets a half-received frame.
        stream.feed(&first[..3], |report| reports.push(report));
        stream.reset();
        stream.feed(&second, |report| reports.push(report));
        assert_eq!(reports, [Ok(30.0), Ok(70.0), Ok(70.0)]);
    }

    #[test]
    fn report_frames_must_be_four_bytes() {
        assert_eq!(decode_report(&encode_report(47.5)), Ok(47.5));
        assert_eq!(decode_report(&[0, 0, 0]), Err(ReportError::Length(3)));
        assert_eq!(decode_report(&[0; 5]), Err(ReportError::Length(5)));
        assert_eq!(
            decode_report(&f32::NAN.to_le_bytes()),
            Err(ReportError::OutOfRange)
        );
    }
}
