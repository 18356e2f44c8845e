// Brezel - AHT20 temperature and humidity reporter for serial links
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::metrics::ReportMetrics;
use crate::sensor::{AHT20Sensor, Initialized, SensorError, SensorErrorKind, SensorReading};
use rppal::uart::{Parity, Uart};
use std::error::Error;
use std::fmt::{self, Formatter};
use std::io::{self, Write};
use std::num::ParseFloatError;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Time to wait between the end of one measurement and the start of the next.
pub const REPORT_INTERVAL: Duration = Duration::from_millis(300_000);

/// Number of times the measurement frame is read while the sensor reports it is busy.
pub const MEASURE_ATTEMPTS: u32 = 3;

/// Single line of output written to the serial link for each successful reading.
///
/// The format is `TEMP:<celsius>,HUMIDITY:<percent>` followed by a newline, with
/// both values formatted with exactly two fractional digits. This is the format
/// consumers of the serial link parse so it must not change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    temperature: f64,
    humidity: f64,
}

impl Record {
    const TEMPERATURE_PREFIX: &'static str = "TEMP:";
    const HUMIDITY_PREFIX: &'static str = "HUMIDITY:";

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn humidity(&self) -> f64 {
        self.humidity
    }

    /// Format this record as a complete newline terminated line.
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl From<&SensorReading> for Record {
    fn from(reading: &SensorReading) -> Self {
        Record {
            temperature: reading.temperature().into(),
            humidity: reading.humidity().into(),
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:.2},{}{:.2}",
            Self::TEMPERATURE_PREFIX,
            self.temperature,
            Self::HUMIDITY_PREFIX,
            self.humidity
        )
    }
}

impl FromStr for Record {
    type Err = RecordError;

    /// Parse a single line read from the serial link. A trailing `\n` or `\r\n` is
    /// allowed, any other surrounding content is an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.strip_suffix('\n').unwrap_or(s);
        let line = line.strip_suffix('\r').unwrap_or(line);

        let (temp_part, humidity_part) = line
            .split_once(',')
            .ok_or(RecordError::Malformed("missing field separator"))?;

        let temperature = temp_part
            .strip_prefix(Self::TEMPERATURE_PREFIX)
            .ok_or(RecordError::Malformed("missing temperature prefix"))
            .and_then(|v| parse_value("invalid temperature", v))?;

        let humidity = humidity_part
            .strip_prefix(Self::HUMIDITY_PREFIX)
            .ok_or(RecordError::Malformed("missing humidity prefix"))
            .and_then(|v| parse_value("invalid humidity", v))?;

        Ok(Record { temperature, humidity })
    }
}

fn parse_value(msg: &'static str, v: &str) -> Result<f64, RecordError> {
    let parsed = v.parse::<f64>().map_err(|e| RecordError::Value(msg, e))?;
    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(RecordError::Malformed(msg))
    }
}

/// Error parsing a `Record` from a line of text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    Malformed(&'static str),
    Value(&'static str, ParseFloatError),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::Malformed(msg) => msg.fmt(f),
            RecordError::Value(msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for RecordError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RecordError::Value(_, ref e) => Some(e),
            _ => None,
        }
    }
}

/// Error writing to the serial link or other byte sink.
#[derive(Debug)]
pub struct SinkError {
    msg: &'static str,
    cause: Box<dyn Error + Send + Sync>,
}

impl SinkError {
    pub fn new<E>(msg: &'static str, cause: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        SinkError {
            msg,
            cause: Box::new(cause),
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.msg, self.cause)
    }
}

impl Error for SinkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// Destination for formatted readings, usually a serial port.
///
/// Each call writes an entire buffer, blocking until all of it has been accepted.
pub trait ByteSink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SinkError>;
}

impl<T: ByteSink + ?Sized> ByteSink for Box<T> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        (**self).write_all(bytes)
    }
}

/// Open a serial device by path (e.g. `/dev/serial0`) with 8 data bits, no parity,
/// and one stop bit, with blocking writes.
pub fn open_serial<P: AsRef<Path>>(path: P, baud_rate: u32) -> Result<Uart, SinkError> {
    let mut uart = Uart::with_path(path, baud_rate, Parity::None, 8, 1)
        .map_err(|e| SinkError::new("unable to open serial device", e))?;

    uart.set_write_mode(true)
        .map_err(|e| SinkError::new("unable to set serial write mode", e))?;

    Ok(uart)
}

impl ByteSink for Uart {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        let mut written = 0;

        while written < bytes.len() {
            let n = Uart::write(self, &bytes[written..])
                .map_err(|e| SinkError::new("unable to write to serial device", e))?;

            if n == 0 {
                return Err(SinkError::new(
                    "unable to write to serial device",
                    io::Error::from(io::ErrorKind::WriteZero),
                ));
            }

            written += n;
        }

        // Wait until the whole line has actually been transmitted
        self.drain()
            .map_err(|e| SinkError::new("unable to drain serial device", e))
    }
}

/// `ByteSink` for anything implementing `std::io::Write`, such as standard output.
#[derive(Debug)]
pub struct WriteSink<W> {
    inner: W,
}

impl<W: Write> WriteSink<W> {
    pub fn new(inner: W) -> Self {
        WriteSink { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> ByteSink for WriteSink<W> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        self.inner
            .write_all(bytes)
            .and_then(|_| self.inner.flush())
            .map_err(|e| SinkError::new("unable to write to output", e))
    }
}

/// Error taking or reporting a single reading.
#[derive(Debug)]
pub enum ReportError {
    Sensor(SensorError),
    Sink(SinkError),
}

impl ReportError {
    /// Label for the kind of error, suitable for use in metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ReportError::Sensor(e) => e.kind().as_label(),
            ReportError::Sink(_) => "sink",
        }
    }
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReportError::Sensor(e) => write!(f, "unable to read sensor: {}", e),
            ReportError::Sink(e) => write!(f, "unable to send reading: {}", e),
        }
    }
}

impl Error for ReportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReportError::Sensor(e) => Some(e),
            ReportError::Sink(e) => Some(e),
        }
    }
}

/// Write successful readings to a `ByteSink` and log failures.
pub struct Reporter {
    sink: Box<dyn ByteSink + Send + 'static>,
    metrics: ReportMetrics,
}

impl Reporter {
    pub fn new<S>(sink: S, metrics: ReportMetrics) -> Self
    where
        S: ByteSink + Send + 'static,
    {
        Self {
            sink: Box::new(sink),
            metrics,
        }
    }

    /// Send a reading as a single line or log why there is no reading to send.
    /// Neither case is fatal, the result is returned for the caller to inspect.
    pub fn report(&mut self, result: Result<SensorReading, SensorError>) -> Result<SensorReading, ReportError> {
        let res = match result {
            Ok(reading) => self.send(reading),
            Err(e) => {
                if e.kind() == SensorErrorKind::Busy {
                    tracing::warn!(message = "sensor busy, skipping reading", error = %e);
                } else {
                    tracing::error!(message = "unable to read sensor", kind = e.kind().as_label(), error = %e);
                }

                Err(ReportError::Sensor(e))
            }
        };

        self.metrics.update(&res);
        res
    }

    fn send(&mut self, reading: SensorReading) -> Result<SensorReading, ReportError> {
        let line = Record::from(&reading).to_line();

        match self.sink.write_all(line.as_bytes()) {
            Ok(_) => {
                tracing::info!(
                    message = "sent reading",
                    temperature = %reading.temperature(),
                    humidity = %reading.humidity()
                );
                Ok(reading)
            }
            Err(e) => {
                tracing::error!(message = "unable to send reading", error = %e);
                Err(ReportError::Sink(e))
            }
        }
    }
}

/// Periodic measure-and-report cycle for an initialized sensor.
///
/// Owns both the sensor and the reporter so that a single cycle can be run on a
/// blocking thread without any locking. Failures in one cycle have no effect on
/// the next.
pub struct ReportingLoop {
    sensor: AHT20Sensor<Initialized>,
    reporter: Reporter,
}

impl ReportingLoop {
    pub fn new(sensor: AHT20Sensor<Initialized>, reporter: Reporter) -> Self {
        Self { sensor, reporter }
    }

    /// Measure the sensor once and report the result. Blocks for at least the
    /// sensor settle time.
    pub fn cycle(&mut self) -> Result<SensorReading, ReportError> {
        let res = self.sensor.measure_polled(MEASURE_ATTEMPTS);
        self.reporter.report(res)
    }
}

#[cfg(test)]
mod test {
    use super::{ByteSink, Record, RecordError, ReportError, Reporter, ReportingLoop, SinkError, WriteSink};
    use crate::metrics::ReportMetrics;
    use crate::sensor::test::{frame, MockBus, MockClock, READY};
    use crate::sensor::{AHT20Sensor, SensorError, SensorErrorKind, SensorReading};
    use prometheus::Registry;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Sink that keeps everything written to it in a buffer shared with the test
    #[derive(Debug, Clone, Default)]
    struct SharedSink {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl SharedSink {
        fn contents(&self) -> String {
            String::from_utf8(self.buf.lock().unwrap().clone()).unwrap()
        }
    }

    impl ByteSink for SharedSink {
        fn write_all(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
            self.buf.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }
    }

    /// Sink that fails every write
    struct FailingSink;

    impl ByteSink for FailingSink {
        fn write_all(&mut self, _bytes: &[u8]) -> Result<(), SinkError> {
            Err(SinkError::new(
                "unable to write",
                io::Error::from(io::ErrorKind::BrokenPipe),
            ))
        }
    }

    fn reading(humidity_raw: u32, temperature_raw: u32) -> SensorReading {
        let clock = MockClock::new();
        let bus = MockBus::new(&clock).with_frame(frame(READY, humidity_raw, temperature_raw));
        let mut sensor = AHT20Sensor::new(bus, clock).initialize().unwrap();
        sensor.measure().unwrap()
    }

    fn metrics() -> ReportMetrics {
        ReportMetrics::new(&Registry::new()).unwrap()
    }

    #[test]
    fn test_record_format() {
        let record = Record {
            temperature: 23.5,
            humidity: 65.2,
        };

        assert_eq!("TEMP:23.50,HUMIDITY:65.20\n", record.to_line());
        assert_eq!("TEMP:23.50,HUMIDITY:65.20", record.to_string());
    }

    #[test]
    fn test_record_format_extremes() {
        let low = Record {
            temperature: -50.0,
            humidity: 0.0,
        };
        let high = Record {
            temperature: 149.99981,
            humidity: 99.99990,
        };

        assert_eq!("TEMP:-50.00,HUMIDITY:0.00\n", low.to_line());
        assert_eq!("TEMP:150.00,HUMIDITY:100.00\n", high.to_line());
        assert!(high.to_line().len() < 64);
    }

    #[test]
    fn test_record_from_reading() {
        // Half of full scale humidity, quarter of full scale temperature
        let record = Record::from(&reading(0x80000, 0x40000));

        assert_eq!("TEMP:0.00,HUMIDITY:50.00\n", record.to_line());
    }

    #[test]
    fn test_record_parse() {
        let record: Record = "TEMP:23.50,HUMIDITY:65.20\n".parse().unwrap();
        assert_eq!(23.5, record.temperature());
        assert_eq!(65.2, record.humidity());

        let record: Record = "TEMP:-4.25,HUMIDITY:0.00\r\n".parse().unwrap();
        assert_eq!(-4.25, record.temperature());
        assert_eq!(0.0, record.humidity());
    }

    #[test]
    fn test_record_parse_own_output() {
        let record = Record::from(&reading(0x59999, 0x5E666));
        let parsed: Record = record.to_line().parse().unwrap();

        assert_eq!(record.to_string(), parsed.to_string());
    }

    #[test]
    fn test_record_parse_malformed() {
        assert_eq!(
            RecordError::Malformed("missing field separator"),
            "ESP32-C3 AHT20 Sensor Ready".parse::<Record>().unwrap_err()
        );
        assert_eq!(
            RecordError::Malformed("missing temperature prefix"),
            "TMP:23.50,HUMIDITY:65.20".parse::<Record>().unwrap_err()
        );
        assert_eq!(
            RecordError::Malformed("missing humidity prefix"),
            "TEMP:23.50,HUM:65.20".parse::<Record>().unwrap_err()
        );
        assert_eq!(
            RecordError::Malformed("invalid humidity"),
            "TEMP:23.50,HUMIDITY:NaN".parse::<Record>().unwrap_err()
        );
        assert!(matches!(
            " TEMP:23.50,HUMIDITY:65.20".parse::<Record>(),
            Err(RecordError::Malformed(_))
        ));
        assert!(matches!(
            "TEMP:23.50 ,HUMIDITY:65.20".parse::<Record>(),
            Err(RecordError::Value("invalid temperature", _))
        ));
        assert!(matches!(
            "TEMP:23.50,HUMIDITY:65.20,EXTRA:1".parse::<Record>(),
            Err(RecordError::Value("invalid humidity", _))
        ));
    }

    #[test]
    fn test_write_sink() {
        let mut sink = WriteSink::new(Vec::new());
        sink.write_all(b"TEMP:23.50,HUMIDITY:65.20\n").unwrap();

        assert_eq!(b"TEMP:23.50,HUMIDITY:65.20\n".to_vec(), sink.into_inner());
    }

    #[test]
    fn test_reporter_writes_line() {
        let sink = SharedSink::default();
        let mut reporter = Reporter::new(sink.clone(), metrics());

        let res = reporter.report(Ok(reading(0x80000, 0x40000)));

        assert!(res.is_ok());
        assert_eq!("TEMP:0.00,HUMIDITY:50.00\n", sink.contents());
    }

    #[test]
    fn test_reporter_sensor_error_writes_nothing() {
        let sink = SharedSink::default();
        let mut reporter = Reporter::new(sink.clone(), metrics());

        let res = reporter.report(Err(SensorError::KindMsg(SensorErrorKind::Busy, "sensor busy")));

        assert_eq!("busy", res.unwrap_err().kind_label());
        assert_eq!("", sink.contents());
    }

    #[test]
    fn test_reporter_sink_error() {
        let mut reporter = Reporter::new(FailingSink, metrics());

        let res = reporter.report(Ok(reading(0x80000, 0x40000)));

        assert!(matches!(res, Err(ReportError::Sink(_))));
    }

    #[test]
    fn test_loop_cycle_failure_then_recovery() {
        let clock = MockClock::new();
        let bus = MockBus::new(&clock)
            .with_read_failure()
            .with_frame(frame(READY, 0x80000, 0x40000));
        let sensor = AHT20Sensor::new(bus, clock).initialize().unwrap();

        let sink = SharedSink::default();
        let mut reporting = ReportingLoop::new(sensor, Reporter::new(sink.clone(), metrics()));

        let first = reporting.cycle();
        assert_eq!("transport", first.unwrap_err().kind_label());
        assert_eq!("", sink.contents());

        let second = reporting.cycle();
        assert!(second.is_ok());
        assert_eq!("TEMP:0.00,HUMIDITY:50.00\n", sink.contents());
    }

    #[test]
    fn test_loop_cycle_polls_busy_sensor() {
        let clock = MockClock::new();
        let bus = MockBus::new(&clock)
            .with_frame(frame(0x9c, 0, 0))
            .with_frame(frame(0x9c, 0, 0))
            .with_frame(frame(READY, 0x80000, 0x40000));
        let sensor = AHT20Sensor::new(bus, clock).initialize().unwrap();

        let sink = SharedSink::default();
        let mut reporting = ReportingLoop::new(sensor, Reporter::new(sink.clone(), metrics()));

        assert!(reporting.cycle().is_ok());
        assert_eq!("TEMP:0.00,HUMIDITY:50.00\n", sink.contents());
    }
}
