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

use std::error::Error;
use std::fmt::{self, Formatter};
use std::thread;
use std::time::{Duration, Instant};

use rppal::i2c::I2c;

/// Temperature, in degrees celsius
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct TemperatureCelsius(f64);

impl From<TemperatureCelsius> for f64 {
    fn from(v: TemperatureCelsius) -> Self {
        v.0
    }
}

impl From<f64> for TemperatureCelsius {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for TemperatureCelsius {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}c", self.0)
    }
}

/// Relative humidity (from 0 to 100)
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Humidity(f64);

impl From<Humidity> for f64 {
    fn from(v: Humidity) -> Self {
        v.0
    }
}

impl From<f64> for Humidity {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for Humidity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Single temperature and humidity measurement decoded from the sensor.
///
/// Readings can only be created by successfully decoding a frame read from the
/// sensor, which guarantees both values are within the range the sensor is able
/// to report.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SensorReading {
    temperature: TemperatureCelsius,
    humidity: Humidity,
}

impl SensorReading {
    pub(crate) const MIN_TEMPERATURE: f64 = -50.0;
    pub(crate) const MAX_TEMPERATURE: f64 = 150.0;
    pub(crate) const MIN_HUMIDITY: f64 = 0.0;
    pub(crate) const MAX_HUMIDITY: f64 = 100.0;

    /// Create a new reading, returning an error if either value is outside of the
    /// range the sensor can measure. Values are never clamped.
    pub(crate) fn checked(temperature: TemperatureCelsius, humidity: Humidity) -> Result<Self, SensorError> {
        let t = f64::from(temperature);
        let h = f64::from(humidity);

        // Written so that NaN fails both comparisons and is rejected as well.
        let temperature_ok = t >= Self::MIN_TEMPERATURE && t <= Self::MAX_TEMPERATURE;
        let humidity_ok = h >= Self::MIN_HUMIDITY && h <= Self::MAX_HUMIDITY;

        if temperature_ok && humidity_ok {
            Ok(Self { temperature, humidity })
        } else {
            Err(SensorError::OutOfRange(temperature, humidity))
        }
    }

    pub fn temperature(&self) -> TemperatureCelsius {
        self.temperature
    }

    pub fn humidity(&self) -> Humidity {
        self.humidity
    }
}

/// Potential kinds of errors that can be encountered reading from the AHT20 sensor
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorErrorKind {
    Transport,
    Busy,
    Timeout,
    Checksum,
    OutOfRange,
}

impl SensorErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorErrorKind::Transport => "transport",
            SensorErrorKind::Busy => "busy",
            SensorErrorKind::Timeout => "timeout",
            SensorErrorKind::Checksum => "checksum",
            SensorErrorKind::OutOfRange => "out_of_range",
        }
    }
}

/// Error initializing or reading the AHT20 sensor via an I2C bus
#[derive(Debug)]
pub enum SensorError {
    CheckSum(u8, u8),
    OutOfRange(TemperatureCelsius, Humidity),
    KindMsg(SensorErrorKind, &'static str),
    KindMsgCause(SensorErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl SensorError {
    pub fn kind(&self) -> SensorErrorKind {
        match self {
            SensorError::CheckSum(_, _) => SensorErrorKind::Checksum,
            SensorError::OutOfRange(_, _) => SensorErrorKind::OutOfRange,
            SensorError::KindMsg(kind, _) => *kind,
            SensorError::KindMsgCause(kind, _, _) => *kind,
        }
    }

    pub(crate) fn transport<E>(msg: &'static str, e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        SensorError::KindMsgCause(SensorErrorKind::Transport, msg, Box::new(e))
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::CheckSum(expected, got) => {
                write!(f, "checksum error: expected {}, got {}", expected, got)
            }
            SensorError::OutOfRange(temperature, humidity) => {
                write!(
                    f,
                    "reading out of range: temperature {}, humidity {}",
                    temperature, humidity
                )
            }
            SensorError::KindMsg(_, msg) => msg.fmt(f),
            SensorError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for SensorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SensorError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Open the I2C bus the sensor is connected to by its bus number, e.g. `1`
/// for `/dev/i2c-1`.
///
/// I2C must be enabled on the Raspberry PI (via `raspi-config` or the
/// `dtparam=i2c_arm=on` line in `/boot/config.txt`) for the bus device to exist.
pub fn open_bus(bus: u8) -> Result<I2c, SensorError> {
    I2c::with_bus(bus).map_err(|e| SensorError::transport("unable to open I2C bus", e))
}

/// Abstraction around an I2C bus to allow for easier testing.
///
/// Each call is a complete transaction with the device at the given 7-bit
/// address. Failures of the underlying bus are reported as `Transport` errors.
pub trait Bus {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), SensorError>;
    fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), SensorError>;
}

impl Bus for I2c {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), SensorError> {
        self.set_slave_address(u16::from(address))
            .map_err(|e| SensorError::transport("unable to set I2C slave address", e))?;

        let written = I2c::write(self, bytes).map_err(|e| SensorError::transport("unable to write to I2C device", e))?;
        if written != bytes.len() {
            return Err(SensorError::KindMsg(
                SensorErrorKind::Transport,
                "short write to I2C device",
            ));
        }

        Ok(())
    }

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), SensorError> {
        self.set_slave_address(u16::from(address))
            .map_err(|e| SensorError::transport("unable to set I2C slave address", e))?;

        let read = I2c::read(self, buffer).map_err(|e| SensorError::transport("unable to read from I2C device", e))?;
        if read != buffer.len() {
            return Err(SensorError::KindMsg(
                SensorErrorKind::Transport,
                "short read from I2C device",
            ));
        }

        Ok(())
    }
}

/// Source of elapsed time and delays used for sensor command timing.
pub trait Clock {
    /// Time elapsed since the sensor was powered up.
    fn elapsed(&self) -> Duration;

    /// Block for at least the given duration.
    fn sleep(&mut self, duration: Duration);
}

/// Clock backed by the system monotonic clock and thread sleeps.
///
/// The sensor is assumed to have been powered up when the clock was created, which
/// is the conservative choice when the actual power-on time isn't known.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    powered_at: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::since(Instant::now())
    }

    pub fn since(powered_at: Instant) -> Self {
        Self { powered_at }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.powered_at.elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}
