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

use crate::sensor::core::{Bus, Clock, Humidity, SensorError, SensorErrorKind, SensorReading, TemperatureCelsius};
use crc::{Algorithm, Crc};
use std::error::Error;
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;
use std::time::Duration;

/// I2C address of the AHT20 sensor.
pub const SENSOR_ADDRESS: u8 = 0x38;

pub(crate) const FRAME_SIZE: usize = 7;
pub(crate) const INIT_COMMAND: [u8; 3] = [0xBE, 0x08, 0x00];
pub(crate) const TRIGGER_COMMAND: [u8; 3] = [0xAC, 0x33, 0x00];

pub(crate) const POWER_UP_DELAY: Duration = Duration::from_millis(40);
pub(crate) const INIT_DELAY: Duration = Duration::from_millis(10);
pub(crate) const SETTLE_DELAY: Duration = Duration::from_millis(100);
pub(crate) const POLL_DELAY: Duration = Duration::from_millis(20);

const STATUS_BUSY: u8 = 0b1000_0000;
const STATUS_CALIBRATED: u8 = 0b0000_1000;

/// Divisor for converting 20-bit raw values into a fraction of the measurement range (2^20).
const RAW_SCALE: f64 = 1_048_576.0;

/// CRC-8 used by the sensor for the final byte of each measurement frame.
///
/// Polynomial 0x31 (x^8 + x^5 + x^4 + 1) with an initial value of 0xFF, no
/// reflection, and no final XOR.
const AHT20_CRC: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0xFF,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xF7,
    residue: 0x00,
};

const CRC_COMPUTER: Crc<u8> = Crc::<u8>::new(&AHT20_CRC);

/// Compute the checksum the sensor is expected to send for the given status and data bytes.
pub(crate) fn frame_checksum(bytes: &[u8]) -> u8 {
    CRC_COMPUTER.checksum(bytes)
}

/// Status byte sent as the first byte of each measurement frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Status(u8);

impl Status {
    /// Bit 7 is set while the sensor is still converting a measurement.
    pub(crate) fn is_busy(self) -> bool {
        self.0 & STATUS_BUSY != 0
    }

    /// Bit 3 is set once the sensor has loaded its calibration coefficients.
    pub(crate) fn is_calibrated(self) -> bool {
        self.0 & STATUS_CALIBRATED != 0
    }
}

/// Bytes read from the sensor after a measurement has been triggered.
///
/// One status byte, five bytes holding a 20-bit humidity value followed by a 20-bit
/// temperature value, and a CRC of the preceding six bytes.
#[derive(Debug)]
struct Frame {
    bytes: [u8; FRAME_SIZE],
}

impl Frame {
    fn status(&self) -> Status {
        Status(self.bytes[0])
    }

    fn checksum(&self) -> Result<(), SensorError> {
        let expected = self.bytes[FRAME_SIZE - 1];
        let computed = frame_checksum(&self.bytes[..FRAME_SIZE - 1]);

        tracing::debug!(
            message = "computing checksum for sensor data",
            computed = computed,
            expected = expected
        );

        if computed != expected {
            Err(SensorError::CheckSum(expected, computed))
        } else {
            Ok(())
        }
    }

    fn humidity_raw(&self) -> u32 {
        // Humidity occupies the first 20 bits: two full bytes and the high nibble
        // of the byte it shares with the temperature.
        (self.bytes[1] as u32) << 12 | (self.bytes[2] as u32) << 4 | (self.bytes[3] as u32) >> 4
    }

    fn temperature_raw(&self) -> u32 {
        // Temperature starts with the low nibble of the shared byte, followed by two full bytes.
        ((self.bytes[3] & 0x0F) as u32) << 16 | (self.bytes[4] as u32) << 8 | self.bytes[5] as u32
    }
}

impl TryFrom<Frame> for SensorReading {
    type Error = SensorError;

    /// Convert a checksum-verified frame into temperature and humidity measurements.
    ///
    /// See section 6 of the datasheet for the conversion formulas.
    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let humidity_raw = frame.humidity_raw();
        let temp_raw = frame.temperature_raw();

        let humidity = Humidity::from(humidity_raw as f64 / RAW_SCALE * 100.0);
        let temperature = TemperatureCelsius::from(temp_raw as f64 / RAW_SCALE * 200.0 - 50.0);

        tracing::debug!(
            message = "parsed sensor data",
            raw_temperature = temp_raw,
            raw_humidity = humidity_raw,
            temperature = %temperature,
            humidity = %humidity
        );

        SensorReading::checked(temperature, humidity)
    }
}

/// Sensor state before the initialization command has been sent.
#[derive(Debug)]
pub struct Uninitialized;

/// Sensor state after a successful initialization, measurements may be taken.
#[derive(Debug)]
pub struct Initialized;

/// Read temperature in degrees celsius and relative humidity from an AHT20 sensor
///
/// The sensor must be initialized before it can be measured, which is enforced by
/// `measure` only being available on `AHT20Sensor<Initialized>`.
pub struct AHT20Sensor<S> {
    bus: Box<dyn Bus + Send + 'static>,
    clock: Box<dyn Clock + Send + 'static>,
    state: PhantomData<S>,
}

impl AHT20Sensor<Uninitialized> {
    pub fn new<B, C>(bus: B, clock: C) -> Self
    where
        B: Bus + Send + 'static,
        C: Clock + Send + 'static,
    {
        Self {
            bus: Box::new(bus),
            clock: Box::new(clock),
            state: PhantomData,
        }
    }

    /// Send the initialization command to the sensor, causing it to load its
    /// calibration coefficients.
    ///
    /// The sensor needs 40ms after power up before it accepts commands so this
    /// method waits for whatever part of that hasn't already elapsed according to
    /// the clock. After the command is sent, another 10ms wait is required before
    /// the sensor can be measured.
    ///
    /// The command is sent once. If it fails, the uninitialized sensor can be
    /// recovered from the error to retry.
    pub fn initialize(mut self) -> Result<AHT20Sensor<Initialized>, InitError> {
        let waited = self.clock.elapsed();
        if waited < POWER_UP_DELAY {
            self.clock.sleep(POWER_UP_DELAY - waited);
        }

        if let Err(e) = self.bus.write(SENSOR_ADDRESS, &INIT_COMMAND) {
            return Err(InitError { sensor: self, error: e });
        }

        self.clock.sleep(INIT_DELAY);
        tracing::debug!(message = "sent initialization command", address = SENSOR_ADDRESS);

        Ok(AHT20Sensor {
            bus: self.bus,
            clock: self.clock,
            state: PhantomData,
        })
    }
}

impl AHT20Sensor<Initialized> {
    /// Trigger a measurement and read the result after it has had time to complete.
    ///
    /// A `Busy` error is returned if the sensor reports it hasn't finished the
    /// measurement, in which case none of the data bytes are examined. The sensor
    /// may be measured again after any error.
    pub fn measure(&mut self) -> Result<SensorReading, SensorError> {
        self.trigger()?;
        let frame = self.read_frame()?;
        let status = frame.status();

        if status.is_busy() {
            return Err(SensorError::KindMsg(
                SensorErrorKind::Busy,
                "sensor busy, measurement not ready",
            ));
        }

        Self::decode(frame, status)
    }

    /// Trigger a measurement and poll for the result, reading the frame up to
    /// `attempts` times while the sensor reports it is busy.
    ///
    /// The first read happens after the same settle time as `measure` and the frame
    /// is always read at least once, even if `attempts` is zero. A `Timeout` error is
    /// returned if the sensor is still busy after the final attempt.
    pub fn measure_polled(&mut self, attempts: u32) -> Result<SensorReading, SensorError> {
        let attempts = attempts.max(1);
        self.trigger()?;

        for attempt in 1..=attempts {
            let frame = self.read_frame()?;
            let status = frame.status();

            if !status.is_busy() {
                return Self::decode(frame, status);
            }

            tracing::debug!(message = "sensor busy, polling again", attempt = attempt, attempts = attempts);
            if attempt < attempts {
                self.clock.sleep(POLL_DELAY);
            }
        }

        Err(SensorError::KindMsg(
            SensorErrorKind::Timeout,
            "timeout waiting for sensor measurement",
        ))
    }

    fn trigger(&mut self) -> Result<(), SensorError> {
        self.bus.write(SENSOR_ADDRESS, &TRIGGER_COMMAND)?;
        // Typical conversion time is 80ms, don't read before it's had time to finish
        self.clock.sleep(SETTLE_DELAY);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, SensorError> {
        let mut bytes = [0; FRAME_SIZE];
        self.bus.read(SENSOR_ADDRESS, &mut bytes)?;

        tracing::trace!(message = "read measurement frame", bytes = ?bytes);
        Ok(Frame { bytes })
    }

    fn decode(frame: Frame, status: Status) -> Result<SensorReading, SensorError> {
        // Status bits can't be trusted until the frame checksum has been verified
        frame.checksum()?;

        if !status.is_calibrated() {
            tracing::warn!(message = "sensor reports it is not calibrated", status = status.0);
        }

        SensorReading::try_from(frame)
    }
}

impl<S> Debug for AHT20Sensor<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AHT20Sensor")
            .field("address", &SENSOR_ADDRESS)
            .field("state", &std::any::type_name::<S>())
            .finish()
    }
}

/// Error initializing the sensor.
///
/// The uninitialized sensor is returned as part of the error so that initialization
/// can be retried by the caller.
pub struct InitError {
    sensor: AHT20Sensor<Uninitialized>,
    error: SensorError,
}

impl InitError {
    pub fn error(&self) -> &SensorError {
        &self.error
    }

    pub fn into_inner(self) -> AHT20Sensor<Uninitialized> {
        self.sensor
    }
}

impl Debug for InitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitError").field("error", &self.error).finish()
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "unable to initialize sensor: {}", self.error)
    }
}

impl Error for InitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.error)
    }
}
