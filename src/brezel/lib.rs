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

//! Report AHT20 temperature and humidity sensor readings over a serial link.
//!
//! ## Features
//!
//! Brezel reads temperature and humidity information from an [AHT20 sensor](https://learn.adafruit.com/adafruit-aht20)
//! connected via I2C and writes each reading as a single line of text to a serial port (or standard
//! output). It is best run on a Raspberry PI (3 or 4).
//!
//! The sensor is read every five minutes. Each successful reading is written as a line like the
//! one below, with temperature in degrees celsius and relative humidity from 0 to 100, both with
//! exactly two fractional digits.
//!
//! ```text
//! TEMP:23.50,HUMIDITY:65.20
//! ```
//!
//! Failed readings are logged (to standard error) and skipped, nothing is written to the serial
//! port for them. The only failure that stops `brezel` is being unable to initialize the sensor
//! at startup.
//!
//! Optionally, the following Prometheus metrics can be exposed over HTTP:
//!
//! * `brezel_temperature_degrees` - Degrees celsius measured by the sensor.
//! * `brezel_relative_humidity` - Relative humidity (from 0 to 100) measured by the sensor.
//! * `brezel_last_read_timestamp` - UNIX timestamp of the last time the sensor was correctly read.
//! * `brezel_collections_total` - Total number of attempts to read the sensor.
//! * `brezel_errors_total` - Total errors by type while trying to read and report the sensor.
//!
//! ## Build
//!
//! `brezel` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/).
//! Since it's meant to be run on a Raspberry PI, you will also likely need to cross-compile it. If you
//! are on Ubuntu GNU/Linux, you'll need the following packages installed for this.
//!
//! ```text
//! apt-get install gcc-arm-linux-gnueabihf musl-tools
//! ```
//!
//! Next, make sure you have a Rust toolchain for ARMv7, assuming you are using the `rustup` tool.
//!
//! ```text
//! rustup target add armv7-unknown-linux-musleabihf
//! ```
//!
//! Next, you'll need to build `brezel` itself for ARMv7.
//!
//! ```text
//! cargo build --release --target armv7-unknown-linux-musleabihf
//! ```
//!
//! ## Install
//!
//! ### I2C
//!
//! The sensor must be connected to the I2C pins of your Raspberry PI (SDA on GPIO 2, SCL on GPIO 3)
//! and I2C must be enabled, using `raspi-config` or by adding `dtparam=i2c_arm=on` to
//! `/boot/config.txt`. This creates the device `/dev/i2c-1` which `brezel` uses by default.
//!
//! ### Run
//!
//! ```text
//! brezel --serial /dev/serial0 --baud-rate 115200
//! ```
//!
//! Without `--serial`, readings are written to standard output. To expose Prometheus metrics on
//! port `9782` at `/metrics`, add `--bind 0.0.0.0:9782`.
//!

pub mod http;
pub mod metrics;
pub mod report;
pub mod sensor;
pub mod shutdown;
