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

use crate::report::ReportError;
use crate::sensor::SensorReading;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::time::{SystemTime, UNIX_EPOCH};

/// Collection of Prometheus metrics updated after each attempt to read the AHT20
/// sensor and report the reading. Temperature in degrees celsius and relative
/// humidity will be emitted as gauges.
#[derive(Clone)]
pub struct ReportMetrics {
    temperature: Gauge,
    humidity: Gauge,
    last_reading: Gauge,
    collections: Counter,
    errors: CounterVec,
}

impl ReportMetrics {
    pub fn new(reg: &Registry) -> Result<Self, prometheus::Error> {
        let temperature = Gauge::new("brezel_temperature_degrees", "Temperature in celsius")?;
        let humidity = Gauge::new("brezel_relative_humidity", "Relative humidity (0-100)")?;
        let last_reading = Gauge::new("brezel_last_read_timestamp", "Timestamp of last successful read")?;
        let collections = Counter::new("brezel_collections_total", "Number of attempted reads")?;
        let errors = CounterVec::new(
            Opts::new("brezel_errors_total", "Number of failed reads by type"),
            &["kind"],
        )?;

        reg.register(Box::new(temperature.clone()))?;
        reg.register(Box::new(humidity.clone()))?;
        reg.register(Box::new(last_reading.clone()))?;
        reg.register(Box::new(collections.clone()))?;
        reg.register(Box::new(errors.clone()))?;

        Ok(Self {
            temperature,
            humidity,
            last_reading,
            collections,
            errors,
        })
    }

    pub fn update(&self, result: &Result<SensorReading, ReportError>) {
        self.collections.inc();

        match result {
            Ok(reading) => {
                self.temperature.set(reading.temperature().into());
                self.humidity.set(reading.humidity().into());

                // If we can't get the number of seconds since the epoch, skip the update
                let _ = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| self.last_reading.set(d.as_secs_f64()));
            }
            Err(e) => {
                self.errors.with_label_values(&[e.kind_label()]).inc();
            }
        }
    }
}

/// Wrapper that exposes metrics from a Prometheus registry in the text exposition format.
#[derive(Debug, Clone)]
pub struct MetricsExposition {
    registry: Registry,
}

impl MetricsExposition {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Gather all metrics from the registry and encode them in the Prometheus text
    /// exposition format, returning an error if they couldn't be encoded.
    pub fn encoded_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();

        tracing::debug!(
            message = "encoding metric families to text exposition format",
            num_metrics = metric_families.len(),
        );

        encoder.encode(&metric_families, &mut buffer).map(|_| buffer)
    }
}
