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

use brezel::http::{http_route, RequestContext};
use brezel::metrics::{MetricsExposition, ReportMetrics};
use brezel::report::{open_serial, ByteSink, Reporter, ReportingLoop, WriteSink, REPORT_INTERVAL};
use brezel::sensor::{open_bus, AHT20Sensor, SystemClock};
use brezel::shutdown::Shutdown;
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use prometheus::process_collector::ProcessCollector;
use prometheus::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::{io, process};
use tokio::task;
use tracing::{Instrument, Level};

const DEFAULT_I2C_BUS: u8 = 1;
const DEFAULT_BAUD_RATE: u32 = 115_200;
const DEFAULT_LOG_LEVEL: Level = Level::INFO;

/// Report temperature and humidity from an AHT20 sensor over a serial link
///
/// Read temperature and humidity data from an AHT20 sensor connected to the I2C
/// bus of a local machine, usually a Raspberry PI, every five minutes and write
/// each reading as a line of text to a serial port. Lines look like
/// `TEMP:23.50,HUMIDITY:65.20`.
///
/// Log messages are written to standard error so that standard output can be
/// used in place of a serial port.
#[derive(Debug, Parser)]
#[clap(name = "brezel", version = clap::crate_version ! ())]
struct BrezelApplication {
    /// I2C bus number the AHT20 sensor is connected to, e.g. 1 for /dev/i2c-1
    #[arg(long, default_value_t = DEFAULT_I2C_BUS)]
    i2c_bus: u8,

    /// Serial device to write readings to. If not set, readings are written to
    /// standard output
    #[arg(long)]
    serial: Option<PathBuf>,

    /// Baud rate of the serial device
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud_rate: u32,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[arg(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to expose Prometheus metrics on, at `/metrics`. Metrics are not exposed
    /// if this is not set
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = BrezelApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .with_writer(io::stderr)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    // Treat startup as the time the sensor was powered on so that initialization
    // waits for the sensor to be ready when started at boot.
    let clock = SystemClock::new();

    let bus = open_bus(opts.i2c_bus).unwrap_or_else(|e| {
        tracing::error!(message = "failed to open I2C bus", i2c_bus = opts.i2c_bus, error = %e);
        process::exit(1)
    });

    let sink: Box<dyn ByteSink + Send> = match &opts.serial {
        Some(path) => Box::new(open_serial(path, opts.baud_rate).unwrap_or_else(|e| {
            tracing::error!(message = "failed to open serial device", path = %path.display(), error = %e);
            process::exit(1)
        })),
        None => Box::new(WriteSink::new(io::stdout())),
    };

    let registry = Registry::new();
    let metrics = ReportMetrics::new(&registry).unwrap_or_else(|e| {
        tracing::error!(message = "failed to register report metrics", error = %e);
        process::exit(1)
    });

    registry
        .register(Box::new(ProcessCollector::for_self()))
        .unwrap_or_else(|e| {
            tracing::error!(message = "failed to register process metrics", error = %e);
            process::exit(1)
        });

    let sensor = task::spawn_blocking(move || AHT20Sensor::new(bus, clock).initialize())
        .instrument(tracing::span!(Level::DEBUG, "sensor_init"))
        .await?
        .unwrap_or_else(|e| {
            tracing::error!(message = "failed to initialize sensor", i2c_bus = opts.i2c_bus, error = %e);
            process::exit(1)
        });

    if let Some(bind) = opts.bind {
        let context = Arc::new(RequestContext::new(MetricsExposition::new(registry.clone())));
        let service = make_service_fn(move |_| {
            let context = context.clone();

            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    http_route(req, context.clone()).instrument(tracing::span!(Level::DEBUG, "brezel_request"))
                }))
            }
        });

        let server = Server::try_bind(&bind).unwrap_or_else(|e| {
            tracing::error!(message = "error starting metrics server", address = %bind, err = %e);
            process::exit(1)
        });

        tracing::info!(message = "starting metrics server", address = %bind);
        task::spawn(async move {
            if let Err(e) = server.serve(service).await {
                tracing::error!(message = "metrics server failed", address = %bind, err = %e);
            }
        });
    }

    tracing::info!(
        message = "sensor initialized, starting measurements",
        interval_secs = REPORT_INTERVAL.as_secs()
    );

    let mut shutdown = Shutdown::new().unwrap_or_else(|e| {
        tracing::error!(message = "failed to register signal handlers", error = %e);
        process::exit(1)
    });

    let mut reporting = ReportingLoop::new(sensor, Reporter::new(sink, metrics));

    loop {
        // Move the loop onto a blocking thread for the cycle and take it back after, the
        // sensor and serial port are only ever used from one place at a time.
        let (returned, _) = task::spawn_blocking(move || {
            let res = reporting.cycle();
            (reporting, res)
        })
        .instrument(tracing::span!(Level::DEBUG, "sensor_cycle"))
        .await?;

        reporting = returned;

        // A SIGTERM or SIGINT received during the cycle ends the loop here without waiting
        tokio::select! {
            _ = tokio::time::sleep(REPORT_INTERVAL) => {}
            _ = shutdown.recv() => break,
        }
    }

    tracing::info!("shutdown");
    Ok(())
}
