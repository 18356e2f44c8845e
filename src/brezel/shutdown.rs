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


use std::io;
use tokio::signal::unix::{self, Signal, SignalKind};

/// Listener for the signals that end the reporting loop: SIGTERM and SIGINT.
///
/// Both listeners are registered when this is created and stay registered until it
/// is dropped. A signal that arrives while nothing is waiting on `recv`, such as
/// during a sensor cycle, is held and returned by the next call.
#[derive(Debug)]
pub struct Shutdown {
    terminate: Signal,
    interrupt: Signal,
}

impl Shutdown {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            terminate: unix::signal(SignalKind::terminate())?,
            interrupt: unix::signal(SignalKind::interrupt())?,
        })
    }

    /// Return once either SIGTERM or SIGINT has been received by this process.
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.terminate.recv() => tracing::info!(message = "received SIGTERM"),
            _ = self.interrupt.recv() => tracing::info!(message = "received SIGINT"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Shutdown;
    use std::process::Command;
    use std::time::Duration;

    fn send_signal(name: &str) {
        let status = Command::new("kill")
            .arg(format!("-{}", name))
            .arg(std::process::id().to_string())
            .status()
            .unwrap();
        assert!(status.success());
    }

    async fn received(shutdown: &mut Shutdown) -> bool {
        tokio::select! {
            _ = shutdown.recv() => true,
            _ = tokio::time::sleep(Duration::from_secs(5)) => false,
        }
    }

    #[tokio::test]
    async fn test_sigterm_during_cycle_is_kept() {
        let mut shutdown = Shutdown::new().unwrap();

        // Nothing is waiting on the listener while the signal arrives
        send_signal("TERM");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(received(&mut shutdown).await);
    }

    #[tokio::test]
    async fn test_sigint_during_cycle_is_kept() {
        let mut shutdown = Shutdown::new().unwrap();

        send_signal("INT");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(received(&mut shutdown).await);
    }
}
