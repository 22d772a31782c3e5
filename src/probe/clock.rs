use std::time::Duration;

use tokio::time::Instant;

use crate::error::{AppError, Result};

/// Monotonic microsecond clock of one probe.
///
/// The epoch is set by the first ping, which therefore carries timestamp 0.
#[derive(Debug, Default)]
pub struct ProbeClock {
    epoch: Option<Instant>,
}

impl ProbeClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp for a ping about to be sent
    pub fn stamp(&mut self) -> u64 {
        match self.epoch {
            Some(epoch) => micros_since(epoch),
            None => {
                self.epoch = Some(Instant::now());
                0
            }
        }
    }

    /// Current time since the epoch, `None` before the first ping
    pub fn now(&self) -> Option<u64> {
        self.epoch.map(micros_since)
    }

    /// Round trip time of an echo carrying `echoed` received now
    pub fn rtt(&self, echoed: u64) -> Result<Duration> {
        let now = self.now().ok_or_else(|| {
            AppError::ProbeDecode(format!("Echo of {} before any ping was sent", echoed))
        })?;
        rtt_between(echoed, now)
    }
}

/// `received - echoed`, rejecting timestamps from the future
pub fn rtt_between(echoed: u64, received: u64) -> Result<Duration> {
    received
        .checked_sub(echoed)
        .map(Duration::from_micros)
        .ok_or_else(|| {
            AppError::ProbeDecode(format!(
                "Echoed timestamp {} is later than local clock {}",
                echoed, received
            ))
        })
}

fn micros_since(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
}
