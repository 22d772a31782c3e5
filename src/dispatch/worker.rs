//! Per-track frame dispatcher

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::analysis::AnalysisWorker;
use super::frame::{Frame, PositionSample};
use super::ledger::PositionLedger;
use crate::engine::FrameFeed;
use crate::error::Result;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Counters reported when a dispatcher stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub analyzed: u64,
    pub absent: u64,
    pub failed: u64,
    /// Frames replaced in the feed before the dispatcher got to them
    pub skipped: u64,
}

/// Feeds one track's frames through the analysis worker into the ledger,
/// one frame at a time and in sequence order
pub struct FrameDispatcher {
    ledger: Arc<PositionLedger>,
    worker: AnalysisWorker,
    last_sequence: u64,
    stats: DispatchStats,
    throttler: LogThrottler,
}

impl FrameDispatcher {
    pub fn new(ledger: Arc<PositionLedger>, worker: AnalysisWorker) -> Self {
        Self {
            ledger,
            worker,
            last_sequence: 0,
            stats: DispatchStats::default(),
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Analyze `frame` and record the result before returning.
    ///
    /// Returns the recorded sample, or `None` if the frame was stale or the
    /// analysis failed. Analysis failures are logged and never propagate.
    pub async fn process(
        &mut self,
        frame: Frame,
        cancel: &CancellationToken,
    ) -> Result<Option<PositionSample>> {
        if frame.sequence <= self.last_sequence {
            debug!(
                "Dropping frame #{} (already at #{})",
                frame.sequence, self.last_sequence
            );
            return Ok(None);
        }
        let gap = frame.sequence - self.last_sequence - 1;
        if gap > 0 {
            self.stats.skipped += gap;
            trace!("Skipped {} frame(s) before #{}", gap, frame.sequence);
        }
        self.last_sequence = frame.sequence;

        let sequence = frame.sequence;
        trace!("Analyzing frame #{} ({:?} after arrival)", sequence, frame.age());
        let position = match self.worker.analyze(frame.pixels, cancel).await {
            Ok(position) => position,
            Err(e) => {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                self.stats.failed += 1;
                warn_throttled!(
                    self.throttler,
                    "analysis",
                    "Frame #{} not recorded: {}",
                    sequence,
                    e
                );
                return Ok(None);
            }
        };

        let sample = PositionSample {
            sequence,
            position,
        };
        if self.ledger.record(sample) {
            self.stats.analyzed += 1;
            if sample.is_absent() {
                self.stats.absent += 1;
            }
            info!("Received frame {}", sample);
            Ok(Some(sample))
        } else {
            Ok(None)
        }
    }

    /// Drain `feed` until it ends or `cancel` fires.
    ///
    /// The feed holds a single frame; whatever arrives while an analysis is
    /// running replaces the pending frame, so the next iteration always picks
    /// up the newest one.
    pub async fn run(mut self, mut feed: FrameFeed, cancel: CancellationToken) -> DispatchStats {
        info!("Frame dispatch started for track {}", feed.track_id);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = feed.frames.changed() => {
                    if changed.is_err() {
                        debug!("Track {} ended", feed.track_id);
                        break;
                    }
                }
            }

            let frame = feed.frames.borrow_and_update().clone();
            let Some(frame) = frame else { continue };
            if let Err(e) = self.process(frame, &cancel).await {
                debug!("Frame dispatch error on {}: {}", feed.track_id, e);
            }
        }

        info!(
            "Frame dispatch stopped for track {}: {} analyzed ({} absent), {} failed, {} skipped",
            feed.track_id,
            self.stats.analyzed,
            self.stats.absent,
            self.stats.failed,
            self.stats.skipped
        );
        self.stats
    }
}
