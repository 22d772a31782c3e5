//! Synthetic bouncing-ball video
//!
//! The offering peer publishes a generated track: a bright disc bouncing
//! around a dark frame. Frames are raw 8-bit luma planes, so the receiving
//! peer can find the disc with [`LumaCentroid`] without a real decoder.

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::SyntheticConfig;
use crate::dispatch::{Analyzer, Position};
use crate::engine::OutboundVideo;
use crate::utils::LogThrottler;
use crate::warn_throttled;

const BACKGROUND: u8 = 0;
const BALL: u8 = 255;

/// One generated frame
#[derive(Debug, Clone)]
pub struct SyntheticFrame {
    /// 1-based frame counter
    pub sequence: u64,
    /// Ball center drawn in this frame
    pub center: Position,
    pub pixels: Bytes,
}

/// Bouncing-ball frame generator
pub struct BouncingBall {
    width: i32,
    height: i32,
    radius: i32,
    x: i32,
    y: i32,
    dx: i32,
    dy: i32,
    sequence: u64,
}

impl BouncingBall {
    pub fn new(config: &SyntheticConfig) -> Self {
        let width = config.width as i32;
        let height = config.height as i32;
        Self {
            width,
            height,
            radius: config.radius as i32,
            x: width / 2,
            y: height / 2,
            dx: config.speed,
            dy: config.speed,
            sequence: 0,
        }
    }

    pub fn center(&self) -> Position {
        Position::new(self.x, self.y)
    }

    /// Advance one step, reflecting off the borders, and render
    pub fn next_frame(&mut self) -> SyntheticFrame {
        if self.sequence > 0 {
            self.step();
        }
        self.sequence += 1;
        SyntheticFrame {
            sequence: self.sequence,
            center: self.center(),
            pixels: self.render(),
        }
    }

    fn step(&mut self) {
        let (x, dx) = reflect(self.x + self.dx, self.dx, self.radius, self.width - 1 - self.radius);
        let (y, dy) = reflect(self.y + self.dy, self.dy, self.radius, self.height - 1 - self.radius);
        self.x = x;
        self.y = y;
        self.dx = dx;
        self.dy = dy;
    }

    fn render(&self) -> Bytes {
        let mut pixels = vec![BACKGROUND; (self.width * self.height) as usize];
        let r2 = self.radius * self.radius;

        let rows = (self.y - self.radius).max(0)..=(self.y + self.radius).min(self.height - 1);
        for py in rows {
            let cols = (self.x - self.radius).max(0)..=(self.x + self.radius).min(self.width - 1);
            for px in cols {
                let (ox, oy) = (px - self.x, py - self.y);
                if ox * ox + oy * oy <= r2 {
                    pixels[(py * self.width + px) as usize] = BALL;
                }
            }
        }
        Bytes::from(pixels)
    }
}

/// Keep `pos` inside `[min, max]`, flipping the velocity on contact
fn reflect(pos: i32, velocity: i32, min: i32, max: i32) -> (i32, i32) {
    if pos < min {
        (min + (min - pos), -velocity)
    } else if pos > max {
        (max - (pos - max), -velocity)
    } else {
        (pos, velocity)
    }
}

/// Centroid of the pixels brighter than a threshold
pub struct LumaCentroid {
    width: usize,
    threshold: u8,
}

impl LumaCentroid {
    pub fn new(width: u32, threshold: u8) -> Self {
        Self {
            width: width.max(1) as usize,
            threshold,
        }
    }

    pub fn from_config(config: &SyntheticConfig) -> Self {
        Self::new(config.width, config.threshold)
    }
}

impl Analyzer for LumaCentroid {
    fn analyze(&self, pixels: &Bytes) -> Option<(i32, i32)> {
        if pixels.len() % self.width != 0 {
            trace!(
                "Frame of {} bytes is not a multiple of width {}",
                pixels.len(),
                self.width
            );
            return None;
        }

        let (mut sum_x, mut sum_y, mut count) = (0u64, 0u64, 0u64);
        for (row, line) in pixels.chunks_exact(self.width).enumerate() {
            for (col, &luma) in line.iter().enumerate() {
                if luma > self.threshold {
                    sum_x += col as u64;
                    sum_y += row as u64;
                    count += 1;
                }
            }
        }
        if count == 0 {
            return None;
        }
        let round = |sum: u64| ((sum + count / 2) / count) as i32;
        Some((round(sum_x), round(sum_y)))
    }

    fn name(&self) -> &str {
        "luma-centroid"
    }
}

/// Send generated frames on `video` at its frame rate until cancelled.
/// Returns the number of frames sent.
pub async fn pump(
    mut generator: BouncingBall,
    video: Arc<OutboundVideo>,
    cancel: CancellationToken,
) -> u64 {
    let mut ticker = tokio::time::interval(video.frame_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let throttler = LogThrottler::with_secs(5);
    let mut sent = 0u64;

    info!("Synthetic video started ({:?} per frame)", video.frame_duration());
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let frame = generator.next_frame();
        match video.write_frame(frame.pixels).await {
            Ok(()) => {
                sent += 1;
                debug!(
                    "Sent frame #{} ball at ({}, {})",
                    frame.sequence, frame.center.x, frame.center.y
                );
            }
            Err(e) => {
                warn_throttled!(throttler, "write", "Frame #{} not sent: {}", frame.sequence, e);
            }
        }
    }
    info!("Synthetic video stopped after {} frames", sent);
    sent
}
