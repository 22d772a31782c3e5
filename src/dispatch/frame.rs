//! Frame and position data structures

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// A decoded frame with metadata
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame sequence number (1-based, per track)
    pub sequence: u64,
    /// Decoded pixel buffer, opaque to the core
    pub pixels: Bytes,
    /// Time the frame arrived from the engine
    pub arrival: Instant,
}

impl Frame {
    pub fn new(sequence: u64, pixels: Bytes) -> Self {
        Self {
            sequence,
            pixels,
            arrival: Instant::now(),
        }
    }

    /// Time since arrival
    pub fn age(&self) -> std::time::Duration {
        self.arrival.elapsed()
    }
}

/// Centroid of the detected region, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for Position {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

/// Analysis result for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSample {
    pub sequence: u64,
    /// `None` when the analysis found no target
    pub position: Option<Position>,
}

impl PositionSample {
    pub fn found(sequence: u64, position: impl Into<Position>) -> Self {
        Self {
            sequence,
            position: Some(position.into()),
        }
    }

    pub fn absent(sequence: u64) -> Self {
        Self {
            sequence,
            position: None,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.position.is_none()
    }
}

impl std::fmt::Display for PositionSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.position {
            Some(p) => write!(f, "#{} ({}, {})", self.sequence, p.x, p.y),
            None => write!(f, "#{} (no target)", self.sequence),
        }
    }
}
