//! ballrtc - peer session negotiation with an in-band latency probe
//!
//! Two peers agree on a media session over a TCP signaling channel, stream
//! a synthetic video track one way, record where the receiver located the
//! target in each frame, and measure round-trip latency over a data channel
//! whose echoes carry the latest recorded position.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod negotiation;
pub mod probe;
pub mod session;
pub mod signaling;
pub mod synthetic;
pub mod utils;

#[cfg(test)]
pub mod testing;

pub use error::{AppError, Result};
