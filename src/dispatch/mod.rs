//! Frame dispatch and position ledger
//!
//! Each inbound video track gets one [`FrameDispatcher`]. It takes the newest
//! decoded frame from the track's single-slot feed, asks the analysis worker
//! for the object's centroid and writes `ledger[sequence]` before looking at
//! the next frame. The latency probe reads the ledger's most recent entry.

pub mod analysis;
pub mod frame;
pub mod ledger;
pub mod worker;

pub use analysis::{AnalysisWorker, Analyzer};
pub use frame::{Frame, Position, PositionSample};
pub use ledger::PositionLedger;
pub use worker::{DispatchStats, FrameDispatcher};
