//! In-band latency probe
//!
//! Carried over the low-latency data channel once the session is
//! established. The issuer sends `send <µs>` pings; the responder replies
//! with its most recent position sample and the ping's timestamp text; the
//! issuer subtracts that timestamp from its own clock to get the RTT.

pub mod clock;
pub mod codec;
pub mod prober;

pub use clock::ProbeClock;
pub use codec::{EchoMessage, PingMessage, ProbeMessage, ProbeTimestamp};
pub use prober::{ProbeEvent, ProbeStats, Prober, RttSample};
