//! Signaling side channel
//!
//! A single persistent reliable stream that shuttles negotiation messages
//! between the two peers:
//!
//! ```text
//! Offerer                         Answerer
//!    |  ---- offer ------------->  |
//!    |  <--- answer -------------  |
//!    |  <--> candidate (trickle)   |
//!    |  ---- bye --------------->  |
//! ```

pub mod channel;
pub mod codec;
pub mod message;

pub use channel::{ChannelState, SignalingChannel};
pub use codec::SignalingCodec;
pub use message::{IceCandidate, SdpType, SessionDescription, SignalingMessage};
