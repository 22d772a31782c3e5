//! Offer/answer negotiation
//!
//! [`NegotiationSession`] is the state machine; [`Negotiator`] is the task
//! that feeds it from the signaling channel and writes its replies back.

pub mod negotiator;
pub mod session;
pub mod state;

pub use negotiator::{NegotiationEnd, Negotiator};
pub use session::NegotiationSession;
pub use state::{NegotiationState, Role};
