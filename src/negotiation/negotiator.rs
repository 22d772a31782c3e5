//! Negotiation task
//!
//! Owns the [`NegotiationSession`] and the signaling channel and is the only
//! code that touches either. Inbound signaling messages and locally gathered
//! candidates are handled one at a time, so the session never sees two
//! messages concurrently.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::NegotiationSession;
use super::state::NegotiationState;
use crate::error::{AppError, Result};
use crate::signaling::{IceCandidate, SignalingChannel, SignalingMessage};

/// Why [`Negotiator::run`] returned
#[derive(Debug)]
pub enum NegotiationEnd {
    /// Local shutdown requested
    Cancelled,
    /// Peer sent `Bye`
    PeerBye,
    /// Fatal signaling or negotiation error
    Failed(AppError),
}

pub struct Negotiator<S> {
    session: NegotiationSession,
    channel: SignalingChannel<S>,
}

impl<S> Negotiator<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Pair a session with its connected channel (`Idle -> SignalingReady`)
    pub fn new(mut session: NegotiationSession, channel: SignalingChannel<S>) -> Result<Self> {
        session.signaling_ready()?;
        Ok(Self { session, channel })
    }

    pub fn state(&self) -> NegotiationState {
        self.session.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.session.subscribe()
    }

    pub fn session(&self) -> &NegotiationSession {
        &self.session
    }

    pub fn channel(&self) -> &SignalingChannel<S> {
        &self.channel
    }

    async fn send_all(&mut self, messages: Vec<SignalingMessage>) -> Result<()> {
        for msg in messages {
            self.channel.send(msg).await?;
        }
        Ok(())
    }

    /// Drive the exchange until the peer says bye, an error occurs or
    /// `cancel` fires. The negotiator is handed back so the caller can shut
    /// the session and channel down at the right point of the teardown.
    pub async fn run(
        mut self,
        mut local_candidates: mpsc::UnboundedReceiver<IceCandidate>,
        cancel: CancellationToken,
    ) -> (Self, NegotiationEnd) {
        let end = self.drive(&mut local_candidates, &cancel).await;
        match &end {
            NegotiationEnd::Failed(e) => {
                self.session.fail(e);
                warn!("Negotiation stopped: {}", e);
            }
            NegotiationEnd::PeerBye => info!("Negotiation ended by peer"),
            NegotiationEnd::Cancelled => debug!("Negotiation task cancelled"),
        }
        (self, end)
    }

    async fn drive(
        &mut self,
        local_candidates: &mut mpsc::UnboundedReceiver<IceCandidate>,
        cancel: &CancellationToken,
    ) -> NegotiationEnd {
        match self.session.start().await {
            Ok(Some(offer)) => {
                if let Err(e) = self.channel.send(offer).await {
                    return NegotiationEnd::Failed(e);
                }
            }
            Ok(None) => {}
            Err(e) => return NegotiationEnd::Failed(e),
        }

        let mut candidates_open = true;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return NegotiationEnd::Cancelled,
                candidate = local_candidates.recv(), if candidates_open => {
                    let Some(candidate) = candidate else {
                        candidates_open = false;
                        continue;
                    };
                    if let Some(msg) = self.session.local_candidate(candidate) {
                        if let Err(e) = self.channel.send(msg).await {
                            return NegotiationEnd::Failed(e);
                        }
                    }
                }
                received = self.channel.receive() => {
                    let msg = match received {
                        Ok(msg) => msg,
                        Err(e) => return NegotiationEnd::Failed(e),
                    };
                    let is_bye = msg == SignalingMessage::Bye;
                    let replies = match self.session.handle(msg).await {
                        Ok(replies) => replies,
                        Err(e) => return NegotiationEnd::Failed(e),
                    };
                    if is_bye {
                        return NegotiationEnd::PeerBye;
                    }
                    if let Err(e) = self.send_all(replies).await {
                        return NegotiationEnd::Failed(e);
                    }
                }
            }
        }
    }

    /// Close the negotiation, telling the peer `Bye` if the channel is
    /// still up. Idempotent.
    pub async fn close_negotiation(&mut self) {
        if let Some(bye) = self.session.close() {
            if self.channel.is_open() {
                if let Err(e) = self.channel.send(bye).await {
                    debug!("Could not deliver bye: {}", e);
                }
            }
        }
    }

    /// Release the signaling stream. Idempotent.
    pub async fn close_channel(&mut self) -> Result<()> {
        self.channel.close().await
    }
}
