//! Offer/answer state machine
//!
//! [`NegotiationSession`] is owned by the negotiation task. It applies
//! descriptions and candidates to the engine, buffers candidates that arrive
//! before the remote description, and returns the messages the caller has to
//! put on the signaling channel. It never touches the channel itself.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::state::{NegotiationState, Role};
use crate::engine::PeerEngine;
use crate::error::{AppError, Result};
use crate::signaling::{IceCandidate, SdpType, SessionDescription, SignalingMessage};

pub struct NegotiationSession {
    role: Role,
    engine: Arc<dyn PeerEngine>,
    state: watch::Sender<NegotiationState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    /// Remote candidates received before the remote description
    pending: VecDeque<IceCandidate>,
    /// Signaling came up; the peer is owed a `Bye` until one is exchanged
    signaling_up: bool,
    bye_received: bool,
    bye_sent: bool,
}

impl NegotiationSession {
    pub fn new(role: Role, engine: Arc<dyn PeerEngine>) -> Self {
        let (state, _) = watch::channel(NegotiationState::Idle);
        Self {
            role,
            engine,
            state,
            local: None,
            remote: None,
            pending: VecDeque::new(),
            signaling_up: false,
            bye_received: false,
            bye_sent: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    /// Observe state changes from other tasks
    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    fn transition(&self, next: NegotiationState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!("Negotiation ({}) {} -> {}", self.role, prev, next);
        }
    }

    fn ensure_active(&self) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(AppError::Negotiation(format!(
                "Negotiation already {}",
                state
            )));
        }
        Ok(())
    }

    /// Move to `Errored`; nothing is processed afterwards
    pub fn fail(&mut self, error: &AppError) {
        if self.state().is_terminal() {
            return;
        }
        warn!("Negotiation ({}) failed: {}", self.role, error);
        self.pending.clear();
        self.transition(NegotiationState::Errored);
    }

    /// Record a successful signaling connect
    pub fn signaling_ready(&mut self) -> Result<()> {
        match self.state() {
            NegotiationState::Idle => {
                self.signaling_up = true;
                self.transition(NegotiationState::SignalingReady);
                Ok(())
            }
            state => Err(AppError::Negotiation(format!(
                "Signaling connected while {}",
                state
            ))),
        }
    }

    /// First step after connect. The offerer creates its offer and returns
    /// it for sending; the answerer has nothing to do yet.
    pub async fn start(&mut self) -> Result<Option<SignalingMessage>> {
        let result = self.start_inner().await;
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    async fn start_inner(&mut self) -> Result<Option<SignalingMessage>> {
        self.ensure_active()?;
        if self.role == Role::Answerer {
            return Ok(None);
        }
        if self.state() != NegotiationState::SignalingReady {
            return Err(AppError::Negotiation(format!(
                "Cannot offer while {}",
                self.state()
            )));
        }

        let offer = self.engine.create_offer().await?;
        let offer = self.apply_local(offer).await?;
        self.transition(NegotiationState::LocalDescSet);
        Ok(Some(SignalingMessage::SessionDescription(offer)))
    }

    /// Apply one inbound message; returns the messages to send back.
    ///
    /// Any error moves the session to `Errored`.
    pub async fn handle(&mut self, msg: SignalingMessage) -> Result<Vec<SignalingMessage>> {
        let result = self.handle_inner(msg).await;
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    async fn handle_inner(&mut self, msg: SignalingMessage) -> Result<Vec<SignalingMessage>> {
        self.ensure_active()?;
        match msg {
            SignalingMessage::SessionDescription(desc) => match desc.kind {
                SdpType::Offer => self.on_offer(desc).await,
                SdpType::Answer => self.on_answer(desc).await.map(|_| Vec::new()),
            },
            SignalingMessage::Candidate(candidate) => {
                self.on_candidate(candidate).await.map(|_| Vec::new())
            }
            SignalingMessage::Bye => {
                self.on_bye();
                Ok(Vec::new())
            }
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Result<Vec<SignalingMessage>> {
        if self.role != Role::Answerer {
            return Err(AppError::Negotiation("Offerer received an offer".into()));
        }
        if self.remote.is_some() || self.state() != NegotiationState::SignalingReady {
            return Err(AppError::Negotiation(format!(
                "Unexpected second offer while {}",
                self.state()
            )));
        }

        self.apply_remote(offer).await?;
        self.transition(NegotiationState::RemoteDescSet);

        let answer = self.engine.create_answer().await?;
        let answer = self.apply_local(answer).await?;
        self.transition(NegotiationState::LocalDescSet);
        self.transition(NegotiationState::Established);
        Ok(vec![SignalingMessage::SessionDescription(answer)])
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.role != Role::Offerer {
            return Err(AppError::Negotiation("Answerer received an answer".into()));
        }
        if self.state() != NegotiationState::LocalDescSet || self.remote.is_some() {
            return Err(AppError::Negotiation(format!(
                "Unexpected answer while {}",
                self.state()
            )));
        }

        self.apply_remote(answer).await?;
        self.transition(NegotiationState::Established);
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        candidate.validate()?;
        if self.remote.is_none() {
            debug!(
                "Buffering remote candidate until the remote description arrives ({} pending)",
                self.pending.len() + 1
            );
            self.pending.push_back(candidate);
            return Ok(());
        }
        self.engine.add_ice_candidate(candidate).await
    }

    fn on_bye(&mut self) {
        info!("Peer ended the negotiation");
        self.bye_received = true;
        self.pending.clear();
        self.transition(NegotiationState::Closed);
    }

    async fn apply_local(&mut self, desc: SessionDescription) -> Result<SessionDescription> {
        if self.local.is_some() {
            return Err(AppError::Negotiation(
                "Local description already set".into(),
            ));
        }
        let announced = self.engine.set_local_description(desc).await?;
        self.local = Some(announced.clone());
        Ok(announced)
    }

    /// Set the remote description, then apply every buffered candidate in
    /// arrival order
    async fn apply_remote(&mut self, desc: SessionDescription) -> Result<()> {
        self.engine.set_remote_description(desc.clone()).await?;
        self.remote = Some(desc);

        if !self.pending.is_empty() {
            debug!("Applying {} buffered candidate(s)", self.pending.len());
        }
        while let Some(candidate) = self.pending.pop_front() {
            self.engine.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Wrap a locally gathered candidate for sending, unless the session is
    /// over
    pub fn local_candidate(&self, candidate: IceCandidate) -> Option<SignalingMessage> {
        if self.state().is_connected() {
            Some(SignalingMessage::Candidate(candidate))
        } else {
            None
        }
    }

    /// End the session locally. Returns `Bye` when the peer still needs to
    /// be told, including after a failure. Calling it again returns `None`.
    pub fn close(&mut self) -> Option<SignalingMessage> {
        if !self.state().is_terminal() {
            self.pending.clear();
            self.transition(NegotiationState::Closed);
        }

        if self.signaling_up && !self.bye_received && !self.bye_sent {
            self.bye_sent = true;
            Some(SignalingMessage::Bye)
        } else {
            None
        }
    }
}
