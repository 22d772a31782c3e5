//! Peer session supervisor
//!
//! [`PeerSession`] wires the components together for one peer:
//!
//! - the negotiation task exchanges descriptions and candidates over the
//!   signaling channel;
//! - engine events are routed as they arrive: local candidates to the
//!   negotiation task, the first inbound video track to a frame dispatcher,
//!   the data channel to the latency probe once negotiation is established;
//! - the session ends on local shutdown, on the peer's `Bye`, or on a fatal
//!   error, and always goes through [`Lifecycle::teardown`].

pub mod lifecycle;

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::dispatch::{AnalysisWorker, Analyzer, DispatchStats, FrameDispatcher, PositionLedger};
use crate::engine::{ConnectionState, EngineEvent, EngineEvents, FrameFeed, PeerEngine, ProbeLink};
use crate::error::{AppError, Result};
use crate::negotiation::{NegotiationEnd, NegotiationSession, NegotiationState, Negotiator, Role};
use crate::probe::{ProbeEvent, Prober};
use crate::signaling::{IceCandidate, SignalingChannel};

pub use lifecycle::{Lifecycle, TeardownReport, TeardownStep};

/// How a session ended without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown requested through a [`ShutdownHandle`]
    LocalShutdown,
    /// Peer sent `Bye`
    PeerBye,
}

/// Summary of a finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub end: SessionEnd,
    /// Ledger entries recorded before teardown cleared the ledger
    pub positions_recorded: usize,
    pub teardown: TeardownReport,
}

/// Requests shutdown of a running session. Cheap to clone; calling
/// [`ShutdownHandle::shutdown`] more than once has no further effect.
#[derive(Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Session shutdown requested");
            self.token.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

type SourceFactory = Box<dyn FnOnce(CancellationToken) -> futures::future::BoxFuture<'static, u64> + Send>;

/// One peer's session
pub struct PeerSession {
    config: AppConfig,
    engine: Arc<dyn PeerEngine>,
    events: EngineEvents,
    analyzer: Arc<dyn Analyzer>,
    ledger: Arc<PositionLedger>,
    negotiation: Option<NegotiationSession>,
    state_rx: watch::Receiver<NegotiationState>,
    probe_tx: mpsc::UnboundedSender<ProbeEvent>,
    probe_rx: Option<mpsc::UnboundedReceiver<ProbeEvent>>,
    shutdown: CancellationToken,
    source: Option<SourceFactory>,
}

impl PeerSession {
    pub fn new(
        config: AppConfig,
        engine: Arc<dyn PeerEngine>,
        events: EngineEvents,
        analyzer: Arc<dyn Analyzer>,
    ) -> Self {
        let negotiation = NegotiationSession::new(config.role, engine.clone());
        let state_rx = negotiation.subscribe();
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        Self {
            config,
            engine,
            events,
            analyzer,
            ledger: Arc::new(PositionLedger::new()),
            negotiation: Some(negotiation),
            state_rx,
            probe_tx,
            probe_rx: Some(probe_rx),
            shutdown: CancellationToken::new(),
            source: None,
        }
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// Negotiation state updates
    pub fn state_watch(&self) -> watch::Receiver<NegotiationState> {
        self.state_rx.clone()
    }

    pub fn ledger(&self) -> Arc<PositionLedger> {
        self.ledger.clone()
    }

    /// RTT samples, answered pings and decode failures. Can be taken once.
    pub fn take_probe_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProbeEvent>> {
        self.probe_rx.take()
    }

    /// Register an outbound media source, started with the session and
    /// stopped with frame dispatch. `make` receives the stop token and
    /// returns a future resolving to the number of frames sent.
    pub fn with_source<F, Fut>(mut self, make: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = u64> + Send + 'static,
    {
        self.source = Some(Box::new(move |cancel| Box::pin(make(cancel))));
        self
    }

    /// Connect the signaling channel for this peer's role, then run.
    pub async fn connect_and_run(self) -> Result<SessionReport> {
        let role = self.config.role;
        let connected = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            result = SignalingChannel::<TcpStream>::connect(&self.config.signaling, role) => Some(result),
        };

        match connected {
            Some(Ok(channel)) => self.run(channel).await,
            Some(Err(e)) => {
                warn!("Signaling connect failed: {}", e);
                self.release_engine().await;
                Err(e)
            }
            None => {
                self.release_engine().await;
                Ok(SessionReport {
                    end: SessionEnd::LocalShutdown,
                    positions_recorded: 0,
                    teardown: TeardownReport::default(),
                })
            }
        }
    }

    async fn release_engine(&self) {
        if let Err(e) = self.engine.close().await {
            warn!("Failed to release transport engine: {}", e);
        }
    }

    /// Run the session over an already connected signaling channel.
    ///
    /// Returns once the session has ended and been torn down. Fatal errors
    /// are returned after teardown.
    pub async fn run<S>(mut self, channel: SignalingChannel<S>) -> Result<SessionReport>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let role = self.config.role;
        let mut lifecycle = Lifecycle::<S>::new(self.engine.clone());

        let Some(negotiation) = self.negotiation.take() else {
            lifecycle.teardown().await;
            return Err(AppError::Negotiation("Session already ran".into()));
        };
        let negotiator = match Negotiator::new(negotiation, channel) {
            Ok(negotiator) => negotiator,
            Err(e) => {
                lifecycle.teardown().await;
                return Err(e);
            }
        };
        info!("Session started as {} with {}", role, negotiator.channel().peer());

        if let Some(make) = self.source.take() {
            lifecycle.spawn_source(make);
        }

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let negotiation_cancel = CancellationToken::new();
        let mut negotiation_task =
            tokio::spawn(negotiator.run(candidate_rx, negotiation_cancel.clone()));

        let (outcome, returned) = self
            .supervise(&mut lifecycle, &mut negotiation_task, candidate_tx)
            .await;
        match returned {
            Some(negotiator) => lifecycle.negotiation_returned(negotiator),
            None => lifecycle.set_negotiation(negotiation_task, negotiation_cancel),
        }

        let positions_recorded = self.ledger.len();
        let teardown = lifecycle.teardown().await;
        self.ledger.clear();

        match outcome {
            Ok(end) => {
                info!("Session ended: {:?}", end);
                Ok(SessionReport {
                    end,
                    positions_recorded,
                    teardown,
                })
            }
            Err(e) => {
                warn!(kind = e.kind(), "Session failed: {}", e);
                Err(e)
            }
        }
    }

    /// Route engine events until the session ends. When the negotiation
    /// task itself finished, its negotiator is handed back.
    async fn supervise<S>(
        &mut self,
        lifecycle: &mut Lifecycle<S>,
        negotiation_task: &mut JoinHandle<(Negotiator<S>, NegotiationEnd)>,
        candidates: mpsc::UnboundedSender<IceCandidate>,
    ) -> (Result<SessionEnd>, Option<Negotiator<S>>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut state_rx = self.state_rx.clone();
        let mut pending_link: Option<ProbeLink> = None;
        let mut video_routed = false;
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return (Ok(SessionEnd::LocalShutdown), None),
                joined = &mut *negotiation_task => {
                    let (negotiator, end) = match joined {
                        Ok(returned) => returned,
                        Err(e) => {
                            let e = AppError::Negotiation(format!("Negotiation task failed: {}", e));
                            return (Err(e), None);
                        }
                    };
                    let outcome = match end {
                        NegotiationEnd::PeerBye => Ok(SessionEnd::PeerBye),
                        NegotiationEnd::Cancelled => Ok(SessionEnd::LocalShutdown),
                        NegotiationEnd::Failed(e) => Err(e),
                    };
                    return (outcome, Some(negotiator));
                }
                event = self.events.recv(), if events_open => {
                    let Some(event) = event else {
                        debug!("Engine event stream ended");
                        events_open = false;
                        continue;
                    };
                    match event {
                        EngineEvent::LocalCandidate(candidate) => {
                            let _ = candidates.send(candidate);
                        }
                        EngineEvent::Track(feed) => {
                            if video_routed {
                                info!("Ignoring additional video track {}", feed.track_id);
                                lifecycle.spawn_dispatch(|cancel| drain(feed, cancel));
                            } else {
                                video_routed = true;
                                self.start_dispatch(lifecycle, feed);
                            }
                        }
                        EngineEvent::DataChannel(link) => {
                            if *state_rx.borrow() == NegotiationState::Established {
                                self.start_probe(lifecycle, link);
                            } else {
                                debug!("Data channel '{}' open before negotiation finished", link.label);
                                pending_link = Some(link);
                            }
                        }
                        EngineEvent::ConnectionState(ConnectionState::Failed) => {
                            let e = AppError::Transport("Peer connection failed".into());
                            return (Err(e), None);
                        }
                        EngineEvent::ConnectionState(state) => {
                            debug!("Peer connection {}", state);
                        }
                    }
                }
                changed = state_rx.changed(), if pending_link.is_some() => {
                    if changed.is_err() {
                        pending_link = None;
                        continue;
                    }
                    let established = *state_rx.borrow_and_update() == NegotiationState::Established;
                    if established {
                        if let Some(link) = pending_link.take() {
                            self.start_probe(lifecycle, link);
                        }
                    }
                }
            }
        }
    }

    fn start_dispatch<S>(&self, lifecycle: &mut Lifecycle<S>, feed: FrameFeed)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let worker = AnalysisWorker::new(
            self.analyzer.clone(),
            self.config.dispatch.analysis_timeout(),
        );
        let dispatcher = FrameDispatcher::new(self.ledger.clone(), worker);
        lifecycle.spawn_dispatch(move |cancel| dispatcher.run(feed, cancel));
    }

    fn start_probe<S>(&self, lifecycle: &mut Lifecycle<S>, link: ProbeLink)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let prober = Prober::new(
            self.ledger.clone(),
            self.config.probe.interval(),
            self.config.probe.issues(self.config.role),
            self.probe_tx.clone(),
        );
        lifecycle.spawn_probe(move |cancel| prober.run(link, cancel));
    }
}

/// Consume a track nobody analyzes
async fn drain(mut feed: FrameFeed, cancel: CancellationToken) -> DispatchStats {
    let mut stats = DispatchStats::default();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = feed.frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let _ = feed.frames.borrow_and_update();
                stats.skipped += 1;
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Framing;
    use crate::dispatch::PositionSample;
    use crate::engine::frame_feed;
    use crate::signaling::SdpType;
    use crate::testing::{probe_link_pair, EngineCall, MockEngine};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    const TEARDOWN_ORDER: [TeardownStep; 5] = [
        TeardownStep::Probe,
        TeardownStep::Dispatch,
        TeardownStep::Negotiation,
        TeardownStep::Signaling,
        TeardownStep::Engine,
    ];

    type SessionTask = JoinHandle<Result<SessionReport>>;

    fn fixed_target(_: &Bytes) -> Option<(i32, i32)> {
        Some((120, 240))
    }

    fn session(role: Role) -> (PeerSession, Arc<MockEngine>) {
        let mut config = AppConfig::default();
        config.role = role;
        config.probe.interval_ms = 20;

        let (engine, events) = MockEngine::with_events();
        let session = PeerSession::new(config, engine.clone(), events, Arc::new(fixed_target));
        (session, engine)
    }

    fn channel(stream: DuplexStream, role: Role) -> SignalingChannel<DuplexStream> {
        SignalingChannel::from_stream(stream, Framing::Lines, 1 << 20, role.to_string())
    }

    async fn wait_established(state: &mut watch::Receiver<NegotiationState>) {
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == NegotiationState::Established),
        )
        .await
        .expect("negotiation did not finish")
        .unwrap();
    }

    /// Run both sessions over an in-memory signaling stream and wait until
    /// both are established
    async fn start_pair(offerer: PeerSession, answerer: PeerSession) -> (SessionTask, SessionTask) {
        let (a, b) = duplex(64 * 1024);
        let mut offerer_state = offerer.state_watch();
        let mut answerer_state = answerer.state_watch();

        let offerer_task = tokio::spawn(offerer.run(channel(a, Role::Offerer)));
        let answerer_task = tokio::spawn(answerer.run(channel(b, Role::Answerer)));

        wait_established(&mut offerer_state).await;
        wait_established(&mut answerer_state).await;
        (offerer_task, answerer_task)
    }

    async fn join(task: SessionTask) -> Result<SessionReport> {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session did not end")
            .unwrap()
    }

    async fn next_rtt(events: &mut mpsc::UnboundedReceiver<ProbeEvent>) -> crate::probe::RttSample {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("no probe event")
                .expect("probe events closed");
            if let ProbeEvent::Rtt(sample) = event {
                return sample;
            }
        }
    }

    #[tokio::test]
    async fn test_local_shutdown_says_bye_to_peer() {
        let (offerer, offerer_engine) = session(Role::Offerer);
        let (answerer, answerer_engine) = session(Role::Answerer);
        let shutdown = offerer.shutdown_handle();

        let (offerer_task, answerer_task) = start_pair(offerer, answerer).await;
        shutdown.shutdown();

        let offerer_report = join(offerer_task).await.unwrap();
        assert_eq!(offerer_report.end, SessionEnd::LocalShutdown);
        assert_eq!(offerer_report.teardown.steps, TEARDOWN_ORDER);

        let answerer_report = join(answerer_task).await.unwrap();
        assert_eq!(answerer_report.end, SessionEnd::PeerBye);
        assert_eq!(answerer_report.teardown.steps, TEARDOWN_ORDER);

        assert_eq!(offerer_engine.close_count(), 1);
        assert_eq!(answerer_engine.close_count(), 1);
        assert_eq!(
            offerer_engine.calls()[..3],
            [
                EngineCall::CreateOffer,
                EngineCall::SetLocal(SdpType::Offer),
                EngineCall::SetRemote(SdpType::Answer),
            ]
        );
        assert_eq!(
            answerer_engine.calls()[..3],
            [
                EngineCall::SetRemote(SdpType::Offer),
                EngineCall::CreateAnswer,
                EngineCall::SetLocal(SdpType::Answer),
            ]
        );
    }

    #[tokio::test]
    async fn test_echo_carries_latest_position() {
        let (mut offerer, offerer_engine) = session(Role::Offerer);
        let (answerer, answerer_engine) = session(Role::Answerer);
        let mut probe_events = offerer.take_probe_events().unwrap();
        assert!(offerer.take_probe_events().is_none());
        let answerer_ledger = answerer.ledger();
        let shutdown = offerer.shutdown_handle();

        // The offerer's data channel opens before negotiation is done and has
        // to wait for it
        let (offerer_link, answerer_link) = probe_link_pair("probe");
        offerer_engine.emit(EngineEvent::DataChannel(offerer_link));

        let (offerer_task, answerer_task) = start_pair(offerer, answerer).await;

        let (mut frames, feed) = frame_feed("video0");
        answerer_engine.emit(EngineEvent::Track(feed));
        answerer_engine.emit(EngineEvent::DataChannel(answerer_link));
        for _ in 0..7 {
            frames.push(Bytes::from_static(b"luma"));
            tokio::task::yield_now().await;
        }

        let target = PositionSample::found(7, (120, 240));
        tokio::time::timeout(Duration::from_secs(5), async {
            while answerer_ledger.latest() != Some(target) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frame #7 never recorded");

        let sample = loop {
            let sample = next_rtt(&mut probe_events).await;
            if sample.sample == Some(target) {
                break sample;
            }
        };
        assert!(sample.rtt < Duration::from_secs(5));

        shutdown.shutdown();
        let offerer_report = join(offerer_task).await.unwrap();
        assert!(offerer_report.teardown.probe.pings_sent >= 1);
        assert!(offerer_report.teardown.probe.rtt_samples >= 1);

        let answerer_report = join(answerer_task).await.unwrap();
        assert_eq!(answerer_report.end, SessionEnd::PeerBye);
        assert!(answerer_report.positions_recorded >= 1);
        assert!(answerer_report.teardown.dispatch.analyzed >= 1);
        assert!(answerer_report.teardown.probe.echoes_sent >= 1);
        // Ledger is released with the session
        assert!(answerer_ledger.is_empty());
    }

    #[tokio::test]
    async fn test_ping_without_video_echoes_no_target() {
        let (mut offerer, offerer_engine) = session(Role::Offerer);
        let (answerer, answerer_engine) = session(Role::Answerer);
        let mut probe_events = offerer.take_probe_events().unwrap();
        let shutdown = offerer.shutdown_handle();

        let (offerer_task, answerer_task) = start_pair(offerer, answerer).await;
        let (offerer_link, answerer_link) = probe_link_pair("probe");
        answerer_engine.emit(EngineEvent::DataChannel(answerer_link));
        offerer_engine.emit(EngineEvent::DataChannel(offerer_link));

        let sample = next_rtt(&mut probe_events).await;
        assert_eq!(sample.sample, None);

        shutdown.shutdown();
        join(offerer_task).await.unwrap();
        join(answerer_task).await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_failure_is_fatal_after_teardown() {
        let (offerer, offerer_engine) = session(Role::Offerer);
        let (answerer, answerer_engine) = session(Role::Answerer);

        let (offerer_task, answerer_task) = start_pair(offerer, answerer).await;
        offerer_engine.emit(EngineEvent::ConnectionState(ConnectionState::Failed));

        let err = join(offerer_task).await.unwrap_err();
        assert!(matches!(err, AppError::Transport(_)));
        assert_eq!(offerer_engine.close_count(), 1);

        // The failing side still said goodbye
        let answerer_report = join(answerer_task).await.unwrap();
        assert_eq!(answerer_report.end, SessionEnd::PeerBye);
        assert_eq!(answerer_engine.close_count(), 1);
    }

    #[tokio::test]
    async fn test_second_video_track_is_not_analyzed() {
        let (offerer, _offerer_engine) = session(Role::Offerer);
        let (answerer, answerer_engine) = session(Role::Answerer);
        let ledger = answerer.ledger();
        let shutdown = answerer.shutdown_handle();

        let (offerer_task, answerer_task) = start_pair(offerer, answerer).await;
        let (_first, first_feed) = frame_feed("video0");
        let (mut second, second_feed) = frame_feed("video1");
        answerer_engine.emit(EngineEvent::Track(first_feed));
        answerer_engine.emit(EngineEvent::Track(second_feed));
        second.push(Bytes::from_static(b"luma"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ledger.is_empty());

        shutdown.shutdown();
        let report = join(answerer_task).await.unwrap();
        assert_eq!(report.positions_recorded, 0);
        assert_eq!(join(offerer_task).await.unwrap().end, SessionEnd::PeerBye);
    }

    #[tokio::test]
    async fn test_shutdown_before_connect_releases_engine() {
        let (session, engine) = session(Role::Answerer);
        let shutdown = session.shutdown_handle();
        shutdown.shutdown();
        shutdown.shutdown();
        assert!(shutdown.is_shutdown());

        let report = session.connect_and_run().await.unwrap();
        assert_eq!(report.end, SessionEnd::LocalShutdown);
        assert!(report.teardown.steps.is_empty());
        assert_eq!(engine.close_count(), 1);
        // Already-fired handle resolves at once
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .unwrap();
    }
}
