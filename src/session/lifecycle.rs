//! Ordered session teardown
//!
//! Every task the session starts is registered here under the stage that
//! owns it. [`Lifecycle::teardown`] stops the stages in a fixed order
//! whatever triggered the shutdown:
//!
//! 1. probe scheduler and responder
//! 2. frame dispatch (and the outbound media source)
//! 3. negotiation, sending `Bye` if the peer has not said it
//! 4. signaling channel
//! 5. transport engine

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::DispatchStats;
use crate::engine::PeerEngine;
use crate::negotiation::{NegotiationEnd, Negotiator};
use crate::probe::ProbeStats;

/// Teardown stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    Probe,
    Dispatch,
    Negotiation,
    Signaling,
    Engine,
}

enum NegotiationSlot<S> {
    Running {
        task: JoinHandle<(Negotiator<S>, NegotiationEnd)>,
        cancel: CancellationToken,
    },
    Returned(Negotiator<S>),
    Empty,
}

/// Totals collected while tearing down
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub steps: Vec<TeardownStep>,
    pub probe: ProbeStats,
    pub dispatch: DispatchStats,
    pub frames_sent: u64,
}

pub struct Lifecycle<S> {
    probe_cancel: CancellationToken,
    probes: JoinSet<ProbeStats>,
    dispatch_cancel: CancellationToken,
    dispatchers: JoinSet<DispatchStats>,
    sources: JoinSet<u64>,
    negotiation: NegotiationSlot<S>,
    engine: Arc<dyn PeerEngine>,
    report: Option<TeardownReport>,
}

impl<S> Lifecycle<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(engine: Arc<dyn PeerEngine>) -> Self {
        Self {
            probe_cancel: CancellationToken::new(),
            probes: JoinSet::new(),
            dispatch_cancel: CancellationToken::new(),
            dispatchers: JoinSet::new(),
            sources: JoinSet::new(),
            negotiation: NegotiationSlot::Empty,
            engine,
            report: None,
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.report.is_some()
    }

    pub fn spawn_probe<F>(&mut self, make: impl FnOnce(CancellationToken) -> F)
    where
        F: Future<Output = ProbeStats> + Send + 'static,
    {
        self.probes.spawn(make(self.probe_cancel.child_token()));
    }

    pub fn spawn_dispatch<F>(&mut self, make: impl FnOnce(CancellationToken) -> F)
    where
        F: Future<Output = DispatchStats> + Send + 'static,
    {
        self.dispatchers.spawn(make(self.dispatch_cancel.child_token()));
    }

    /// Outbound media source; stopped together with dispatch
    pub fn spawn_source<F>(&mut self, make: impl FnOnce(CancellationToken) -> F)
    where
        F: Future<Output = u64> + Send + 'static,
    {
        self.sources.spawn(make(self.dispatch_cancel.child_token()));
    }

    pub fn set_negotiation(
        &mut self,
        task: JoinHandle<(Negotiator<S>, NegotiationEnd)>,
        cancel: CancellationToken,
    ) {
        self.negotiation = NegotiationSlot::Running { task, cancel };
    }

    /// The negotiation task returned on its own; keep the negotiator for
    /// the negotiation and signaling stages
    pub fn negotiation_returned(&mut self, negotiator: Negotiator<S>) {
        self.negotiation = NegotiationSlot::Returned(negotiator);
    }

    /// Run every stage once. Later calls return the first report.
    pub async fn teardown(&mut self) -> TeardownReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        let mut report = TeardownReport::default();
        info!("Tearing down session");

        self.probe_cancel.cancel();
        while let Some(joined) = self.probes.join_next().await {
            match joined {
                Ok(stats) => {
                    report.probe.pings_sent += stats.pings_sent;
                    report.probe.echoes_sent += stats.echoes_sent;
                    report.probe.rtt_samples += stats.rtt_samples;
                    report.probe.malformed += stats.malformed;
                }
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }
        report.steps.push(TeardownStep::Probe);

        self.dispatch_cancel.cancel();
        while let Some(joined) = self.dispatchers.join_next().await {
            match joined {
                Ok(stats) => {
                    report.dispatch.analyzed += stats.analyzed;
                    report.dispatch.absent += stats.absent;
                    report.dispatch.failed += stats.failed;
                    report.dispatch.skipped += stats.skipped;
                }
                Err(e) => warn!("Dispatch task failed: {}", e),
            }
        }
        while let Some(joined) = self.sources.join_next().await {
            match joined {
                Ok(sent) => report.frames_sent += sent,
                Err(e) => warn!("Media source task failed: {}", e),
            }
        }
        report.steps.push(TeardownStep::Dispatch);

        let mut negotiator = match std::mem::replace(&mut self.negotiation, NegotiationSlot::Empty) {
            NegotiationSlot::Running { task, cancel } => {
                cancel.cancel();
                match task.await {
                    Ok((negotiator, end)) => {
                        debug!("Negotiation task joined: {:?}", end);
                        Some(negotiator)
                    }
                    Err(e) => {
                        warn!("Negotiation task failed: {}", e);
                        None
                    }
                }
            }
            NegotiationSlot::Returned(negotiator) => Some(negotiator),
            NegotiationSlot::Empty => None,
        };

        if let Some(negotiator) = negotiator.as_mut() {
            negotiator.close_negotiation().await;
        }
        report.steps.push(TeardownStep::Negotiation);

        if let Some(negotiator) = negotiator.as_mut() {
            if let Err(e) = negotiator.close_channel().await {
                warn!("Failed to close signaling channel: {}", e);
            }
        }
        report.steps.push(TeardownStep::Signaling);

        if let Err(e) = self.engine.close().await {
            warn!("Failed to release transport engine: {}", e);
        }
        report.steps.push(TeardownStep::Engine);

        info!("Session torn down");
        self.report = Some(report.clone());
        report
    }
}
