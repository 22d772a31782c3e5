//! Ping issuer and echo responder
//!
//! Every peer answers pings with the most recent ledger entry. The issuing
//! side additionally sends one ping per interval and turns echoes into RTT
//! samples. Both halves share one task per data channel.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::clock::ProbeClock;
use super::codec::{EchoMessage, PingMessage, ProbeMessage};
use crate::dispatch::{PositionLedger, PositionSample};
use crate::engine::ProbeLink;
use crate::error::Result;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// One completed ping/echo round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RttSample {
    pub rtt: Duration,
    /// Timestamp carried by the ping, µs since the probe epoch
    pub echoed: u64,
    /// Position sample the peer echoed; `None` if its ledger was empty
    pub sample: Option<PositionSample>,
}

/// Probe notification surfaced to the session owner
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeEvent {
    Rtt(RttSample),
    /// A peer ping was answered
    Answered {
        timestamp: String,
        sample: Option<PositionSample>,
    },
    /// A message that could not be decoded; non-fatal
    Malformed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeStats {
    pub pings_sent: u64,
    pub echoes_sent: u64,
    pub rtt_samples: u64,
    pub malformed: u64,
}

pub struct Prober {
    ledger: Arc<PositionLedger>,
    clock: ProbeClock,
    interval: Duration,
    issue: bool,
    events: mpsc::UnboundedSender<ProbeEvent>,
    stats: ProbeStats,
    throttler: LogThrottler,
}

impl Prober {
    pub fn new(
        ledger: Arc<PositionLedger>,
        interval: Duration,
        issue: bool,
        events: mpsc::UnboundedSender<ProbeEvent>,
    ) -> Self {
        Self {
            ledger,
            clock: ProbeClock::new(),
            interval,
            issue,
            events,
            stats: ProbeStats::default(),
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn stats(&self) -> ProbeStats {
        self.stats
    }

    /// Stamp the next ping. The first one carries timestamp 0.
    pub fn next_ping(&mut self) -> PingMessage {
        self.stats.pings_sent += 1;
        PingMessage::new(self.clock.stamp())
    }

    /// Process one inbound probe message.
    ///
    /// Returns the text to send back when the message was a ping.
    pub fn handle(&mut self, raw: &[u8]) -> Result<Option<String>> {
        let decoded = ProbeMessage::decode(raw).and_then(|msg| match msg {
            ProbeMessage::Ping(ping) => self.answer(&ping).map(Some),
            ProbeMessage::Echo(echo) => self.complete_round(echo).map(|_| None),
        });

        if let Err(e) = &decoded {
            self.stats.malformed += 1;
            self.emit(ProbeEvent::Malformed(e.to_string()));
        }
        decoded
    }

    fn answer(&mut self, ping: &PingMessage) -> Result<String> {
        let mut sent = self.ledger.latest();
        let text = match EchoMessage::reply(ping, sent).encode() {
            Ok(text) => text,
            Err(e) => {
                // Position does not fit the block: report the frame as absent
                warn_throttled!(self.throttler, "encode", "{}", e);
                sent = sent.map(|s| PositionSample::absent(s.sequence));
                EchoMessage::reply(ping, sent).encode()?
            }
        };

        self.stats.echoes_sent += 1;
        self.emit(ProbeEvent::Answered {
            timestamp: ping.timestamp.as_str().to_string(),
            sample: sent,
        });
        Ok(text)
    }

    fn complete_round(&mut self, echo: EchoMessage) -> Result<RttSample> {
        let rtt = self.clock.rtt(echo.timestamp.micros())?;
        let sample = RttSample {
            rtt,
            echoed: echo.timestamp.micros(),
            sample: echo.sample,
        };
        self.stats.rtt_samples += 1;

        match sample.sample {
            Some(s) => debug!("RTT {:.3} ms, peer position {}", rtt.as_secs_f64() * 1e3, s),
            None => debug!("RTT {:.3} ms, peer has no position yet", rtt.as_secs_f64() * 1e3),
        }
        self.emit(ProbeEvent::Rtt(sample));
        Ok(sample)
    }

    fn emit(&self, event: ProbeEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Serve `link` until it closes or `cancel` fires.
    ///
    /// Messages still queued on the link when the probe stops are dropped.
    pub async fn run(mut self, link: ProbeLink, cancel: CancellationToken) -> ProbeStats {
        let ProbeLink {
            label,
            transport,
            mut inbound,
        } = link;

        let mut ticker = self.issue.then(|| {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        info!(
            "Latency probe started on '{}' ({})",
            label,
            if self.issue { "issuing pings" } else { "answering only" }
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = next_tick(&mut ticker) => {
                    let ping = self.next_ping().encode();
                    debug!("Probe -> {}", ping);
                    if let Err(e) = transport.send_text(&ping).await {
                        warn_throttled!(self.throttler, "send", "Failed to send ping: {}", e);
                    }
                }
                raw = inbound.recv() => {
                    let Some(raw) = raw else {
                        debug!("Probe channel '{}' closed by peer", label);
                        break;
                    };
                    match self.handle(&raw) {
                        Ok(Some(reply)) => {
                            debug!("Probe -> {}", reply);
                            if let Err(e) = transport.send_text(&reply).await {
                                warn_throttled!(self.throttler, "send", "Failed to send echo: {}", e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn_throttled!(self.throttler, "decode", "Ignoring probe message: {}", e);
                        }
                    }
                }
            }
        }

        info!(
            "Latency probe on '{}' stopped: {} pings, {} echoes, {} RTT samples, {} malformed",
            label,
            self.stats.pings_sent,
            self.stats.echoes_sent,
            self.stats.rtt_samples,
            self.stats.malformed
        );
        self.stats
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
