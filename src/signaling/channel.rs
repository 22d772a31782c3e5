//! Reliable, ordered signaling channel
//!
//! Wraps one persistent byte stream (TCP in production, an in-memory duplex
//! in tests) with the [`SignalingCodec`]. The side that speaks first (the
//! offerer by default) listens; the other side connects, retrying until the
//! connect timeout elapses.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info};

use super::codec::SignalingCodec;
use super::message::SignalingMessage;
use crate::config::{Framing, SignalingConfig};
use crate::error::{AppError, Result};
use crate::negotiation::Role;

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// `Bye` went out; nothing else may be sent or received
    ByeSent,
    /// Peer sent `Bye`
    ByeReceived,
    Closed,
}

/// Signaling channel over a framed stream
pub struct SignalingChannel<S = TcpStream> {
    framed: Option<Framed<S, SignalingCodec>>,
    peer: String,
    state: ChannelState,
}

impl SignalingChannel<TcpStream> {
    /// Establish the stream for `role`.
    ///
    /// Fails with [`AppError::Connection`] if no peer shows up (listening
    /// side) or none can be reached (connecting side) within
    /// `connect_timeout_ms`.
    pub async fn connect(config: &SignalingConfig, role: Role) -> Result<Self> {
        let address = config.address();
        let limit = config.connect_timeout();

        let (stream, peer) = if config.listens(role) {
            let listener = TcpListener::bind(&address).await.map_err(|e| {
                AppError::Connection(format!("Failed to bind {}: {}", address, e))
            })?;
            info!("Signaling listening on {} as {}", address, role);

            let (stream, peer) = timeout(limit, listener.accept())
                .await
                .map_err(|_| {
                    AppError::Connection(format!(
                        "No peer connected to {} within {:?}",
                        address, limit
                    ))
                })?
                .map_err(|e| AppError::Connection(format!("Accept failed: {}", e)))?;
            (stream, peer.to_string())
        } else {
            let stream = connect_with_retry(&address, limit, config.retry_interval()).await?;
            (stream, address.clone())
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on signaling stream: {}", e);
        }
        info!("Signaling connected to {}", peer);

        Ok(Self::from_stream(
            stream,
            config.framing,
            config.max_message_bytes,
            peer,
        ))
    }
}

async fn connect_with_retry(
    address: &str,
    limit: std::time::Duration,
    retry: std::time::Duration,
) -> Result<TcpStream> {
    let deadline = Instant::now() + limit;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!("Signaling connect attempt {} to {} failed: {}", attempts, address, e);
            }
            Err(_) => {}
        }

        if Instant::now() + retry >= deadline {
            return Err(AppError::Connection(format!(
                "Peer {} unreachable after {} attempts within {:?}",
                address, attempts, limit
            )));
        }
        sleep(retry).await;
    }
}

impl<S> SignalingChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-connected stream
    pub fn from_stream(
        stream: S,
        framing: Framing,
        max_message_bytes: usize,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            framed: Some(Framed::new(
                stream,
                SignalingCodec::new(framing, max_message_bytes),
            )),
            peer: peer.into(),
            state: ChannelState::Open,
        }
    }

    /// Remote endpoint description (for logging)
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    fn open_framed(&mut self) -> Result<&mut Framed<S, SignalingCodec>> {
        match (self.state, self.framed.as_mut()) {
            (ChannelState::Open, Some(framed)) => Ok(framed),
            (state, _) => Err(AppError::Signaling(format!(
                "Signaling channel is not open ({:?})",
                state
            ))),
        }
    }

    /// Write one message and flush it
    pub async fn send(&mut self, msg: SignalingMessage) -> Result<()> {
        let is_bye = msg == SignalingMessage::Bye;
        let name = msg.name();
        let framed = self.open_framed()?;

        let result = framed.send(msg).await;
        if let Err(e) = result {
            self.state = ChannelState::Closed;
            self.framed = None;
            return Err(match e {
                AppError::Io(io) => AppError::Signaling(format!("Send failed: {}", io)),
                other => other,
            });
        }
        debug!("Signaling sent {} to {}", name, self.peer);

        if is_bye {
            self.state = ChannelState::ByeSent;
        }
        Ok(())
    }

    /// Wait for the next complete message.
    ///
    /// Cancel-safe: dropping the future never loses a partially read message.
    pub async fn receive(&mut self) -> Result<SignalingMessage> {
        let framed = self.open_framed()?;

        let next = framed.next().await;
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                self.state = ChannelState::Closed;
                self.framed = None;
                return Err(match e {
                    AppError::Io(io) => AppError::Signaling(format!("Receive failed: {}", io)),
                    other => other,
                });
            }
            None => {
                self.state = ChannelState::Closed;
                self.framed = None;
                return Err(AppError::Signaling(format!(
                    "Signaling stream from {} closed",
                    self.peer
                )));
            }
        };
        debug!("Signaling received {} from {}", msg.name(), self.peer);

        if msg == SignalingMessage::Bye {
            self.state = ChannelState::ByeReceived;
        }
        Ok(msg)
    }

    /// Release the stream. Safe to call any number of times.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut framed) = self.framed.take() {
            // Best effort: the peer may already be gone
            if let Err(e) = SinkExt::<SignalingMessage>::close(&mut framed).await {
                debug!("Signaling shutdown toward {}: {}", self.peer, e);
            }
            info!("Signaling channel to {} closed", self.peer);
        }
        self.state = ChannelState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::message::{IceCandidate, SessionDescription};
    use tokio::io::{duplex, DuplexStream};

    fn pair(framing: Framing) -> (SignalingChannel<DuplexStream>, SignalingChannel<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        (
            SignalingChannel::from_stream(a, framing, 1 << 20, "offerer"),
            SignalingChannel::from_stream(b, framing, 1 << 20, "answerer"),
        )
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        for framing in [Framing::Lines, Framing::LengthPrefixed] {
            let (mut a, mut b) = pair(framing);
            let sent = vec![
                SignalingMessage::SessionDescription(SessionDescription::offer("v=0")),
                SignalingMessage::Candidate(IceCandidate::new(
                    "candidate:1 1 udp 1 10.0.0.1 9 typ host",
                )),
                SignalingMessage::Candidate(IceCandidate::new(
                    "candidate:2 1 udp 1 10.0.0.2 9 typ host",
                )),
            ];
            for msg in &sent {
                a.send(msg.clone()).await.unwrap();
            }
            for msg in &sent {
                assert_eq!(&b.receive().await.unwrap(), msg);
            }
        }
    }

    #[tokio::test]
    async fn test_bye_closes_both_directions() {
        let (mut a, mut b) = pair(Framing::Lines);
        a.send(SignalingMessage::Bye).await.unwrap();
        assert_eq!(a.state(), ChannelState::ByeSent);
        assert!(matches!(
            a.send(SignalingMessage::Bye).await,
            Err(AppError::Signaling(_))
        ));

        assert_eq!(b.receive().await.unwrap(), SignalingMessage::Bye);
        assert_eq!(b.state(), ChannelState::ByeReceived);
        assert!(matches!(b.receive().await, Err(AppError::Signaling(_))));
        assert!(matches!(
            b.send(SignalingMessage::SessionDescription(SessionDescription::answer("v=0")))
                .await,
            Err(AppError::Signaling(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut a, mut b) = pair(Framing::Lines);
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(a.state(), ChannelState::Closed);
        assert!(a.send(SignalingMessage::Bye).await.is_err());

        // Peer observes end of stream as a signaling error
        assert!(matches!(b.receive().await, Err(AppError::Signaling(_))));
    }

    #[tokio::test]
    async fn test_malformed_input_fails() {
        let stream = tokio_test::io::Builder::new()
            .read(b"{\"type\":\"offer\",\"sdp\":\"v=0\"}\n")
            .read(b"garbage\n")
            .build();
        let mut channel = SignalingChannel::from_stream(stream, Framing::Lines, 4096, "mock");

        assert!(matches!(
            channel.receive().await.unwrap(),
            SignalingMessage::SessionDescription(_)
        ));
        assert!(matches!(channel.receive().await, Err(AppError::Signaling(_))));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_writes_whole_line() {
        let stream = tokio_test::io::Builder::new()
            .write(b"{\"type\":\"bye\"}\n")
            .build();
        let mut channel = SignalingChannel::from_stream(stream, Framing::Lines, 4096, "mock");
        channel.send(SignalingMessage::Bye).await.unwrap();
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_tcp_roles() {
        let config = SignalingConfig {
            port: free_port(),
            connect_timeout_ms: 5000,
            retry_interval_ms: 20,
            ..Default::default()
        };

        let listen_config = config.clone();
        let offerer = tokio::spawn(async move {
            let mut channel = SignalingChannel::connect(&listen_config, Role::Offerer)
                .await
                .unwrap();
            channel
                .send(SignalingMessage::SessionDescription(SessionDescription::offer(
                    "v=0",
                )))
                .await
                .unwrap();
            channel
        });

        let mut answerer = SignalingChannel::connect(&config, Role::Answerer)
            .await
            .unwrap();
        assert_eq!(answerer.receive().await.unwrap().name(), "offer");
        offerer.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_peer_times_out() {
        let config = SignalingConfig {
            port: free_port(),
            connect_timeout_ms: 150,
            retry_interval_ms: 20,
            ..Default::default()
        };
        let result = SignalingChannel::connect(&config, Role::Answerer).await;
        assert!(matches!(result, Err(AppError::Connection(_))));
    }

    #[tokio::test]
    async fn test_listener_times_out() {
        let config = SignalingConfig {
            port: free_port(),
            connect_timeout_ms: 100,
            ..Default::default()
        };
        let result = SignalingChannel::connect(&config, Role::Offerer).await;
        assert!(matches!(result, Err(AppError::Connection(_))));
    }
}
