//! webrtc-rs backed engine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rtp::codecs::vp8::Vp8Packet;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    frame_feed, ConnectionState, EngineEvent, EngineEvents, PeerEngine, ProbeLink,
    ProbeTransport,
};
use crate::config::WebRtcConfig;
use crate::error::{AppError, Result};
use crate::negotiation::Role;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

const VP8_CLOCK_RATE: u32 = 90_000;
/// Packets the sample builder may hold back while waiting for reordering.
/// A raw 320x240 luma frame spans about 65 packets.
const SAMPLE_BUILDER_MAX_LATE: u16 = 512;
/// Inbound probe messages buffered before new ones are dropped
const PROBE_INBOUND_CAPACITY: usize = 64;

/// Peer connection plus the plumbing that turns its callbacks into
/// [`EngineEvent`]s
pub struct RtcEngine {
    pc: Arc<RTCPeerConnection>,
    trickle: bool,
    gathering_timeout: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
    closed: AtomicBool,
}

impl RtcEngine {
    /// Build the peer connection for `role`.
    ///
    /// The offerer also creates the probe data channel so it is part of the
    /// offer.
    pub async fn new(config: &WebRtcConfig, role: Role) -> Result<(Arc<Self>, EngineEvents)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::Transport(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::Transport(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| AppError::Transport(format!("Failed to create peer connection: {}", e)))?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            pc: Arc::new(pc),
            trickle: config.trickle_ice,
            gathering_timeout: Duration::from_millis(config.gathering_timeout_ms),
            events,
            closed: AtomicBool::new(false),
        });
        engine.install_handlers();

        if role == Role::Offerer {
            let dc = engine
                .pc
                .create_data_channel(&config.probe_label, None)
                .await
                .map_err(|e| {
                    AppError::Transport(format!("Failed to create data channel: {}", e))
                })?;
            info!("Data channel '{}' created", config.probe_label);
            wire_data_channel(dc, engine.events.clone());
        }

        Ok((engine, events_rx))
    }

    fn install_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = match s {
                    RTCPeerConnectionState::New => Some(ConnectionState::New),
                    RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };
                if let Some(state) = state {
                    info!("Peer connection state: {}", state);
                    let _ = events.send(EngineEvent::ConnectionState(state));
                }
                Box::pin(async {})
            }));

        if self.trickle {
            let events = self.events.clone();
            self.pc
                .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                    let events = events.clone();
                    Box::pin(async move {
                        let Some(c) = candidate else { return };
                        match c.to_json() {
                            Ok(init) => {
                                debug!("Local ICE candidate: {}", init.candidate);
                                let _ = events.send(EngineEvent::LocalCandidate(IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                }));
                            }
                            Err(e) => warn!("Failed to serialize local candidate: {}", e),
                        }
                    })
                }));
        }

        let events = self.events.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                info!("Remote data channel '{}' announced", dc.label());
                wire_data_channel(dc, events.clone());
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc
            .on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let events = events.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Video {
                        debug!("Ignoring {} track {}", track.kind(), track.id());
                        return;
                    }
                    info!(
                        "Inbound video track {} ({})",
                        track.id(),
                        track.codec().capability.mime_type
                    );
                    let (sender, feed) = frame_feed(track.id());
                    if events.send(EngineEvent::Track(feed)).is_ok() {
                        tokio::spawn(read_video_track(track, sender));
                    }
                })
            }));
    }

    /// Add a sending video track. Must be called before the offer is made.
    pub async fn attach_outbound_video(&self, fps: u32) -> Result<OutboundVideo> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VP8_CLOCK_RATE,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "video".to_string(),
            format!("ballrtc-{}", uuid::Uuid::new_v4()),
        ));

        let sender = self
            .pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to add video track: {}", e)))?;

        // RTCP has to be read for the interceptors to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        info!("Outbound video track added");

        Ok(OutboundVideo {
            track,
            frame_duration: Duration::from_secs(1) / fps.max(1),
        })
    }

    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
        let parsed = match desc.kind {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        };
        parsed.map_err(|e| AppError::Negotiation(format!("Invalid {} SDP: {}", desc.kind, e)))
    }

    fn from_rtc(desc: &RTCSessionDescription) -> Result<SessionDescription> {
        match desc.sdp_type {
            RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp.clone())),
            RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp.clone())),
            other => Err(AppError::Transport(format!(
                "Unsupported local description type {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl PeerEngine for RtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to create offer: {}", e)))?;
        Self::from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to create answer: {}", e)))?;
        Self::from_rtc(&answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription> {
        let rtc = Self::to_rtc(desc.clone())?;

        if self.trickle {
            self.pc.set_local_description(rtc).await.map_err(|e| {
                AppError::Transport(format!("Failed to set local description: {}", e))
            })?;
            return Ok(desc);
        }

        // Announce the description only once every candidate is in it
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(self.gathering_timeout, gathered.recv())
            .await
            .is_err()
        {
            warn!(
                "ICE gathering incomplete after {:?}, sending partial description",
                self.gathering_timeout
            );
        }

        match self.pc.local_description().await {
            Some(local) => Self::from_rtc(&local),
            None => Ok(desc),
        }
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let rtc = Self::to_rtc(desc)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pc
            .close()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to close peer connection: {}", e)))?;
        info!("Peer connection closed");
        Ok(())
    }
}

/// Reassemble frames of one inbound track and publish them on its feed
async fn read_video_track(track: Arc<TrackRemote>, mut sender: super::FrameFeedSender) {
    let mut builder = SampleBuilder::new(SAMPLE_BUILDER_MAX_LATE, Vp8Packet::default(), VP8_CLOCK_RATE);

    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                debug!("Track {} read ended: {}", track.id(), e);
                break;
            }
        };
        builder.push(packet);

        while let Some(sample) = builder.pop() {
            if sender.is_closed() {
                continue;
            }
            let sequence = sender.push(sample.data);
            trace!("Track {} frame #{} reassembled", track.id(), sequence);
        }
    }
}

/// Hook a data channel's callbacks to the event stream. The [`ProbeLink`]
/// is emitted once, when the channel opens.
fn wire_data_channel(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<EngineEvent>) {
    let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(PROBE_INBOUND_CAPACITY);
    let link = Arc::new(Mutex::new(Some(ProbeLink {
        label: dc.label().to_string(),
        transport: Arc::new(DataChannelTransport { dc: dc.clone() }),
        inbound: inbound_rx,
    })));

    let label = dc.label().to_string();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if inbound_tx.try_send(msg.data).is_err() {
            debug!("Probe channel '{}' backlog full, dropping message", label);
        }
        Box::pin(async {})
    }));

    let emit = {
        let link = link.clone();
        move || {
            if let Some(link) = link.lock().take() {
                info!("Data channel '{}' open", link.label);
                let _ = events.send(EngineEvent::DataChannel(link));
            }
        }
    };

    if dc.ready_state() == RTCDataChannelState::Open {
        emit();
    } else {
        dc.on_open(Box::new(move || {
            emit();
            Box::pin(async {})
        }));
    }
}

struct DataChannelTransport {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl ProbeTransport for DataChannelTransport {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| AppError::Transport(format!("Data channel send failed: {}", e)))
    }
}

/// Sending side of the synthetic video track
pub struct OutboundVideo {
    track: Arc<TrackLocalStaticSample>,
    frame_duration: Duration,
}

impl OutboundVideo {
    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Packetize and send one frame
    pub async fn write_frame(&self, pixels: Bytes) -> Result<()> {
        let sample = Sample {
            data: pixels,
            duration: self.frame_duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to write video sample: {}", e)))
    }
}
