use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ballrtc::config::{AppConfig, Framing};
use ballrtc::engine::RtcEngine;
use ballrtc::negotiation::Role;
use ballrtc::probe::ProbeEvent;
use ballrtc::session::{PeerSession, SessionEnd};
use ballrtc::synthetic::{self, BouncingBall, LumaCentroid};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Signaling framing selectable from the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
enum FramingArg {
    Lines,
    LengthPrefixed,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Lines => Framing::Lines,
            FramingArg::LengthPrefixed => Framing::LengthPrefixed,
        }
    }
}

/// ballrtc command line arguments
#[derive(Parser, Debug)]
#[command(name = "ballrtc")]
#[command(version, about = "Bouncing-ball WebRTC peer with a latency probe", long_about = None)]
struct CliArgs {
    /// Negotiation role (the offerer listens for signaling)
    #[arg(short = 'r', long, value_name = "ROLE")]
    role: Option<Role>,

    /// Signaling host (overrides config file)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Signaling port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Signaling message framing
    #[arg(long, value_name = "FRAMING")]
    framing: Option<FramingArg>,

    /// Latency probe period in milliseconds
    #[arg(long, value_name = "MS")]
    probe_interval_ms: Option<u64>,

    /// Answer pings but never issue them
    #[arg(long)]
    no_probe: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Log line format
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_format);

    tracing::info!("Starting ballrtc v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            AppConfig::load(path)?
        }
        None => AppConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    let role = config.role;
    tracing::info!(
        "Role {}: signaling {} ({}), probe {}",
        role,
        config.signaling.address(),
        if config.signaling.listens(role) { "listen" } else { "connect" },
        if config.probe.issues(role) { "issuing" } else { "answering" }
    );

    let (engine, events) = RtcEngine::new(&config.webrtc, role).await?;

    let outbound = if role == Role::Offerer && config.webrtc.publish_synthetic {
        Some(Arc::new(
            engine.attach_outbound_video(config.synthetic.fps).await?,
        ))
    } else {
        None
    };

    let analyzer = Arc::new(LumaCentroid::from_config(&config.synthetic));
    let synthetic_config = config.synthetic.clone();
    let mut session = PeerSession::new(config, engine, events, analyzer);

    if let Some(video) = outbound {
        let generator = BouncingBall::new(&synthetic_config);
        session = session.with_source(move |cancel| synthetic::pump(generator, video, cancel));
    }

    if let Some(probe_events) = session.take_probe_events() {
        tokio::spawn(log_probe_events(probe_events));
    }

    // Setup graceful shutdown
    let shutdown = session.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!("Failed to listen for CTRL+C: {}", e),
        }
        shutdown.shutdown();
    });

    let report = session.connect_and_run().await?;
    match report.end {
        SessionEnd::LocalShutdown => tracing::info!("Session closed locally"),
        SessionEnd::PeerBye => tracing::info!("Session closed by peer"),
    }
    tracing::info!(
        "{} positions recorded, {} frames sent, {} RTT samples",
        report.positions_recorded,
        report.teardown.frames_sent,
        report.teardown.probe.rtt_samples
    );
    Ok(())
}

fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(role) = args.role {
        config.role = role;
    }
    if let Some(host) = &args.host {
        config.signaling.host = host.clone();
    }
    if let Some(port) = args.port {
        config.signaling.port = port;
    }
    if let Some(framing) = args.framing {
        config.signaling.framing = framing.into();
    }
    if let Some(interval) = args.probe_interval_ms {
        config.probe.interval_ms = interval;
    }
    if args.no_probe {
        config.probe.issue = Some(false);
    }
}

async fn log_probe_events(mut events: mpsc::UnboundedReceiver<ProbeEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ProbeEvent::Rtt(sample) => match sample.sample {
                Some(position) => tracing::info!(
                    "RTT {:.3} ms, peer saw {}",
                    sample.rtt.as_secs_f64() * 1000.0,
                    position
                ),
                None => tracing::info!(
                    "RTT {:.3} ms, peer has no position yet",
                    sample.rtt.as_secs_f64() * 1000.0
                ),
            },
            ProbeEvent::Answered { timestamp, sample } => {
                tracing::debug!("Answered ping {} with {:?}", timestamp, sample)
            }
            ProbeEvent::Malformed(raw) => tracing::debug!("Malformed probe message: {}", raw),
        }
    }
}

fn init_logging(level: LogLevel, verbose_count: u8, format: LogFormat) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "ballrtc=error,webrtc=error",
        LogLevel::Warn => "ballrtc=warn,webrtc=warn",
        LogLevel::Info => "ballrtc=info,webrtc=warn",
        LogLevel::Verbose => "ballrtc=debug,webrtc=warn",
        LogLevel::Debug => "ballrtc=debug,webrtc=info",
        LogLevel::Trace => "ballrtc=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
