use std::io::{self, Read};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use peerline_core::channel::{ChannelEvent, DataChannelSession};
use peerline_core::config::Config;
use peerline_core::endpoint::{Endpoint, spawn_mailbox_pump};
use peerline_core::platform::ChannelState;
use peerline_core::platform::rtc::{DEFAULT_MAX_BUFFERED_BYTES, RtcPlatform};
use peerline_core::policy::{CandidatePolicy, CandidatePolicyFilter};
use peerline_core::session::{OpenOptions, PeerSession, SessionDeps, SessionEvent, SessionPhase};
use peerline_core::signaling::{
    HttpIceServerProvider, HubSignaling, IceServerProvider, StaticIceServers, UserContext,
};
use peerline_core::telemetry::{self, LogConfig, LogLevel};
use serde_json::json;
use signal_bus::{LocalHub, Mailbox};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CHANNEL_NAME: &str = "chat";

#[derive(Parser, Debug)]
#[command(
    name = "peerline",
    about = "Peer sessions with a chunked data-channel pipeline",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "PEERLINE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        global = true,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "PEERLINE_LOG_FILE",
        global = true,
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect two in-process endpoints over webrtc and push one message through
    Loopback(LoopbackArgs),
    /// Apply a connection-type policy to an SDP read from a file or stdin
    Filter(FilterArgs),
}

#[derive(Args, Debug)]
struct LoopbackArgs {
    #[arg(long, default_value_t = 64 * 1024, help = "Payload size in bytes")]
    size: usize,

    #[arg(long, env = "PEERLINE_CONNECTION_TYPE", help = "default, direct or server")]
    policy: Option<CandidatePolicy>,

    #[arg(long, default_value_t = 30, help = "Seconds to wait for each step")]
    timeout_secs: u64,

    #[arg(
        long,
        default_value_t = DEFAULT_MAX_BUFFERED_BYTES,
        help = "Bytes a channel may buffer before sends report back pressure"
    )]
    max_buffered_bytes: usize,
}

#[derive(Args, Debug)]
struct FilterArgs {
    #[arg(long, default_value_t = CandidatePolicy::Default)]
    policy: CandidatePolicy,

    #[arg(long, help = "TURN address used to rewrite reflexive candidates")]
    turn: Option<IpAddr>,

    /// SDP file; reads stdin when omitted
    path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    let installed = telemetry::init(&log_config).context("failed to initialise logging")?;
    debug!(
        log_level = ?log_config.level,
        log_file = ?log_config.file,
        filter = installed.as_ref().map(|i| i.filter.as_str()).unwrap_or("unchanged"),
        "logging configured"
    );

    match cli.command {
        Command::Loopback(args) => run_loopback(args).await,
        Command::Filter(args) => run_filter(args),
    }
}

fn run_filter(args: FilterArgs) -> Result<()> {
    let sdp = match &args.path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };
    let filter = CandidatePolicyFilter::new(args.policy, args.turn);
    print!("{}", filter.filter_description(&sdp));
    Ok(())
}

async fn run_loopback(args: LoopbackArgs) -> Result<()> {
    let mut config = Config::from_env();
    if let Some(policy) = args.policy {
        config.session.connection_type = policy;
    }
    let step = Duration::from_secs(args.timeout_secs.max(1));
    let credentials: Arc<dyn IceServerProvider> = match &config.ice.endpoint {
        Some(endpoint) => Arc::new(HttpIceServerProvider::new(endpoint)?),
        None => Arc::new(StaticIceServers::new(config.ice.servers.clone())),
    };

    let hub = Arc::new(LocalHub::new());
    let platform = RtcPlatform::new().with_max_buffered_bytes(args.max_buffered_bytes);
    let (alice, alice_box) = build_endpoint("alice", &hub, &credentials, &platform, &config)?;
    let (bob, bob_box) = build_endpoint("bob", &hub, &credentials, &platform, &config)?;

    let (accepted_tx, mut accepted) = broadcast::channel::<PeerSession>(4);
    let bob = bob.with_acceptor(move |session| {
        if let Err(err) = session.register_data_channel(CHANNEL_NAME) {
            warn!(error = %err, "failed to register channel on responder");
        }
        session.set_accept_data(json!({"demo": "loopback", "accepted_by": "bob"}));
        let _ = accepted_tx.send(session.clone());
    });
    let alice = Arc::new(alice);
    let bob = Arc::new(bob);
    let pumps = [
        spawn_mailbox_pump(alice.clone(), alice_box),
        spawn_mailbox_pump(bob.clone(), bob_box),
    ];

    let session = alice.connect("bob");
    session.register_data_channel(CHANNEL_NAME)?;
    let mut alice_events = session.subscribe();
    session
        .open(OpenOptions {
            connection_type: None,
            connection_data: Some(json!({"demo": "loopback"})),
        })
        .await?;
    info!(session_id = %session.id(), "offer sent");

    let responder = timeout(step, accepted.recv())
        .await
        .context("timed out waiting for bob to accept")??;
    let mut bob_events = responder.subscribe();

    let sender = timeout(step, wait_for_channel(&mut alice_events))
        .await
        .context("timed out waiting for alice's channel")??;
    let receiver = match responder.channel(CHANNEL_NAME) {
        Some(channel) if channel.state() == ChannelState::Open => channel,
        _ => timeout(step, wait_for_channel(&mut bob_events))
            .await
            .context("timed out waiting for bob's channel")??,
    };

    let mut inbound = receiver.subscribe();
    let body = "x".repeat(args.size);
    sender.send(&json!({ "from": "alice", "body": body }))?;
    let received = timeout(step, async {
        loop {
            match inbound.recv().await {
                Ok(ChannelEvent::MessageReceived(value)) => return Ok(value),
                Ok(ChannelEvent::Error(err)) => bail!("receive failed: {err}"),
                Ok(_) => continue,
                Err(err) => bail!("channel events ended: {err}"),
            }
        }
    })
    .await
    .context("timed out waiting for the message")??;

    let arrived = received["body"].as_str().map(str::len).unwrap_or(0);
    println!(
        "alice -> bob over {}: sent {} bytes, received {} bytes ({})",
        sender.id(),
        args.size,
        arrived,
        if arrived == args.size { "intact" } else { "MISMATCH" }
    );

    session.close(Some(json!({"reason": "done"}))).await;
    timeout(step, responder.wait_for_phase(SessionPhase::Closed))
        .await
        .context("timed out waiting for bob to close")?;
    for name in ["alice", "bob"] {
        hub.unregister(name);
    }
    for pump in pumps {
        if let Err(err) = timeout(step, pump).await {
            warn!(error = %err, "mailbox pump did not stop");
        }
    }
    Ok(())
}

fn build_endpoint(
    name: &str,
    hub: &Arc<LocalHub>,
    credentials: &Arc<dyn IceServerProvider>,
    platform: &RtcPlatform,
    config: &Config,
) -> Result<(Endpoint, Mailbox)> {
    let mailbox = hub.register(name)?;
    let deps = SessionDeps {
        signaling: Arc::new(HubSignaling::new(name, hub.clone())),
        credentials: credentials.clone(),
        platform: Arc::new(platform.clone()),
    };
    let endpoint = Endpoint::new(
        UserContext::named(name),
        deps,
        config.session.clone(),
        config.chunk,
    );
    Ok((endpoint, mailbox))
}

async fn wait_for_channel(events: &mut broadcast::Receiver<SessionEvent>) -> Result<DataChannelSession> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ChannelCreated(channel)) if channel.name() == CHANNEL_NAME => return Ok(channel),
            Ok(SessionEvent::ChannelCreationFailed { error, .. }) => bail!("channel creation failed: {error}"),
            Ok(SessionEvent::Error(err)) => debug!(error = %err, "session reported an error"),
            Ok(SessionEvent::Closed(reason)) => bail!("session closed: {reason:?}"),
            Ok(_) => continue,
            Err(err) => bail!("session events ended: {err}"),
        }
    }
}
