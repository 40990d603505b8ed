use std::env;
use std::time::Duration;

use tracing::warn;

use crate::ice::IceServer;
use crate::platform::ChannelConfig;
use crate::policy::CandidatePolicy;
use crate::transport::chunk::ChunkConfig;

pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(10);

/// Handshake timers and per-session defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long an ICE `disconnected` report may last before the session closes.
    pub disconnect_grace: Duration,
    pub connection_type: CandidatePolicy,
    pub channel_defaults: ChannelConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            connection_type: CandidatePolicy::Default,
            channel_defaults: ChannelConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let connection_type = match env::var("PEERLINE_CONNECTION_TYPE") {
            Ok(value) => value.parse().unwrap_or_else(|err| {
                warn!(target = "peerline::config", error = %err, "using default connection type");
                CandidatePolicy::Default
            }),
            Err(_) => CandidatePolicy::Default,
        };
        Self {
            disconnect_grace: parse_duration_ms_env(
                "PEERLINE_DISCONNECT_GRACE_MS",
                DEFAULT_DISCONNECT_GRACE,
                1,
            ),
            connection_type,
            channel_defaults: ChannelConfig::default(),
        }
    }
}

/// Where ICE servers come from when no collaborator is wired explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
    pub endpoint: Option<String>,
}

impl IceConfig {
    pub fn from_env() -> Self {
        let username = env::var("PEERLINE_TURN_USERNAME").ok();
        let credential = env::var("PEERLINE_TURN_CREDENTIAL").ok();
        let servers = env::var("PEERLINE_ICE_SERVERS")
            .map(|raw| parse_server_list(&raw, username.as_deref(), credential.as_deref()))
            .unwrap_or_default();
        let endpoint = env::var("PEERLINE_ICE_SERVERS_URL")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());
        Self { servers, endpoint }
    }
}

/// Parses a comma-separated URL list; TURN entries receive the shared credentials.
pub fn parse_server_list(
    raw: &str,
    username: Option<&str>,
    credential: Option<&str>,
) -> Vec<IceServer> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| {
            let is_turn = url.to_ascii_lowercase().starts_with("turn");
            IceServer {
                url: url.to_owned(),
                username: username.filter(|_| is_turn).map(str::to_owned),
                credential: credential.filter(|_| is_turn).map(str::to_owned),
            }
        })
        .collect()
}

/// Peerline runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub session: SessionConfig,
    pub chunk: ChunkConfig,
    pub ice: IceConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            session: SessionConfig::from_env(),
            chunk: ChunkConfig::from_env(),
            ice: IceConfig::from_env(),
        }
    }
}

pub(crate) fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "peerline::config",
                    var, parsed, min, default, "config value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "peerline::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse config value from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

pub(crate) fn parse_duration_ms_env(var: &str, default: Duration, min_ms: u64) -> Duration {
    let default_ms = usize::try_from(default.as_millis()).unwrap_or(usize::MAX);
    let min_ms = usize::try_from(min_ms).unwrap_or(usize::MAX);
    let millis = parse_usize_env(var, default_ms, min_ms);
    Duration::from_millis(millis as u64)
}
