//! Subscriber setup for the binary.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;

/// Full `EnvFilter` expression; replaces everything derived from the level.
pub const LOG_FILTER_ENV: &str = "PEERLINE_LOG_FILTER";
/// Set to a non-zero value to keep dependency traces at trace level.
pub const TRACE_DEPS_ENV: &str = "PEERLINE_TRACE_DEPS";

/// Capped at `info` when running at trace level.
const NOISY_DEPENDENCIES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_mdns",
    "reqwest",
    "hyper",
    "rustls",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Appended to; stderr when unset.
    pub file: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

/// What [`init`] ended up installing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub filter: String,
    pub throttled_dependencies: bool,
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Returns `None` when one was already
/// installed by an earlier call.
pub fn init(config: &LogConfig) -> Result<Option<Installed>, InitError> {
    if GUARD.get().is_some() {
        return Ok(None);
    }

    let (filter, throttled_dependencies) = match std::env::var(LOG_FILTER_ENV) {
        Ok(raw) => (raw, false),
        Err(_) => {
            let (directives, throttled) = directives_for(config.level, trace_deps_requested());
            (directives.join(","), throttled)
        }
    };
    let env_filter = EnvFilter::try_new(&filter)?;

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;
    let _ = GUARD.set(guard);

    if throttled_dependencies {
        info!(
            target = "peerline::telemetry",
            override_env = TRACE_DEPS_ENV,
            "dependency traces capped at info"
        );
    }
    Ok(Some(Installed {
        filter,
        throttled_dependencies,
    }))
}

fn trace_deps_requested() -> bool {
    matches!(std::env::var(TRACE_DEPS_ENV).as_deref(), Ok(value) if !value.is_empty() && value != "0")
}

/// Filter directives for `level`. Debug raises only peerline's own
/// targets; trace raises everything except the noisy dependencies unless
/// `trace_deps` is set. The flag reports whether any were capped.
fn directives_for(level: LogLevel, trace_deps: bool) -> (Vec<String>, bool) {
    let mut directives = match level {
        LogLevel::Debug => vec![
            "info".to_owned(),
            "peerline=debug".to_owned(),
            "peerline_core=debug".to_owned(),
        ],
        other => vec![other.as_str().to_owned()],
    };
    let throttle = level == LogLevel::Trace && !trace_deps;
    if throttle {
        directives.extend(NOISY_DEPENDENCIES.iter().map(|target| format!("{target}=info")));
    }
    (directives, throttle)
}

/// Leading bytes of `bytes` as spaced hex, with a count of what was cut.
pub fn frame_preview(bytes: &[u8], limit: usize) -> String {
    let shown = bytes.len().min(limit);
    let mut out = String::with_capacity(shown * 3 + 16);
    for (i, byte) in bytes[..shown].iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    if bytes.len() > shown {
        let _ = write!(out, " (+{} bytes)", bytes.len() - shown);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_raises_only_own_targets() {
        let (directives, throttled) = directives_for(LogLevel::Debug, false);
        assert!(!throttled);
        assert_eq!(directives, ["info", "peerline=debug", "peerline_core=debug"]);
    }

    #[test]
    fn trace_caps_dependencies_unless_requested() {
        let (directives, throttled) = directives_for(LogLevel::Trace, false);
        assert!(throttled);
        assert_eq!(directives[0], "trace");
        assert!(directives.iter().any(|d| d == "webrtc_ice=info"));

        let (directives, throttled) = directives_for(LogLevel::Trace, true);
        assert!(!throttled);
        assert_eq!(directives, ["trace"]);
    }

    #[test]
    fn every_level_yields_a_valid_filter() {
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            let (directives, _) = directives_for(level, false);
            assert!(EnvFilter::try_new(directives.join(",")).is_ok(), "{level:?}");
        }
        assert_eq!(LogLevel::default().as_str(), "warn");
    }

    #[test]
    fn preview_is_truncated_hex() {
        assert_eq!(frame_preview(&[0xc1, 0x00, 0x7f], 8), "c1 00 7f");
        assert_eq!(frame_preview(&[1, 2, 3, 4, 5], 2), "01 02 (+3 bytes)");
        assert_eq!(frame_preview(&[], 4), "");
    }
}
