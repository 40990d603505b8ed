use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ice::{CandidateType, IceCandidate, IceScheme, IceServer, candidate_kind};

const DEFAULT_TURN_PORT: u16 = 3478;
const SDP_CANDIDATE_PREFIX: &str = "a=candidate:";

/// Which candidates a session may advertise to its remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidatePolicy {
    #[default]
    Default,
    Direct,
    Server,
}

impl CandidatePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Direct => "direct",
            Self::Server => "server",
        }
    }

    fn admits(self, kind: CandidateType) -> bool {
        match self {
            Self::Default => true,
            Self::Direct => matches!(kind, CandidateType::Host | CandidateType::ServerReflexive),
            Self::Server => kind == CandidateType::Relay,
        }
    }

    /// Description lines this policy strips. Anything not listed here,
    /// peer-reflexive lines included, stays in the description.
    fn strips_line(self, kind: CandidateType) -> bool {
        match self {
            Self::Default => false,
            Self::Direct => kind == CandidateType::Relay,
            Self::Server => matches!(kind, CandidateType::Host | CandidateType::ServerReflexive),
        }
    }
}

impl fmt::Display for CandidatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown connection type {0:?}; expected default, direct or server")]
pub struct ParsePolicyError(String);

impl FromStr for CandidatePolicy {
    type Err = ParsePolicyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Ok(Self::Default),
            "direct" | "direct-only" | "p2p" => Ok(Self::Direct),
            "server" | "server-only" | "relay" => Ok(Self::Server),
            other => Err(ParsePolicyError(other.to_owned())),
        }
    }
}

/// Applies a [`CandidatePolicy`] to outbound candidates and session
/// descriptions. The TURN address is only consulted by the server policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePolicyFilter {
    policy: CandidatePolicy,
    turn_address: Option<IpAddr>,
}

impl CandidatePolicyFilter {
    pub fn new(policy: CandidatePolicy, turn_address: Option<IpAddr>) -> Self {
        Self {
            policy,
            turn_address,
        }
    }

    pub fn policy(&self) -> CandidatePolicy {
        self.policy
    }

    pub fn turn_address(&self) -> Option<IpAddr> {
        self.turn_address
    }

    /// Returns the candidate to advertise, or `None` when the policy drops it.
    /// Under the server policy a reflexive candidate is rewritten into a
    /// relay candidate at the TURN address when that address is known.
    pub fn filter_candidate(&self, candidate: &IceCandidate) -> Option<IceCandidate> {
        if self.policy == CandidatePolicy::Default {
            return Some(candidate.clone());
        }
        let kind = candidate.kind()?;
        if self.policy.admits(kind) {
            return Some(candidate.clone());
        }
        if self.policy == CandidatePolicy::Server && kind == CandidateType::ServerReflexive {
            let turn = self.turn_address?;
            let rewritten = candidate.rewritten(turn, CandidateType::Relay);
            if rewritten.is_some() {
                debug!(
                    target = "peerline::policy",
                    from = candidate.address().unwrap_or("?"),
                    to = %turn,
                    "rewrote reflexive candidate as relay"
                );
            }
            return rewritten;
        }
        None
    }

    /// Removes the `a=candidate:` lines of the types the policy strips.
    /// Every other line, including its line ending, is kept byte for byte.
    pub fn filter_description(&self, sdp: &str) -> String {
        if self.policy == CandidatePolicy::Default {
            return sdp.to_owned();
        }
        sdp.split_inclusive('\n')
            .filter(|line| {
                if !line.starts_with(SDP_CANDIDATE_PREFIX) {
                    return true;
                }
                !candidate_kind(line).is_some_and(|kind| self.policy.strips_line(kind))
            })
            .collect()
    }
}

/// Host of the last `turn:` server in the list, as advertised.
pub fn turn_host(servers: &[IceServer]) -> Option<String> {
    servers
        .iter()
        .filter(|server| server.scheme() == Some(IceScheme::Turn))
        .filter(|server| server.transport().is_none_or(|t| t == "udp"))
        .next_back()
        .and_then(IceServer::host)
}

/// Resolves the TURN address used to rewrite reflexive candidates. IP
/// literals are used directly; host names go through the async resolver
/// and the first IPv4 result wins.
pub async fn resolve_turn_address(servers: &[IceServer]) -> Option<IpAddr> {
    let host = turn_host(servers)?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    match tokio::net::lookup_host((host.as_str(), DEFAULT_TURN_PORT)).await {
        Ok(addrs) => {
            let addrs: Vec<_> = addrs.map(|addr| addr.ip()).collect();
            let chosen = addrs
                .iter()
                .copied()
                .find(IpAddr::is_ipv4)
                .or_else(|| addrs.first().copied());
            if chosen.is_none() {
                warn!(target = "peerline::policy", host = %host, "turn host resolved to no addresses");
            }
            chosen
        }
        Err(err) => {
            warn!(
                target = "peerline::policy",
                host = %host,
                error = %err,
                "failed to resolve turn host; reflexive candidates will be dropped"
            );
            None
        }
    }
}
