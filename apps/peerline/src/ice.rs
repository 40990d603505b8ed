//! ICE candidate and server descriptors shared by the policy filter, the
//! signaling wire format and the platform seam.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::{Host, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "host" => Some(Self::Host),
            "srflx" => Some(Self::ServerReflexive),
            "prflx" => Some(Self::PeerReflexive),
            "relay" => Some(Self::Relay),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transport-address proposal, in SDP attribute syntax
/// (`candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type> ...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, mline_index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(mline_index);
        self
    }

    fn typ_position(fields: &[&str]) -> Option<usize> {
        fields.iter().position(|field| *field == "typ")
    }

    pub fn kind(&self) -> Option<CandidateType> {
        candidate_kind(&self.candidate)
    }

    /// Connection address: the field two positions before `typ`.
    pub fn address(&self) -> Option<&str> {
        let fields: Vec<&str> = self.candidate.split_whitespace().collect();
        let typ = Self::typ_position(&fields)?;
        let index = typ.checked_sub(2)?;
        fields.get(index).copied()
    }

    /// Copy with the connection address and the candidate type replaced.
    pub fn rewritten(&self, address: IpAddr, kind: CandidateType) -> Option<IceCandidate> {
        let mut fields: Vec<String> = self
            .candidate
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        let borrowed: Vec<&str> = fields.iter().map(String::as_str).collect();
        let typ = Self::typ_position(&borrowed)?;
        let address_index = typ.checked_sub(2)?;
        if typ + 1 >= fields.len() {
            return None;
        }
        fields[address_index] = address.to_string();
        fields[typ + 1] = kind.as_str().to_owned();
        Some(IceCandidate {
            candidate: fields.join(" "),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
        })
    }
}

/// Candidate type of a raw candidate attribute or SDP `a=candidate:` line.
pub fn candidate_kind(line: &str) -> Option<CandidateType> {
    let mut fields = line.split_whitespace();
    fields.by_ref().find(|field| *field == "typ")?;
    fields.next().and_then(CandidateType::from_token)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceScheme {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl IceScheme {
    pub fn is_turn(self) -> bool {
        matches!(self, Self::Turn | Self::Turns)
    }
}

/// STUN/TURN server entry as produced by the credential collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// `turn:host:port` carries its authority in the path; it is re-read
    /// as `turn://host:port` so host and port come from the parser.
    fn parsed(&self) -> Option<Url> {
        let url = Url::parse(self.url.trim()).ok()?;
        if !url.cannot_be_a_base() {
            return Some(url);
        }
        let mut authority = format!("{}://{}", url.scheme(), url.path());
        if let Some(query) = url.query() {
            authority.push('?');
            authority.push_str(query);
        }
        Url::parse(&authority).ok()
    }

    pub fn scheme(&self) -> Option<IceScheme> {
        match self.parsed()?.scheme() {
            "stun" => Some(IceScheme::Stun),
            "stuns" => Some(IceScheme::Stuns),
            "turn" => Some(IceScheme::Turn),
            "turns" => Some(IceScheme::Turns),
            _ => None,
        }
    }

    /// Host part of the URL; user-info, port and query are not included.
    pub fn host(&self) -> Option<String> {
        let host = match self.parsed()?.host()? {
            Host::Domain(domain) => domain.to_owned(),
            Host::Ipv4(addr) => addr.to_string(),
            Host::Ipv6(addr) => addr.to_string(),
        };
        if host.is_empty() { None } else { Some(host) }
    }

    pub fn port(&self) -> Option<u16> {
        self.parsed()?.port()
    }

    /// Value of the `transport` query parameter, lowercased.
    pub fn transport(&self) -> Option<String> {
        self.parsed()?
            .query_pairs()
            .find(|(key, _)| key.eq_ignore_ascii_case("transport"))
            .map(|(_, value)| value.to_ascii_lowercase())
    }
}

/// Cleans up collaborator output before it reaches the platform: trims
/// whitespace and trailing `/`, drops entries with an unknown scheme and
/// strips credentials from STUN entries.
pub fn normalize_servers(servers: &[IceServer]) -> Vec<IceServer> {
    servers
        .iter()
        .filter_map(|server| {
            let url = server.url.trim().trim_end_matches('/').to_owned();
            let mut normalized = IceServer {
                url,
                username: server.username.clone(),
                credential: server.credential.clone(),
            };
            match normalized.scheme() {
                Some(scheme) if scheme.is_turn() => Some(normalized),
                Some(_) => {
                    normalized.username = None;
                    normalized.credential = None;
                    Some(normalized)
                }
                None => {
                    warn!(
                        target = "peerline::ice",
                        url = %server.url,
                        "dropping ice server with unknown scheme"
                    );
                    None
                }
            }
        })
        .collect()
}
