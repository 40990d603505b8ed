use std::fmt;

/// Lifecycle of a [`PeerSession`](super::PeerSession). Phases only move
/// forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SessionPhase {
    #[default]
    NotOpened,
    Opening,
    Establishing,
    Established,
    Closing,
    Closed,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotOpened => "not_opened",
            Self::Opening => "opening",
            Self::Establishing => "establishing",
            Self::Established => "established",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    pub fn can_advance_to(self, next: SessionPhase) -> bool {
        next > self
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
