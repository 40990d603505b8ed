pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod ice;
pub mod platform;
pub mod policy;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use channel::{ChannelEvent, DataChannelSession};
pub use endpoint::{Endpoint, spawn_mailbox_pump};
pub use error::{ErrorKind, SessionError, SessionResult};
pub use session::{OpenOptions, PeerSession, SessionDeps, SessionEvent, SessionPhase};
