//! Outbound pipeline: serialize → fragment → frame → retry buffer.
//! Inbound: frame decode → reassemble → deserialize.

pub mod chunk;
pub mod codec;
pub mod sender;

pub use chunk::{ChunkConfig, ChunkError, DropReason, DroppedSet, Fragment, Reassembler};
pub use codec::CodecError;
pub use sender::{DrainOutcome, RetryBuffer};
