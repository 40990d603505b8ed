use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{parse_duration_ms_env, parse_usize_env};

pub const FRAME_VERSION: u8 = 0xC1;
pub const HEADER_LEN: usize = 1 + 16 + 4 + 4;
pub const DEFAULT_MAX_FRAGMENT_BYTES: usize = 16_300;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_INFLIGHT: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Payload bytes carried by one fragment; the frame header comes on top.
    pub max_fragment_bytes: usize,
    pub max_message_bytes: usize,
    pub max_inflight: usize,
    pub idle_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_fragment_bytes: DEFAULT_MAX_FRAGMENT_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl ChunkConfig {
    pub fn from_env() -> Self {
        Self {
            max_fragment_bytes: parse_usize_env(
                "PEERLINE_MAX_FRAGMENT_BYTES",
                DEFAULT_MAX_FRAGMENT_BYTES,
                1,
            ),
            max_message_bytes: parse_usize_env(
                "PEERLINE_MAX_MESSAGE_BYTES",
                DEFAULT_MAX_MESSAGE_BYTES,
                1,
            ),
            max_inflight: parse_usize_env(
                "PEERLINE_REASSEMBLY_MAX_INFLIGHT",
                DEFAULT_MAX_INFLIGHT,
                1,
            ),
            idle_timeout: parse_duration_ms_env(
                "PEERLINE_REASSEMBLY_IDLE_MS",
                DEFAULT_IDLE_TIMEOUT,
                1,
            ),
            retry_backoff: parse_duration_ms_env(
                "PEERLINE_RETRY_BACKOFF_MS",
                DEFAULT_RETRY_BACKOFF,
                1,
            ),
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        HEADER_LEN.saturating_add(self.max_fragment_bytes)
    }

    pub fn max_fragments(&self) -> usize {
        self.max_message_bytes.div_ceil(self.max_fragment_bytes.max(1)).max(1)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("message exceeds max size: {0} bytes")]
    MessageTooLarge(usize),
    #[error("fragment frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("unsupported frame version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("fragment frame malformed: {0}")]
    Malformed(&'static str),
}

/// One frame-sized piece of a serialized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub set_id: u128,
    pub index: u32,
    pub total: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Idle,
    Capacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedSet {
    pub set_id: u128,
    pub reason: DropReason,
    pub received: u32,
    pub total: u32,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub completed: Option<Bytes>,
    pub dropped: Vec<DroppedSet>,
}

#[derive(Debug)]
struct PartialSet {
    last_seen: Instant,
    total: u32,
    fragments: Vec<Option<Bytes>>,
    received: u32,
    received_bytes: usize,
}

impl PartialSet {
    fn new(total: u32, now: Instant) -> Self {
        Self {
            last_seen: now,
            total,
            fragments: vec![None; total as usize],
            received: 0,
            received_bytes: 0,
        }
    }

    fn dropped(&self, set_id: u128, reason: DropReason) -> DroppedSet {
        DroppedSet {
            set_id,
            reason,
            received: self.received,
            total: self.total,
        }
    }
}

/// Collects fragments per set id until every index has arrived, then
/// yields the concatenation in index order exactly once.
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<u128, PartialSet>,
    config: ChunkConfig,
}

impl Reassembler {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            partials: HashMap::new(),
            config,
        }
    }

    pub fn pending_sets(&self) -> usize {
        self.partials.len()
    }

    pub fn ingest(&mut self, fragment: Fragment, now: Instant) -> Result<IngestOutcome, ChunkError> {
        let mut outcome = IngestOutcome::default();

        validate_bounds(&fragment, &self.config)?;
        if fragment.total == 1 {
            outcome.completed = Some(fragment.payload);
            return Ok(outcome);
        }

        let Fragment {
            set_id,
            index,
            total,
            payload,
        } = fragment;

        if !self.partials.contains_key(&set_id) && self.partials.len() >= self.config.max_inflight {
            if let Some(evicted) = self.evict_oldest() {
                outcome.dropped.push(evicted);
            }
        }

        let entry = self
            .partials
            .entry(set_id)
            .or_insert_with(|| PartialSet::new(total, now));

        if entry.total != total {
            self.partials.remove(&set_id);
            return Err(ChunkError::Malformed("fragment total changed for set"));
        }

        entry.last_seen = now;
        let slot = &mut entry.fragments[index as usize];
        if slot.is_none() {
            entry.received_bytes = entry.received_bytes.saturating_add(payload.len());
            *slot = Some(payload);
            entry.received += 1;
        }

        if entry.received_bytes > self.config.max_message_bytes {
            let size = entry.received_bytes;
            self.partials.remove(&set_id);
            return Err(ChunkError::MessageTooLarge(size));
        }

        if entry.received == entry.total {
            let Some(partial) = self.partials.remove(&set_id) else {
                return Ok(outcome);
            };
            let mut combined = Vec::with_capacity(partial.received_bytes);
            for piece in partial.fragments.iter().flatten() {
                combined.extend_from_slice(piece);
            }
            outcome.completed = Some(Bytes::from(combined));
        }

        Ok(outcome)
    }

    /// Drops sets that have not seen a fragment within the idle timeout.
    pub fn gc(&mut self, now: Instant) -> Vec<DroppedSet> {
        let mut dropped = Vec::new();
        let idle_timeout = self.config.idle_timeout;
        self.partials.retain(|set_id, partial| {
            let expired = now.saturating_duration_since(partial.last_seen) > idle_timeout;
            if expired {
                dropped.push(partial.dropped(*set_id, DropReason::Idle));
            }
            !expired
        });
        dropped
    }

    fn evict_oldest(&mut self) -> Option<DroppedSet> {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, partial)| partial.last_seen)
            .map(|(set_id, _)| *set_id)?;
        self.partials
            .remove(&oldest)
            .map(|partial| partial.dropped(oldest, DropReason::Capacity))
    }
}

/// Fresh identifier for one logical message.
pub fn new_set_id() -> u128 {
    Uuid::new_v4().as_u128()
}

pub fn split_message(
    payload: &[u8],
    set_id: u128,
    config: &ChunkConfig,
) -> Result<Vec<Fragment>, ChunkError> {
    if payload.len() > config.max_message_bytes {
        return Err(ChunkError::MessageTooLarge(payload.len()));
    }

    if payload.is_empty() {
        return Ok(vec![Fragment {
            set_id,
            index: 0,
            total: 1,
            payload: Bytes::new(),
        }]);
    }

    let pieces: Vec<&[u8]> = payload.chunks(config.max_fragment_bytes.max(1)).collect();
    let total =
        u32::try_from(pieces.len()).map_err(|_| ChunkError::Malformed("fragment total overflow"))?;

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| {
            let index = u32::try_from(index)
                .map_err(|_| ChunkError::Malformed("fragment index overflowed u32"))?;
            Ok(Fragment {
                set_id,
                index,
                total,
                payload: Bytes::copy_from_slice(piece),
            })
        })
        .collect()
}

pub fn encode_frame(fragment: &Fragment) -> Bytes {
    let mut buf = Vec::with_capacity(HEADER_LEN.saturating_add(fragment.payload.len()));
    buf.push(FRAME_VERSION);
    buf.extend_from_slice(&fragment.set_id.to_be_bytes());
    buf.extend_from_slice(&fragment.index.to_be_bytes());
    buf.extend_from_slice(&fragment.total.to_be_bytes());
    buf.extend_from_slice(&fragment.payload);
    Bytes::from(buf)
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, ChunkError> {
    bytes
        .get(at..at + 4)
        .and_then(|slice| <[u8; 4]>::try_from(slice).ok())
        .map(u32::from_be_bytes)
        .ok_or(ChunkError::Malformed("frame header truncated"))
}

pub fn decode_frame(bytes: &[u8], config: &ChunkConfig) -> Result<Fragment, ChunkError> {
    let version = bytes
        .first()
        .copied()
        .ok_or(ChunkError::Malformed("empty frame"))?;
    if version != FRAME_VERSION {
        return Err(ChunkError::UnsupportedVersion(version));
    }
    if bytes.len() < HEADER_LEN {
        return Err(ChunkError::Malformed("frame too short"));
    }
    if bytes.len() > config.max_frame_bytes() {
        return Err(ChunkError::FrameTooLarge(bytes.len()));
    }
    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&bytes[1..17]);
    let fragment = Fragment {
        set_id: u128::from_be_bytes(id_bytes),
        index: read_u32(bytes, 17)?,
        total: read_u32(bytes, 21)?,
        payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
    };
    validate_bounds(&fragment, config)?;
    Ok(fragment)
}

fn validate_bounds(fragment: &Fragment, config: &ChunkConfig) -> Result<(), ChunkError> {
    if fragment.total == 0 {
        return Err(ChunkError::Malformed("fragment total cannot be zero"));
    }
    if fragment.index >= fragment.total {
        return Err(ChunkError::Malformed("fragment index out of range"));
    }
    if fragment.payload.len() > config.max_fragment_bytes {
        return Err(ChunkError::FrameTooLarge(fragment.payload.len()));
    }
    if fragment.total as usize > config.max_fragments() {
        return Err(ChunkError::MessageTooLarge(
            (fragment.total as usize).saturating_mul(config.max_fragment_bytes),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{seq::SliceRandom, thread_rng};

    fn small_config(max_fragment_bytes: usize) -> ChunkConfig {
        ChunkConfig {
            max_fragment_bytes,
            max_message_bytes: 1024,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            idle_timeout: Duration::from_secs(1),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    #[test]
    fn fifty_thousand_bytes_split_into_four_fragments() {
        let config = ChunkConfig::default();
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let fragments = split_message(&payload, 11, &config).expect("split");
        let sizes: Vec<usize> = fragments.iter().map(|f| f.payload.len()).collect();
        assert_eq!(sizes, vec![16_300, 16_300, 16_300, 1_100]);
        assert!(fragments.iter().all(|f| f.total == 4 && f.set_id == 11));
        assert_eq!(
            fragments.iter().map(|f| f.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn reverse_order_reassembles_exactly_once() {
        let config = ChunkConfig::default();
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        let fragments = split_message(&payload, 12, &config).expect("split");

        let mut reassembler = Reassembler::new(config);
        let mut completions = Vec::new();
        for fragment in fragments.into_iter().rev() {
            let outcome = reassembler
                .ingest(fragment, Instant::now())
                .expect("ingest");
            completions.extend(outcome.completed);
        }
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].as_ref(), payload.as_slice());
        assert_eq!(reassembler.pending_sets(), 0);
    }

    #[test]
    fn single_fragment_bypasses_table() {
        let config = ChunkConfig::default();
        let fragments = split_message(b"hello", 13, &config).expect("split");
        assert_eq!(fragments.len(), 1);
        let mut reassembler = Reassembler::new(config);
        let outcome = reassembler
            .ingest(fragments[0].clone(), Instant::now())
            .expect("ingest");
        assert_eq!(outcome.completed.as_deref(), Some(&b"hello"[..]));
        assert_eq!(reassembler.pending_sets(), 0);
    }

    #[test]
    fn empty_message_is_one_empty_fragment() {
        let fragments = split_message(b"", 14, &ChunkConfig::default()).expect("split");
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].total, 1);
        assert!(fragments[0].payload.is_empty());
    }

    #[test]
    fn shuffled_and_duplicate_fragments_reassemble() {
        let config = small_config(4);
        let payload = b"abcdefghijklmnopqrstuvwxyz".to_vec();
        let fragments = split_message(&payload, 42, &config).expect("split");
        assert!(fragments.len() > 2);

        let mut shuffled = fragments.clone();
        shuffled.shuffle(&mut thread_rng());
        shuffled.insert(1, fragments[0].clone());

        let mut reassembler = Reassembler::new(config);
        let mut recovered = Vec::new();
        for fragment in shuffled {
            let outcome = reassembler
                .ingest(fragment, Instant::now())
                .expect("ingest");
            recovered.extend(outcome.completed);
        }
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].as_ref(), payload.as_slice());
    }

    #[test]
    fn duplicate_after_completion_starts_fresh_set() {
        let config = small_config(4);
        let fragments = split_message(b"abcdefgh", 5, &config).expect("split");
        let mut reassembler = Reassembler::new(config);
        for fragment in &fragments {
            reassembler.ingest(fragment.clone(), Instant::now()).expect("ingest");
        }
        let outcome = reassembler
            .ingest(fragments[0].clone(), Instant::now())
            .expect("ingest duplicate");
        assert!(outcome.completed.is_none());
        assert_eq!(reassembler.pending_sets(), 1);
    }

    #[test]
    fn total_mismatch_discards_set() {
        let config = small_config(4);
        let mut reassembler = Reassembler::new(config);
        let now = Instant::now();
        reassembler
            .ingest(
                Fragment { set_id: 1, index: 0, total: 3, payload: Bytes::from_static(b"ab") },
                now,
            )
            .expect("first");
        let err = reassembler
            .ingest(
                Fragment { set_id: 1, index: 1, total: 2, payload: Bytes::from_static(b"cd") },
                now,
            )
            .unwrap_err();
        assert_eq!(err, ChunkError::Malformed("fragment total changed for set"));
        assert_eq!(reassembler.pending_sets(), 0);
    }

    #[test]
    fn idle_sets_are_collected() {
        let config = small_config(4);
        let mut reassembler = Reassembler::new(config);
        let start = Instant::now();
        reassembler
            .ingest(
                Fragment { set_id: 9, index: 0, total: 2, payload: Bytes::from_static(b"he") },
                start,
            )
            .expect("ingest");
        assert!(reassembler.gc(start + Duration::from_millis(500)).is_empty());
        let dropped = reassembler.gc(start + Duration::from_secs(2));
        assert_eq!(
            dropped,
            vec![DroppedSet { set_id: 9, reason: DropReason::Idle, received: 1, total: 2 }]
        );
        assert_eq!(reassembler.pending_sets(), 0);
    }

    #[test]
    fn capacity_evicts_oldest_set() {
        let config = ChunkConfig { max_inflight: 2, ..small_config(4) };
        let mut reassembler = Reassembler::new(config);
        let start = Instant::now();
        for (offset, set_id) in [1u128, 2, 3].into_iter().enumerate() {
            let outcome = reassembler
                .ingest(
                    Fragment { set_id, index: 0, total: 2, payload: Bytes::from_static(b"xx") },
                    start + Duration::from_millis(offset as u64),
                )
                .expect("ingest");
            if set_id == 3 {
                assert_eq!(outcome.dropped.len(), 1);
                assert_eq!(outcome.dropped[0].set_id, 1);
                assert_eq!(outcome.dropped[0].reason, DropReason::Capacity);
            } else {
                assert!(outcome.dropped.is_empty());
            }
        }
        assert_eq!(reassembler.pending_sets(), 2);
    }

    #[test]
    fn oversize_rejected() {
        let config = small_config(16);
        let err = split_message(&[0u8; 2048], 5, &config).expect_err("expected oversize error");
        assert_eq!(err, ChunkError::MessageTooLarge(2048));
    }

    #[test]
    fn frames_survive_the_wire() {
        let config = ChunkConfig::default();
        let payload = vec![7u8; 40 * 1024];
        let frames: Vec<Bytes> = split_message(&payload, 1234, &config)
            .expect("split")
            .iter()
            .map(encode_frame)
            .collect();
        assert!(frames.iter().all(|f| f.len() <= config.max_frame_bytes()));

        let mut reassembler = Reassembler::new(config);
        let mut recovered = None;
        for bytes in frames {
            let fragment = decode_frame(&bytes, &config).expect("decode");
            let outcome = reassembler.ingest(fragment, Instant::now()).expect("ingest");
            if outcome.completed.is_some() {
                recovered = outcome.completed;
            }
        }
        assert_eq!(recovered.as_deref(), Some(payload.as_slice()));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let config = small_config(4);
        assert_eq!(decode_frame(&[], &config), Err(ChunkError::Malformed("empty frame")));
        assert_eq!(decode_frame(&[0x01, 0, 0], &config), Err(ChunkError::UnsupportedVersion(0x01)));
        assert_eq!(
            decode_frame(&[FRAME_VERSION, 0, 0], &config),
            Err(ChunkError::Malformed("frame too short"))
        );
        let bad_index = encode_frame(&Fragment {
            set_id: 1,
            index: 2,
            total: 2,
            payload: Bytes::from_static(b"ab"),
        });
        assert_eq!(
            decode_frame(&bad_index, &config),
            Err(ChunkError::Malformed("fragment index out of range"))
        );
    }
}
