//! Framing and chunking for data-connection payloads.
//!
//! Some transport-engine implementations cap a single data-channel message at
//! 16 KiB, so every outbound payload is framed and split into chunks below
//! that limit. Chunks for one logical message share a message id and carry a
//! sequence index plus the declared total; the receiving side accumulates
//! them per message id and reconstructs the payload once the total is
//! reached, regardless of interleaving with other in-flight messages.

use std::collections::HashMap;

use bytes::Bytes;
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::warn;

/// First byte of every frame; anything else is rejected as malformed.
pub const FRAME_VERSION: u8 = 0xC5;
/// version + msg id (u64) + seq (u32) + total (u32).
const HEADER_LEN: usize = 1 + 8 + 4 + 4;

/// Interoperability limit observed by several engine implementations.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 16 * 1024;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_MAX_INFLIGHT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub max_chunk_bytes: usize,
    pub max_message_bytes: usize,
    /// Concurrent partially-received messages tolerated before the oldest is
    /// evicted.
    pub max_inflight: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }
}

impl ChunkConfig {
    pub fn from_env() -> Self {
        Self {
            max_chunk_bytes: usize_env(
                "COVE_MAX_CHUNK_BYTES",
                DEFAULT_MAX_CHUNK_BYTES,
                HEADER_LEN + 1,
            ),
            max_message_bytes: usize_env(
                "COVE_MAX_MESSAGE_BYTES",
                DEFAULT_MAX_MESSAGE_BYTES,
                HEADER_LEN + 1,
            ),
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }

    /// Payload bytes that fit in one chunk after the header.
    pub fn payload_capacity(&self) -> usize {
        self.max_chunk_bytes.saturating_sub(HEADER_LEN).max(1)
    }
}

/// Process-wide config resolved once from the environment.
pub fn runtime_config() -> &'static ChunkConfig {
    static CONFIG: Lazy<ChunkConfig> = Lazy::new(ChunkConfig::from_env);
    &CONFIG
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("message exceeds max size: {0} bytes")]
    MessageTooLarge(usize),
    #[error("chunk frame malformed: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub msg_id: u64,
    pub seq: u32,
    pub total: u32,
    pub payload: Bytes,
}

pub fn split_message(
    payload: &[u8],
    msg_id: u64,
    config: &ChunkConfig,
) -> Result<Vec<ChunkFrame>, ChunkError> {
    if payload.len() > config.max_message_bytes {
        return Err(ChunkError::MessageTooLarge(payload.len()));
    }
    if payload.is_empty() {
        return Ok(vec![ChunkFrame {
            msg_id,
            seq: 0,
            total: 1,
            payload: Bytes::new(),
        }]);
    }

    let capacity = config.payload_capacity();
    let chunks: Vec<&[u8]> = payload.chunks(capacity).collect();
    let total =
        u32::try_from(chunks.len()).map_err(|_| ChunkError::Malformed("chunk total overflow"))?;

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(seq, chunk)| ChunkFrame {
            msg_id,
            seq: seq as u32,
            total,
            payload: Bytes::copy_from_slice(chunk),
        })
        .collect())
}

pub fn encode_frame(frame: &ChunkFrame) -> Bytes {
    let mut buf = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    buf.push(FRAME_VERSION);
    buf.extend_from_slice(&frame.msg_id.to_be_bytes());
    buf.extend_from_slice(&frame.seq.to_be_bytes());
    buf.extend_from_slice(&frame.total.to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    Bytes::from(buf)
}

pub fn decode_frame(bytes: &[u8]) -> Result<ChunkFrame, ChunkError> {
    if bytes.first().copied() != Some(FRAME_VERSION) {
        return Err(ChunkError::Malformed("unknown frame version"));
    }
    if bytes.len() < HEADER_LEN {
        return Err(ChunkError::Malformed("frame shorter than header"));
    }
    let msg_id = u64::from_be_bytes(bytes[1..9].try_into().unwrap());
    let seq = u32::from_be_bytes(bytes[9..13].try_into().unwrap());
    let total = u32::from_be_bytes(bytes[13..17].try_into().unwrap());
    if total == 0 {
        return Err(ChunkError::Malformed("chunk total cannot be zero"));
    }
    if seq >= total {
        return Err(ChunkError::Malformed("chunk seq exceeds total"));
    }
    Ok(ChunkFrame {
        msg_id,
        seq,
        total,
        payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
    })
}

#[derive(Debug)]
struct Accumulator {
    arrival: u64,
    total: u32,
    received: u32,
    received_bytes: usize,
    chunks: Vec<Option<Bytes>>,
}

/// Per-message chunk accumulator. Strictly FIFO within one message id; two
/// interleaved messages never share state, and an accumulator entry is removed
/// before its payload is handed back so a reused id starts clean.
#[derive(Debug, Default)]
pub struct Reassembler {
    partials: HashMap<u64, Accumulator>,
    arrivals: u64,
    config: ChunkConfig,
}

impl Reassembler {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            partials: HashMap::new(),
            arrivals: 0,
            config,
        }
    }

    /// Feeds one frame; returns the reconstructed payload once the declared
    /// total is reached.
    pub fn ingest(&mut self, frame: ChunkFrame) -> Result<Option<Bytes>, ChunkError> {
        if frame.seq >= frame.total {
            return Err(ChunkError::Malformed("chunk seq out of range"));
        }
        if frame.total == 1 {
            if frame.payload.len() > self.config.max_message_bytes {
                return Err(ChunkError::MessageTooLarge(frame.payload.len()));
            }
            return Ok(Some(frame.payload));
        }

        if self.partials.len() >= self.config.max_inflight
            && !self.partials.contains_key(&frame.msg_id)
        {
            self.evict_oldest();
        }

        self.arrivals += 1;
        let arrival = self.arrivals;
        let entry = self.partials.entry(frame.msg_id).or_insert_with(|| {
            Accumulator {
                arrival,
                total: frame.total,
                received: 0,
                received_bytes: 0,
                chunks: vec![None; frame.total as usize],
            }
        });

        if entry.total != frame.total {
            self.partials.remove(&frame.msg_id);
            return Err(ChunkError::Malformed("chunk total changed mid-message"));
        }
        let seq = frame.seq as usize;
        if entry.chunks[seq].is_none() {
            entry.received_bytes += frame.payload.len();
            entry.chunks[seq] = Some(frame.payload);
            entry.received += 1;
        }
        if entry.received_bytes > self.config.max_message_bytes {
            let size = entry.received_bytes;
            self.partials.remove(&frame.msg_id);
            return Err(ChunkError::MessageTooLarge(size));
        }
        if entry.received < entry.total {
            return Ok(None);
        }

        // Complete: drop the accumulator before handing the payload back.
        let entry = self.partials.remove(&frame.msg_id).expect("entry present");
        let mut combined = Vec::with_capacity(entry.received_bytes);
        for chunk in entry.chunks {
            match chunk {
                Some(payload) => combined.extend_from_slice(&payload),
                None => return Err(ChunkError::Malformed("missing chunk at completion")),
            }
        }
        Ok(Some(Bytes::from(combined)))
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .partials
            .iter()
            .min_by_key(|(_, acc)| acc.arrival)
            .map(|(id, _)| *id)
        {
            warn!(
                target = "cove::chunk",
                msg_id = oldest,
                "inflight accumulator cap reached; dropping oldest partial message"
            );
            self.partials.remove(&oldest);
        }
    }
}

fn usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "cove::chunk",
                    var, parsed, min, "chunk config below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "cove::chunk",
                    var,
                    error = %err,
                    "unparseable chunk config; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            max_chunk_bytes: 32,
            max_message_bytes: 4096,
            max_inflight: 8,
        }
    }

    #[test]
    fn split_encode_decode_reassemble() {
        let config = small_config();
        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
        let frames = split_message(&payload, 11, &config).unwrap();
        assert!(frames.len() > 1);

        let mut reassembler = Reassembler::new(config);
        let mut recovered = None;
        for frame in &frames {
            let decoded = decode_frame(&encode_frame(frame)).unwrap();
            assert_eq!(&decoded, frame);
            if let Some(done) = reassembler.ingest(decoded).unwrap() {
                recovered = Some(done);
            }
        }
        assert_eq!(recovered.as_deref(), Some(payload.as_slice()));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn interleaved_messages_do_not_cross_contaminate() {
        let config = small_config();
        let first = vec![b'a'; 100];
        let second = vec![b'b'; 100];
        let frames_a = split_message(&first, 1, &config).unwrap();
        let frames_b = split_message(&second, 2, &config).unwrap();

        let mut reassembler = Reassembler::new(config);
        let mut done = Vec::new();
        // Alternate chunks of the two messages.
        let mut iter_a = frames_a.into_iter();
        let mut iter_b = frames_b.into_iter();
        loop {
            let mut progressed = false;
            for frame in [iter_a.next(), iter_b.next()].into_iter().flatten() {
                progressed = true;
                if let Some(payload) = reassembler.ingest(frame).unwrap() {
                    done.push(payload);
                }
            }
            if !progressed {
                break;
            }
        }
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].as_ref(), first.as_slice());
        assert_eq!(done[1].as_ref(), second.as_slice());
    }

    #[test]
    fn duplicate_chunks_are_absorbed() {
        let config = small_config();
        let payload = vec![b'z'; 60];
        let frames = split_message(&payload, 3, &config).unwrap();
        let mut reassembler = Reassembler::new(config);

        let mut recovered = None;
        // Feed the first frame twice before the rest.
        for frame in std::iter::once(frames[0].clone()).chain(frames) {
            if let Some(done) = reassembler.ingest(frame).unwrap() {
                recovered = Some(done);
            }
        }
        assert_eq!(recovered.as_deref(), Some(payload.as_slice()));
    }

    #[test]
    fn reused_id_starts_clean_after_completion() {
        let config = small_config();
        let first = vec![b'x'; 40];
        let second = vec![b'y'; 40];
        let mut reassembler = Reassembler::new(config);

        for payload in [&first, &second] {
            let mut recovered = None;
            for frame in split_message(payload, 9, &config).unwrap() {
                if let Some(done) = reassembler.ingest(frame).unwrap() {
                    recovered = Some(done);
                }
            }
            assert_eq!(recovered.as_deref(), Some(payload.as_slice()));
        }
    }

    #[test]
    fn oversize_message_rejected_on_split() {
        let config = ChunkConfig {
            max_chunk_bytes: 32,
            max_message_bytes: 64,
            max_inflight: 8,
        };
        let err = split_message(&vec![0u8; 128], 1, &config).unwrap_err();
        assert!(matches!(err, ChunkError::MessageTooLarge(128)));
    }

    #[test]
    fn malformed_frames_rejected() {
        assert!(decode_frame(&[]).is_err());
        assert!(decode_frame(&[0x00, 1, 2, 3]).is_err());
        let frame = ChunkFrame {
            msg_id: 1,
            seq: 2,
            total: 2,
            payload: Bytes::new(),
        };
        let mut reassembler = Reassembler::new(small_config());
        assert!(reassembler.ingest(frame).is_err());
    }
}
