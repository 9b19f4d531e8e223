//! Chunk codec: payload encoding, size checks, splitting, and reassembly.
//!
//! Outbound: [`encode`] → [`check_size`] → [`split`] into [`ChunkEnvelope`]s.
//! Inbound: [`Reassembler::accept`] each envelope until it reports
//! [`ChunkStatus::Complete`], then [`decode`].
//!
//! Reassembly puts slots back in index order, so out-of-order arrival is
//! fine. A repeated index is dropped (first copy wins). Any envelope that
//! contradicts the buffer already open for its key discards that buffer.

use std::collections::{HashMap, HashSet};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;
use crate::protocol::{ChunkEnvelope, Progress};

/// Serialize a payload to bytes.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(payload)?)
}

/// Deserialize a payload from bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// The lesser of the local cap and the peer-advertised cap, if any.
pub fn effective_max(local: usize, remote: Option<usize>) -> usize {
    remote.map_or(local, |remote| local.min(remote))
}

/// Reject `len` bytes when it exceeds `max`.
pub fn check_size(len: usize, max: usize) -> Result<(), ProtocolError> {
    if len > max {
        return Err(ProtocolError::PayloadTooLarge { size: len, max });
    }
    Ok(())
}

/// Split `bytes` into slices of at most `chunk_size` bytes.
///
/// Always yields at least one slice, so an empty payload is one empty chunk.
pub fn chunk(bytes: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if bytes.is_empty() {
        return vec![bytes];
    }
    bytes.chunks(chunk_size.max(1)).collect()
}

/// Split `bytes` into envelopes for `key`.
pub fn split(key: &str, bytes: &[u8], chunk_size: usize) -> Result<Vec<ChunkEnvelope>, ProtocolError> {
    let byte_length = u32::try_from(bytes.len()).map_err(|_| ProtocolError::PayloadTooLarge {
        size: bytes.len(),
        max: u32::MAX as usize,
    })?;
    let slices = chunk(bytes, chunk_size);
    let size = slices.len() as u32;
    Ok(slices
        .into_iter()
        .enumerate()
        .map(|(index, data)| ChunkEnvelope {
            key: key.to_string(),
            size,
            index: index as u32,
            byte_length,
            data: data.to_vec(),
        })
        .collect())
}

/// Concatenate slots in index order.
///
/// Fails when any slot is still empty.
pub fn reassemble(slots: Vec<Option<Vec<u8>>>) -> Result<Vec<u8>, ProtocolError> {
    let total: usize = slots.iter().flatten().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    for (index, slot) in slots.into_iter().enumerate() {
        let data = slot.ok_or_else(|| ProtocolError::Reassembly(format!("missing chunk {index}")))?;
        out.extend_from_slice(&data);
    }
    Ok(out)
}

/// Per-key accumulator of chunks awaiting completion.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    size: u32,
    byte_length: u32,
    slots: Vec<Option<Vec<u8>>>,
    filled: u32,
    received: usize,
}

impl ReassemblyBuffer {
    fn new(size: u32, byte_length: u32) -> Self {
        Self {
            size,
            byte_length,
            slots: vec![None; size as usize],
            filled: 0,
            received: 0,
        }
    }

    fn progress(&self) -> Progress {
        Progress {
            total: self.size,
            done: self.filled,
        }
    }

    fn is_complete(&self) -> bool {
        self.filled == self.size
    }

    fn into_bytes(self) -> Result<Vec<u8>, ProtocolError> {
        let expected = self.byte_length as usize;
        let bytes = reassemble(self.slots)?;
        if bytes.len() != expected {
            return Err(ProtocolError::Reassembly(format!(
                "expected {expected} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

/// Outcome of accepting one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Stored; more chunks outstanding.
    Pending(Progress),
    /// Index already filled; chunk dropped.
    Duplicate(Progress),
    /// Key was already rejected; remaining chunks are swallowed.
    Discarded,
    /// Last chunk stored; the buffer is gone and this is the payload.
    Complete {
        /// Final progress (`done == total`).
        progress: Progress,
        /// Reassembled payload bytes.
        bytes: Vec<u8>,
    },
}

/// All open reassembly buffers for one connection.
#[derive(Debug)]
pub struct Reassembler {
    buffers: HashMap<String, ReassemblyBuffer>,
    rejected: HashSet<String>,
    max_message_size: usize,
}

impl Reassembler {
    /// Create a reassembler that refuses messages larger than `max_message_size`.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            rejected: HashSet::new(),
            max_message_size,
        }
    }

    /// Store one chunk.
    ///
    /// # Errors
    ///
    /// `PayloadTooLarge` when a new key declares more than the cap;
    /// `Reassembly` when the envelope is malformed or contradicts the open
    /// buffer. Either way no buffer remains for the key, and the rest of
    /// that message's chunks come back as [`ChunkStatus::Discarded`] so the
    /// caller reports the failure once.
    pub fn accept(&mut self, envelope: ChunkEnvelope) -> Result<ChunkStatus, ProtocolError> {
        let is_last = envelope.index.saturating_add(1) >= envelope.size;
        if self.rejected.contains(&envelope.key) {
            if is_last {
                self.rejected.remove(&envelope.key);
            }
            return Ok(ChunkStatus::Discarded);
        }

        let key = envelope.key.clone();
        let result = self.store(envelope);
        if result.is_err() && !is_last {
            self.rejected.insert(key);
        }
        result
    }

    fn store(&mut self, envelope: ChunkEnvelope) -> Result<ChunkStatus, ProtocolError> {
        let ChunkEnvelope {
            key,
            size,
            index,
            byte_length,
            data,
        } = envelope;

        if size == 0 || index >= size {
            self.buffers.remove(&key);
            return Err(ProtocolError::Reassembly(format!(
                "chunk index {index} out of range for size {size}"
            )));
        }

        if let Some(existing) = self.buffers.get(&key) {
            if existing.size != size || existing.byte_length != byte_length {
                self.buffers.remove(&key);
                return Err(ProtocolError::Reassembly(format!(
                    "chunk header changed mid-message for key {key}"
                )));
            }
        } else {
            check_size(byte_length as usize, self.max_message_size)?;
            // Every chunk but the lone chunk of an empty payload carries data.
            if size > byte_length.max(1) {
                return Err(ProtocolError::Reassembly(format!(
                    "{size} chunks cannot carry {byte_length} bytes"
                )));
            }
        }
        let buffer = self
            .buffers
            .entry(key.clone())
            .or_insert_with(|| ReassemblyBuffer::new(size, byte_length));

        let slot = &mut buffer.slots[index as usize];
        if slot.is_some() {
            log::warn!("[Codec] Duplicate chunk {index} for key {key}, dropping");
            return Ok(ChunkStatus::Duplicate(buffer.progress()));
        }
        if buffer.received + data.len() > buffer.byte_length as usize {
            self.buffers.remove(&key);
            return Err(ProtocolError::Reassembly(format!(
                "chunks for key {key} exceed the declared {byte_length} bytes"
            )));
        }
        buffer.received += data.len();
        *slot = Some(data);
        buffer.filled += 1;

        if !buffer.is_complete() {
            return Ok(ChunkStatus::Pending(buffer.progress()));
        }

        let Some(buffer) = self.buffers.remove(&key) else {
            return Err(ProtocolError::Reassembly(format!("buffer for {key} vanished")));
        };
        let progress = buffer.progress();
        let bytes = buffer.into_bytes()?;
        Ok(ChunkStatus::Complete { progress, bytes })
    }

    /// Drop any partial buffer for `key`.
    pub fn discard(&mut self, key: &str) {
        self.buffers.remove(key);
        self.rejected.remove(key);
    }

    /// Number of messages mid-reassembly.
    pub fn open_buffers(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    const CHUNK: usize = 16;

    fn run_to_completion(envelopes: Vec<ChunkEnvelope>) -> Vec<u8> {
        let mut reassembler = Reassembler::new(usize::MAX);
        let count = envelopes.len();
        for (i, env) in envelopes.into_iter().enumerate() {
            match reassembler.accept(env).unwrap() {
                ChunkStatus::Complete { bytes, .. } => {
                    assert_eq!(i, count - 1, "completed early");
                    return bytes;
                }
                ChunkStatus::Pending(p) => assert_eq!(p.done as usize, i + 1),
                other => panic!("unexpected {other:?}"),
            }
        }
        panic!("never completed");
    }

    /// A JSON string whose encoding is exactly `len` bytes (len >= 2).
    fn payload_of_encoded_len(len: usize) -> Value {
        Value::String("x".repeat(len - 2))
    }

    #[test]
    fn test_round_trip_boundary_lengths() {
        for len in [2, CHUNK - 1, CHUNK, CHUNK + 1, 10 * CHUNK] {
            let payload = payload_of_encoded_len(len);
            let bytes = encode(&payload).unwrap();
            assert_eq!(bytes.len(), len);

            let envelopes = split("k", &bytes, CHUNK).unwrap();
            assert_eq!(envelopes.len(), len.div_ceil(CHUNK));

            let decoded: Value = decode(&run_to_completion(envelopes)).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn test_empty_bytes_yield_one_empty_chunk() {
        let envelopes = split("k", &[], CHUNK).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].size, 1);
        assert!(envelopes[0].data.is_empty());
        assert!(run_to_completion(envelopes).is_empty());
    }

    #[test]
    fn test_single_byte() {
        let envelopes = split("k", b"1", CHUNK).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(run_to_completion(envelopes), b"1");
    }

    #[test]
    fn test_ten_bytes_in_chunks_of_four() {
        let bytes = b"0123456789";
        let envelopes = split("k", bytes, 4).unwrap();
        let lens: Vec<usize> = envelopes.iter().map(|e| e.data.len()).collect();
        assert_eq!(lens, vec![4, 4, 2]);
        assert!(envelopes.iter().all(|e| e.byte_length == 10 && e.size == 3));
    }

    #[test]
    fn test_reassembles_in_index_order_not_arrival_order() {
        let mut envelopes = split("k", b"abcdefghij", 4).unwrap();
        envelopes.reverse();
        let mut reassembler = Reassembler::new(1024);
        let mut result = None;
        for env in envelopes {
            if let ChunkStatus::Complete { bytes, progress } = reassembler.accept(env).unwrap() {
                assert_eq!(progress, Progress { total: 3, done: 3 });
                result = Some(bytes);
            }
        }
        assert_eq!(result.unwrap(), b"abcdefghij");
        assert_eq!(reassembler.open_buffers(), 0);
    }

    #[test]
    fn test_interleaved_keys_stay_independent() {
        let a = split("a", b"aaaaaaaaaa", 3).unwrap();
        let b = split("b", b"bbbbbbb", 3).unwrap();
        let mut reassembler = Reassembler::new(1024);
        let mut done = HashMap::new();

        let mut ai = a.into_iter();
        let mut bi = b.into_iter();
        loop {
            let mut progressed = false;
            for env in [bi.next(), ai.next()].into_iter().flatten() {
                progressed = true;
                let key = env.key.clone();
                if let ChunkStatus::Complete { bytes, .. } = reassembler.accept(env).unwrap() {
                    done.insert(key, bytes);
                }
            }
            if !progressed {
                break;
            }
        }
        assert_eq!(done["a"], b"aaaaaaaaaa");
        assert_eq!(done["b"], b"bbbbbbb");
    }

    #[test]
    fn test_duplicate_chunk_dropped() {
        let envelopes = split("k", b"abcdefgh", 4).unwrap();
        let mut reassembler = Reassembler::new(1024);
        assert!(matches!(
            reassembler.accept(envelopes[0].clone()).unwrap(),
            ChunkStatus::Pending(_)
        ));
        let mut dup = envelopes[0].clone();
        dup.data = b"ZZZZ".to_vec();
        assert_eq!(
            reassembler.accept(dup).unwrap(),
            ChunkStatus::Duplicate(Progress { total: 2, done: 1 })
        );
        match reassembler.accept(envelopes[1].clone()).unwrap() {
            ChunkStatus::Complete { bytes, .. } => assert_eq!(bytes, b"abcdefgh"),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_reassemble_missing_slot_fails() {
        let err = reassemble(vec![Some(b"ab".to_vec()), None]).unwrap_err();
        assert!(matches!(err, ProtocolError::Reassembly(_)));
    }

    #[test]
    fn test_index_out_of_range_rejected() {
        let mut reassembler = Reassembler::new(1024);
        let env = ChunkEnvelope {
            key: "k".into(),
            size: 2,
            index: 2,
            byte_length: 4,
            data: vec![],
        };
        assert!(matches!(
            reassembler.accept(env),
            Err(ProtocolError::Reassembly(_))
        ));
    }

    #[test]
    fn test_header_change_discards_buffer() {
        let envelopes = split("k", b"abcdefgh", 4).unwrap();
        let mut reassembler = Reassembler::new(1024);
        reassembler.accept(envelopes[0].clone()).unwrap();

        let mut liar = envelopes[1].clone();
        liar.byte_length = 99;
        assert!(reassembler.accept(liar).is_err());
        assert_eq!(reassembler.open_buffers(), 0);
    }

    #[test]
    fn test_byte_length_mismatch_on_completion() {
        let mut reassembler = Reassembler::new(1024);
        let env = ChunkEnvelope {
            key: "k".into(),
            size: 1,
            index: 0,
            byte_length: 5,
            data: b"abc".to_vec(),
        };
        assert!(matches!(
            reassembler.accept(env),
            Err(ProtocolError::Reassembly(_))
        ));
    }

    #[test]
    fn test_chunk_count_beyond_byte_length_rejected_before_allocating() {
        let mut reassembler = Reassembler::new(1024);
        let env = ChunkEnvelope {
            key: "k".into(),
            size: u32::MAX,
            index: 0,
            byte_length: 1,
            data: b"1".to_vec(),
        };
        assert!(matches!(
            reassembler.accept(env),
            Err(ProtocolError::Reassembly(_))
        ));
        assert_eq!(reassembler.open_buffers(), 0);

        // An empty payload still travels as one empty chunk.
        let empty = split("e", &[], CHUNK).unwrap();
        assert!(matches!(
            reassembler.accept(empty[0].clone()),
            Ok(ChunkStatus::Complete { .. })
        ));
    }

    #[test]
    fn test_chunks_overrunning_byte_length_rejected() {
        let mut reassembler = Reassembler::new(1024);
        let first = ChunkEnvelope {
            key: "k".into(),
            size: 2,
            index: 0,
            byte_length: 4,
            data: b"abcd".to_vec(),
        };
        assert!(matches!(reassembler.accept(first.clone()), Ok(ChunkStatus::Pending(_))));

        let overrun = ChunkEnvelope {
            index: 1,
            data: b"e".to_vec(),
            ..first
        };
        assert!(matches!(
            reassembler.accept(overrun),
            Err(ProtocolError::Reassembly(_))
        ));
        assert_eq!(reassembler.open_buffers(), 0);
    }

    #[test]
    fn test_oversize_first_chunk_rejected() {
        let mut reassembler = Reassembler::new(8);
        let envelopes = split("k", b"0123456789", 4).unwrap();
        assert_eq!(
            reassembler.accept(envelopes[0].clone()),
            Err(ProtocolError::PayloadTooLarge { size: 10, max: 8 })
        );
        assert_eq!(reassembler.open_buffers(), 0);

        // The rest of the rejected message is swallowed, then the key is free again.
        assert_eq!(reassembler.accept(envelopes[1].clone()), Ok(ChunkStatus::Discarded));
        assert_eq!(reassembler.accept(envelopes[2].clone()), Ok(ChunkStatus::Discarded));
        let fresh = split("k", b"0123", 4).unwrap();
        assert!(matches!(
            reassembler.accept(fresh[0].clone()),
            Ok(ChunkStatus::Complete { .. })
        ));
    }

    #[test]
    fn test_check_size_against_effective_max() {
        assert_eq!(effective_max(100, None), 100);
        assert_eq!(effective_max(100, Some(40)), 40);
        assert_eq!(effective_max(100, Some(400)), 100);
        assert!(check_size(40, 40).is_ok());
        assert_eq!(
            check_size(41, 40),
            Err(ProtocolError::PayloadTooLarge { size: 41, max: 40 })
        );
    }

    #[test]
    fn test_decode_error_is_encoding_error() {
        let err = decode::<Value>(b"{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Encoding(_)));
    }
}
