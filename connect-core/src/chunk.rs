//! Chunk transfer engine: split the encrypted vault into ordered chunks, track
//! acknowledgments on the sending side, reassemble and verify on the receiving side.

use std::collections::BTreeSet;

use crate::integrity::{self, Hash};
use crate::protocol::ActionTag;
use crate::requests::{ChunkPayload, RequestExpectedResponse, TransferChunk, TransferLastChunk};
use crate::wire;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024; // 256 KiB

/// Largest chunk whose base64 form, wrapped in an envelope, still fits one frame
/// of [`wire::MAX_FRAME_LEN`].
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024; // 8 MiB

/// Upper bound on the buffer reserved up front from a peer-announced size.
const MAX_PREALLOC: usize = 64 * DEFAULT_CHUNK_SIZE;

/// The chunk size used for a configured value: 0 selects the default and
/// anything above [`MAX_CHUNK_SIZE`] is capped.
pub fn effective_chunk_size(requested: usize) -> usize {
    match requested {
        0 => DEFAULT_CHUNK_SIZE,
        n => n.min(MAX_CHUNK_SIZE),
    }
}

/// One planned chunk: index and byte range in the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u32,
    pub start: usize,
    pub end: usize,
}

impl ChunkSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Split a blob of `total_len` bytes into fixed-size spans. An empty blob is one empty chunk.
pub fn split_into_chunks(total_len: usize, chunk_size: usize) -> Vec<ChunkSpan> {
    let size = effective_chunk_size(chunk_size);
    if total_len == 0 {
        return vec![ChunkSpan {
            index: 0,
            start: 0,
            end: 0,
        }];
    }
    let mut out = Vec::with_capacity(total_len.div_ceil(size));
    let mut start = 0usize;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(ChunkSpan {
            index: out.len() as u32,
            start,
            end,
        });
        start = end;
    }
    out
}

/// Engine-level view of a chunk send. Both variants go out under the
/// `transferChunk` action but expect different responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRequest {
    Middle(ChunkPayload),
    Last(ChunkPayload),
}

impl ChunkRequest {
    pub fn index(&self) -> u32 {
        self.payload().chunk_index
    }

    pub fn payload(&self) -> &ChunkPayload {
        match self {
            ChunkRequest::Middle(p) | ChunkRequest::Last(p) => p,
        }
    }

    pub fn is_last(&self) -> bool {
        matches!(self, ChunkRequest::Last(_))
    }

    pub fn expected_response(&self) -> ActionTag {
        match self {
            ChunkRequest::Middle(_) => TransferChunk::RESPONSE_ACTION,
            ChunkRequest::Last(_) => TransferLastChunk::RESPONSE_ACTION,
        }
    }
}

/// Sending-side bookkeeping for one transfer.
#[derive(Debug, Clone)]
pub struct ChunkTransferState {
    pub total_chunks: u32,
    pub total_size: u64,
    pub expected_digest: Hash,
    pub new_session_id: Vec<u8>,
    chunks_acknowledged: BTreeSet<u32>,
    next_chunk_index: u32,
    in_flight: Option<u32>,
}

impl ChunkTransferState {
    pub fn new(
        total_chunks: u32,
        total_size: u64,
        expected_digest: Hash,
        new_session_id: Vec<u8>,
    ) -> Self {
        Self {
            total_chunks,
            total_size,
            expected_digest,
            new_session_id,
            chunks_acknowledged: BTreeSet::new(),
            next_chunk_index: 0,
            in_flight: None,
        }
    }

    pub fn next_chunk_index(&self) -> u32 {
        self.next_chunk_index
    }

    pub fn in_flight(&self) -> Option<u32> {
        self.in_flight
    }

    pub fn is_acknowledged(&self, index: u32) -> bool {
        self.chunks_acknowledged.contains(&index)
    }

    pub fn acknowledged_count(&self) -> usize {
        self.chunks_acknowledged.len()
    }

    /// Mark `index` as sent. Only the next index may be sent, one at a time.
    pub fn begin(&mut self, index: u32) -> Result<(), ChunkError> {
        if let Some(current) = self.in_flight {
            return Err(ChunkError::Busy { in_flight: current });
        }
        if index >= self.total_chunks {
            return Err(ChunkError::OutOfRange {
                index,
                total: self.total_chunks,
            });
        }
        if index != self.next_chunk_index {
            return Err(ChunkError::OutOfSequence {
                expected: self.next_chunk_index,
                got: index,
            });
        }
        self.in_flight = Some(index);
        Ok(())
    }

    /// Record the peer's confirmation of the in-flight chunk.
    pub fn acknowledge(&mut self, index: u32) -> Result<(), ChunkError> {
        if self.in_flight != Some(index) {
            return Err(ChunkError::NotInFlight { index });
        }
        self.chunks_acknowledged.insert(index);
        self.next_chunk_index = index + 1;
        self.in_flight = None;
        Ok(())
    }

    /// Drop the in-flight marker; the next send repeats the first unacknowledged index.
    pub fn cancel_in_flight(&mut self) -> Option<u32> {
        self.in_flight.take()
    }

    /// Every index below `total_chunks` is acknowledged.
    pub fn is_complete(&self) -> bool {
        (0..self.total_chunks).all(|i| self.chunks_acknowledged.contains(&i))
    }
}

/// Sending side: the blob, its chunk plan and the acknowledgment state.
#[derive(Debug, Clone)]
pub struct OutboundTransfer {
    state: ChunkTransferState,
    blob: Vec<u8>,
    spans: Vec<ChunkSpan>,
}

impl OutboundTransfer {
    pub fn new(blob: Vec<u8>, chunk_size: usize, new_session_id: Vec<u8>) -> Self {
        let spans = split_into_chunks(blob.len(), chunk_size);
        let state = ChunkTransferState::new(
            spans.len() as u32,
            blob.len() as u64,
            integrity::hash_blob(&blob),
            new_session_id,
        );
        Self { state, blob, spans }
    }

    pub fn state(&self) -> &ChunkTransferState {
        &self.state
    }

    /// Build the request for the next unacknowledged chunk and mark it in flight.
    /// `None` once every chunk has been sent and acknowledged.
    pub fn next_request(&mut self) -> Result<Option<ChunkRequest>, ChunkError> {
        let index = self.state.next_chunk_index();
        let Some(span) = self.spans.get(index as usize).copied() else {
            return Ok(None);
        };
        let chunk_size = u32::try_from(span.len()).map_err(|_| ChunkError::Overflow)?;
        self.state.begin(index)?;
        let payload = ChunkPayload {
            chunk_index: index,
            chunk_size,
            chunk_data: wire::to_base64(&self.blob[span.start..span.end]),
        };
        if index + 1 == self.state.total_chunks {
            Ok(Some(ChunkRequest::Last(payload)))
        } else {
            Ok(Some(ChunkRequest::Middle(payload)))
        }
    }

    /// Apply a confirmation. Returns true when the whole transfer is acknowledged.
    pub fn on_confirmed(&mut self, index: u32) -> Result<bool, ChunkError> {
        self.state.acknowledge(index)?;
        Ok(self.state.is_complete())
    }

    pub fn cancel_in_flight(&mut self) -> Option<u32> {
        self.state.cancel_in_flight()
    }
}

/// Result of a chunk accepted by the receiving side.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Chunk stored; more to come.
    InProgress { index: u32 },
    /// Last chunk stored and the digest verified; the reassembled blob.
    Complete(Vec<u8>),
    /// Repeat of the last chunk after completion; already delivered.
    AlreadyDelivered { index: u32 },
}

/// Receiving side: reassembly buffer for one announced transfer.
#[derive(Debug)]
pub struct InboundTransfer {
    total_chunks: u32,
    total_size: u64,
    expected_digest: Hash,
    buffer: Vec<u8>,
    /// Start offset in `buffer` of every accepted chunk, by index.
    offsets: Vec<usize>,
    completed: bool,
}

impl InboundTransfer {
    pub fn new(total_chunks: u32, total_size: u64, expected_digest: Hash) -> Result<Self, ChunkError> {
        if total_chunks == 0 {
            return Err(ChunkError::EmptyPlan);
        }
        let capacity = usize::try_from(total_size).map_err(|_| ChunkError::Overflow)?;
        Ok(Self {
            total_chunks,
            total_size,
            expected_digest,
            buffer: Vec::with_capacity(capacity.min(MAX_PREALLOC)),
            offsets: Vec::new(),
            completed: false,
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Index the receiver expects next.
    pub fn next_expected(&self) -> u32 {
        self.offsets.len() as u32
    }

    pub fn received_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Accept one chunk. Rejections leave the buffer untouched. The most recently
    /// accepted index may be re-sent; its bytes are replaced, never appended twice.
    pub fn accept(
        &mut self,
        index: u32,
        declared_size: u32,
        data: &[u8],
    ) -> Result<ChunkReceiveResult, ChunkError> {
        if index >= self.total_chunks {
            return Err(ChunkError::OutOfRange {
                index,
                total: self.total_chunks,
            });
        }
        if declared_size as usize != data.len() {
            return Err(ChunkError::SizeMismatch {
                declared: declared_size,
                actual: data.len(),
            });
        }
        if self.completed {
            if index + 1 == self.total_chunks {
                return Ok(ChunkReceiveResult::AlreadyDelivered { index });
            }
            return Err(ChunkError::AlreadyComplete);
        }

        let expected = self.next_expected();
        let start = if index == expected {
            self.buffer.len()
        } else if index + 1 == expected {
            self.offsets[index as usize]
        } else {
            return Err(ChunkError::OutOfSequence {
                expected,
                got: index,
            });
        };
        if (start + data.len()) as u64 > self.total_size {
            return Err(ChunkError::Overflow);
        }

        let is_last = index + 1 == self.total_chunks;
        if is_last {
            // Verify before mutating so a bad last chunk leaves the buffer as it was.
            if (start + data.len()) as u64 != self.total_size {
                return Err(ChunkError::Incomplete {
                    received: (start + data.len()) as u64,
                    total: self.total_size,
                });
            }
            let mut candidate = Vec::with_capacity(self.total_size as usize);
            candidate.extend_from_slice(&self.buffer[..start]);
            candidate.extend_from_slice(data);
            if !integrity::verify_blob(&candidate, &self.expected_digest) {
                return Err(ChunkError::DigestMismatch);
            }
            self.buffer = candidate;
            if index == expected {
                self.offsets.push(start);
            }
            self.completed = true;
            return Ok(ChunkReceiveResult::Complete(self.buffer.clone()));
        }

        self.buffer.truncate(start);
        self.buffer.extend_from_slice(data);
        if index == expected {
            self.offsets.push(start);
        }
        Ok(ChunkReceiveResult::InProgress { index })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk {got} out of sequence, expected {expected}")]
    OutOfSequence { expected: u32, got: u32 },
    #[error("chunk {index} out of range ({total} chunks)")]
    OutOfRange { index: u32, total: u32 },
    #[error("chunk declares {declared} bytes but carries {actual}")]
    SizeMismatch { declared: u32, actual: usize },
    #[error("chunk overflows the announced size")]
    Overflow,
    #[error("transfer ended at {received} of {total} bytes")]
    Incomplete { received: u64, total: u64 },
    #[error("reassembled digest does not match")]
    DigestMismatch,
    #[error("transfer already complete")]
    AlreadyComplete,
    #[error("chunk {index} is not in flight")]
    NotInFlight { index: u32 },
    #[error("chunk {in_flight} still awaiting confirmation")]
    Busy { in_flight: u32 },
    #[error("transfer announces zero chunks")]
    EmptyPlan,
}
