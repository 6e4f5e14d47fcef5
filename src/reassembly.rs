// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Receiver-side buffer for one in-flight transfer.

use std::time::{Duration, Instant};
use crate::checksum::{checksum, head_sample, tail_sample};
use crate::protocol::{chunk_count, chunk_range, FrameHeader};

// ============================================================================
// Chunk mask
// ============================================================================

/// Which chunk indices have been stored.
#[derive(Debug, Clone)]
pub struct ChunkMask {
    bits: Vec<u64>,
    chunk_count: u16,
    received: u16,
}

impl ChunkMask {
    pub fn new(chunk_count: u16) -> Self {
        ChunkMask {
            bits: vec![0; (chunk_count as usize).div_ceil(64)],
            chunk_count,
            received: 0,
        }
    }

    /// Returns true if the index was newly marked.
    pub fn set(&mut self, index: u16) -> bool {
        if index >= self.chunk_count {
            return false;
        }
        let (word, mask) = (index as usize / 64, 1u64 << (index % 64));
        if self.bits[word] & mask != 0 {
            return false;
        }
        self.bits[word] |= mask;
        self.received += 1;
        true
    }

    pub fn get(&self, index: u16) -> bool {
        index < self.chunk_count && self.bits[index as usize / 64] & (1u64 << (index % 64)) != 0
    }

    pub fn received(&self) -> u16 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.chunk_count
    }

    pub fn missing(&self) -> Vec<u16> {
        (0..self.chunk_count).filter(|&i| !self.get(i)).collect()
    }
}

// ============================================================================
// Rejections
// ============================================================================

/// Why a START frame did not open a transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartRejection {
    #[error("declared size is zero")]
    EmptyPayload,

    #[error("declared size {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    #[error("declared {declared} chunks, size needs {expected}")]
    ChunkCountMismatch { declared: u16, expected: usize },
}

/// Why a DATA frame was NACKed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkRejection {
    #[error("header declares {declared} bytes, {attached} attached")]
    LengthMismatch { declared: u16, attached: usize },

    #[error("checksum mismatch: header 0x{declared:04x}, computed 0x{computed:04x}")]
    ChecksumMismatch { declared: u16, computed: u16 },

    #[error("chunk index {index} out of range for {chunk_count} chunks")]
    IndexOutOfRange { index: u16, chunk_count: u16 },

    #[error("chunk carries {actual} bytes, expected {expected}")]
    UnexpectedLength { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Stored,
    /// Already held; acknowledged again without rewriting
    Duplicate,
}

/// Reassembled bytes disagree with the samples announced at START/END.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("head sample mismatch: announced 0x{announced:04x}, reassembled 0x{computed:04x}")]
    Head { announced: u16, computed: u16 },

    #[error("tail sample mismatch: announced 0x{announced:04x}, reassembled 0x{computed:04x}")]
    Tail { announced: u16, computed: u16 },
}

// ============================================================================
// Reassembly
// ============================================================================

pub struct Reassembly {
    transfer_id: u32,
    chunk_size: usize,
    chunk_count: u16,
    head_sample: u16,
    buffer: Vec<u8>,
    mask: ChunkMask,
    started_at: Instant,
    last_activity: Instant,
}

impl Reassembly {
    /// Allocate for a transfer announced by START, after checking that its
    /// declared geometry is consistent and within `max_payload`.
    pub fn new(
        transfer_id: u32,
        total_size: usize,
        declared_chunks: u16,
        head_sample: u16,
        chunk_size: usize,
        max_payload: usize,
        now: Instant,
    ) -> Result<Self, StartRejection> {
        if total_size == 0 {
            return Err(StartRejection::EmptyPayload);
        }
        if total_size > max_payload {
            return Err(StartRejection::TooLarge { size: total_size, max: max_payload });
        }
        let expected = chunk_count(total_size, chunk_size);
        if expected != declared_chunks as usize {
            return Err(StartRejection::ChunkCountMismatch { declared: declared_chunks, expected });
        }

        Ok(Reassembly {
            transfer_id,
            chunk_size,
            chunk_count: declared_chunks,
            head_sample,
            buffer: vec![0; total_size],
            mask: ChunkMask::new(declared_chunks),
            started_at: now,
            last_activity: now,
        })
    }

    pub fn transfer_id(&self) -> u32 {
        self.transfer_id
    }

    pub fn total_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn chunk_count(&self) -> u16 {
        self.chunk_count
    }

    pub fn received_chunks(&self) -> u16 {
        self.mask.received()
    }

    pub fn is_complete(&self) -> bool {
        self.mask.is_complete()
    }

    pub fn missing_chunks(&self) -> Vec<u16> {
        self.mask.missing()
    }

    /// No chunk has been stored for longer than `timeout`.
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// Validate a DATA frame and copy it into place.
    pub fn accept_chunk(
        &mut self,
        header: &FrameHeader,
        attached: &[u8],
        now: Instant,
    ) -> Result<ChunkOutcome, ChunkRejection> {
        if attached.len() != header.data_length as usize {
            return Err(ChunkRejection::LengthMismatch {
                declared: header.data_length,
                attached: attached.len(),
            });
        }

        let computed = checksum(attached);
        if computed != header.checksum {
            return Err(ChunkRejection::ChecksumMismatch { declared: header.checksum, computed });
        }

        let index = header.chunk_index;
        if index >= self.chunk_count {
            return Err(ChunkRejection::IndexOutOfRange { index, chunk_count: self.chunk_count });
        }

        let range = chunk_range(self.buffer.len(), self.chunk_size, index as usize);
        if range.len() != attached.len() {
            return Err(ChunkRejection::UnexpectedLength {
                expected: range.len(),
                actual: attached.len(),
            });
        }

        if self.mask.get(index) {
            return Ok(ChunkOutcome::Duplicate);
        }

        self.buffer[range].copy_from_slice(attached);
        self.mask.set(index);
        self.last_activity = now;
        Ok(ChunkOutcome::Stored)
    }

    /// Hand back the payload once every chunk is present, checking it
    /// against the head and tail samples.
    pub fn finish(self, announced_tail: u16) -> Result<Vec<u8>, IntegrityError> {
        let computed = head_sample(&self.buffer);
        if computed != self.head_sample {
            return Err(IntegrityError::Head { announced: self.head_sample, computed });
        }
        let computed = tail_sample(&self.buffer);
        if computed != announced_tail {
            return Err(IntegrityError::Tail { announced: announced_tail, computed });
        }
        Ok(self.buffer)
    }
}
