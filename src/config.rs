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

use std::time::Duration;
use crate::protocol::{CHUNK_SIZE, HEADER_LEN, MAX_PAYLOAD, RADIO_MTU};

/// Timing and sizing shared by both stations. Both ends must agree on
/// `chunk_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub chunk_size: usize,
    pub max_payload: usize,
    /// Transmissions per chunk before the transfer is aborted
    pub max_attempts: u8,
    pub ack_timeout: Duration,
    /// Pause after START so the receiver can allocate its buffer
    pub settle_delay: Duration,
    pub retry_delay: Duration,
    /// Receiver drops a transfer when no new chunk arrives for this long
    pub inactivity_timeout: Duration,
    /// Longest single wait on the radio while listening
    pub poll_interval: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            chunk_size: CHUNK_SIZE,
            max_payload: MAX_PAYLOAD,
            max_attempts: 3,
            ack_timeout: Duration::from_millis(2000),
            settle_delay: Duration::from_millis(500),
            retry_delay: Duration::from_millis(100),
            inactivity_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk size must be non-zero")]
    ZeroChunkSize,

    #[error("chunk size {chunk_size} plus {}-byte header exceeds radio MTU of {}", HEADER_LEN, RADIO_MTU)]
    ChunkExceedsMtu { chunk_size: usize },

    #[error("max attempts must be at least 1")]
    ZeroAttempts,

    #[error("max payload must be non-zero")]
    ZeroMaxPayload,

    #[error("max payload {max_payload} needs more than {} chunks of {chunk_size} bytes", u16::MAX)]
    TooManyChunks { max_payload: usize, chunk_size: usize },
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if HEADER_LEN + self.chunk_size > RADIO_MTU {
            return Err(ConfigError::ChunkExceedsMtu { chunk_size: self.chunk_size });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.max_payload == 0 {
            return Err(ConfigError::ZeroMaxPayload);
        }
        if self.max_payload.div_ceil(self.chunk_size) > u16::MAX as usize {
            return Err(ConfigError::TooManyChunks {
                max_payload: self.max_payload,
                chunk_size: self.chunk_size,
            });
        }
        Ok(())
    }
}
