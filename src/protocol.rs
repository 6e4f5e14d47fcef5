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

//! Photo tunnel wire format
//!
//! ```text
//! [0]       frame type (u8)
//! [1..5]    transfer id (u32 LE)
//! [5..7]    chunk index (u16 LE)
//! [7..9]    chunk count (u16 LE)
//! [9..11]   data length (u16 LE)
//! [11..13]  checksum (u16 LE)
//! [13..]    attached data (data length bytes)
//! ```

use std::time::{SystemTime, UNIX_EPOCH};
use crate::checksum::checksum;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 13;

/// Largest packet the SX126x radio will carry.
pub const RADIO_MTU: usize = 255;

/// Default bytes per DATA frame.
pub const CHUNK_SIZE: usize = 200;

/// Default upper bound on a transfer's total size.
pub const MAX_PAYLOAD: usize = 100_000;

/// START frames attach the total size as a u32.
pub const START_ATTACHMENT_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Sender announces a transfer
    Start = 0x01,
    /// One chunk of payload
    Data = 0x02,
    /// Sender has delivered every chunk
    End = 0x03,
    /// Receiver stored (or already had) a chunk
    Ack = 0x04,
    /// Receiver rejected a chunk, retransmit
    Nack = 0x05,
    /// Connectivity probe
    Ping = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Start),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::End),
            0x04 => Ok(FrameType::Ack),
            0x05 => Ok(FrameType::Nack),
            0x06 => Ok(FrameType::Ping),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes, header needs {hl}", hl = HEADER_LEN)]
    TooShort(usize),

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownType(u8),
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub transfer_id: u32,
    pub chunk_index: u16,
    pub chunk_count: u16,
    pub data_length: u16,
    pub checksum: u16,
}

impl FrameHeader {
    fn control(frame_type: FrameType, transfer_id: u32, chunk_index: u16) -> Self {
        FrameHeader {
            frame_type,
            transfer_id,
            chunk_index,
            chunk_count: 0,
            data_length: 0,
            checksum: 0,
        }
    }

    pub fn ack(transfer_id: u32, chunk_index: u16) -> Self {
        Self::control(FrameType::Ack, transfer_id, chunk_index)
    }

    pub fn nack(transfer_id: u32, chunk_index: u16) -> Self {
        Self::control(FrameType::Nack, transfer_id, chunk_index)
    }

    pub fn ping(transfer_id: u32) -> Self {
        Self::control(FrameType::Ping, transfer_id, 0)
    }

    /// Serialize the header followed by `data`. `data_length` is taken from
    /// the header as-is so corrupt frames can be built in tests.
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + data.len());
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&self.transfer_id.to_le_bytes());
        buf.extend_from_slice(&self.chunk_index.to_le_bytes());
        buf.extend_from_slice(&self.chunk_count.to_le_bytes());
        buf.extend_from_slice(&self.data_length.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.extend_from_slice(data);
        buf
    }
}

/// Split a raw radio packet into its header and the bytes attached after it.
/// The attachment length is not checked against `data_length`.
pub fn decode_frame(packet: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
    if packet.len() < HEADER_LEN {
        return Err(FrameError::TooShort(packet.len()));
    }

    let u16_at = |at: usize| u16::from_le_bytes([packet[at], packet[at + 1]]);

    let header = FrameHeader {
        frame_type: FrameType::try_from(packet[0])?,
        transfer_id: u32::from_le_bytes([packet[1], packet[2], packet[3], packet[4]]),
        chunk_index: u16_at(5),
        chunk_count: u16_at(7),
        data_length: u16_at(9),
        checksum: u16_at(11),
    };

    Ok((header, &packet[HEADER_LEN..]))
}

// ============================================================================
// Frame builders
// ============================================================================

/// START frame: total size attached as u32 LE, checksum over the head sample.
pub fn start_frame(transfer_id: u32, total_size: u32, chunk_count: u16, head_sample: u16) -> Vec<u8> {
    FrameHeader {
        frame_type: FrameType::Start,
        transfer_id,
        chunk_index: 0,
        chunk_count,
        data_length: START_ATTACHMENT_LEN as u16,
        checksum: head_sample,
    }
    .encode(&total_size.to_le_bytes())
}

/// Total size declared by a START frame. Legacy senders attach nothing and
/// put a 16-bit size in `data_length`.
pub fn start_total_size(header: &FrameHeader, attached: &[u8]) -> Option<u32> {
    match attached.len() {
        0 => Some(header.data_length as u32),
        START_ATTACHMENT_LEN if header.data_length as usize == START_ATTACHMENT_LEN => {
            Some(u32::from_le_bytes([attached[0], attached[1], attached[2], attached[3]]))
        }
        _ => None,
    }
}

pub fn data_frame(transfer_id: u32, chunk_index: u16, data: &[u8]) -> Vec<u8> {
    FrameHeader {
        frame_type: FrameType::Data,
        transfer_id,
        chunk_index,
        chunk_count: 0,
        data_length: data.len() as u16,
        checksum: checksum(data),
    }
    .encode(data)
}

/// END frame: chunk index set to the chunk count as an end marker.
pub fn end_frame(transfer_id: u32, total_size: u32, chunk_count: u16, tail_sample: u16) -> Vec<u8> {
    FrameHeader {
        frame_type: FrameType::End,
        transfer_id,
        chunk_index: chunk_count,
        chunk_count,
        data_length: total_size as u16,
        checksum: tail_sample,
    }
    .encode(&[])
}

// ============================================================================
// Chunk arithmetic
// ============================================================================

/// Number of chunks needed for `total_size` bytes.
pub fn chunk_count(total_size: usize, chunk_size: usize) -> usize {
    total_size.div_ceil(chunk_size)
}

/// Byte range of chunk `index` within a payload of `total_size` bytes.
pub fn chunk_range(total_size: usize, chunk_size: usize, index: usize) -> std::ops::Range<usize> {
    let start = (index * chunk_size).min(total_size);
    let end = (start + chunk_size).min(total_size);
    start..end
}

/// Percentage plus a 20-cell bar, e.g. `55% [===========         ]`.
pub fn progress_bar(done: u16, total: u16) -> String {
    let percent = if total == 0 { 100 } else { done as usize * 100 / total as usize };
    let filled = (percent / 5).min(20);
    format!("{}% [{}{}]", percent, "=".repeat(filled), " ".repeat(20 - filled))
}

// ============================================================================
// Transfer ids
// ============================================================================

/// Hands out time based transfer ids, never repeating the previous one.
#[derive(Debug, Default)]
pub struct TransferIds {
    last: Option<u32>,
}

impl TransferIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u32 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u32)
            .unwrap_or(0);
        self.next_from(millis)
    }

    fn next_from(&mut self, seed: u32) -> u32 {
        let id = match self.last {
            Some(last) if last == seed => seed.wrapping_add(1),
            _ => seed,
        };
        self.last = Some(id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader {
            frame_type: FrameType::Data,
            transfer_id: 0x0403_0201,
            chunk_index: 0x0605,
            chunk_count: 0x0807,
            data_length: 2,
            checksum: 0x0C0B,
        };
        let bytes = header.encode(&[0xAA, 0xBB]);
        assert_eq!(
            bytes,
            vec![0x02, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x02, 0x00, 0x0B, 0x0C, 0xAA, 0xBB]
        );

        let (decoded, attached) = decode_frame(&bytes).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(attached, &[0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_rejects_short_and_unknown() {
        assert_eq!(decode_frame(&[0x01; 12]), Err(FrameError::TooShort(12)));

        let mut bytes = FrameHeader::ping(7).encode(&[]);
        bytes[0] = 0x09;
        assert_eq!(decode_frame(&bytes), Err(FrameError::UnknownType(0x09)));
    }

    #[test]
    fn test_control_frames_have_no_attachment() {
        for bytes in [FrameHeader::ack(9, 3).encode(&[]), FrameHeader::nack(9, 3).encode(&[])] {
            assert_eq!(bytes.len(), HEADER_LEN);
            let (header, attached) = decode_frame(&bytes).expect("decode");
            assert_eq!(header.transfer_id, 9);
            assert_eq!(header.chunk_index, 3);
            assert_eq!(header.data_length, 0);
            assert!(attached.is_empty());
        }
    }

    #[test]
    fn test_data_frame_carries_checksum() {
        let data = [1u8, 2, 3, 4, 5];
        let bytes = data_frame(42, 7, &data);
        assert_eq!(bytes.len(), HEADER_LEN + data.len());

        let (header, attached) = decode_frame(&bytes).expect("decode");
        assert_eq!(header.frame_type, FrameType::Data);
        assert_eq!(header.chunk_index, 7);
        assert_eq!(header.data_length, 5);
        assert_eq!(header.checksum, checksum(&data));
        assert_eq!(attached, &data);
    }

    #[test]
    fn test_start_total_size() {
        let bytes = start_frame(1, 100_000, 500, 0x1234);
        let (header, attached) = decode_frame(&bytes).expect("decode");
        assert_eq!(header.chunk_count, 500);
        assert_eq!(header.checksum, 0x1234);
        assert_eq!(start_total_size(&header, attached), Some(100_000));

        let legacy = FrameHeader { data_length: 2048, ..header };
        assert_eq!(start_total_size(&legacy, &[]), Some(2048));

        assert_eq!(start_total_size(&header, &[1, 2]), None);
    }

    #[test]
    fn test_end_frame_marker() {
        let bytes = end_frame(5, 2048, 11, 0xBEEF);
        let (header, attached) = decode_frame(&bytes).expect("decode");
        assert_eq!(header.frame_type, FrameType::End);
        assert_eq!(header.chunk_index, 11);
        assert_eq!(header.chunk_count, 11);
        assert_eq!(header.data_length, 2048);
        assert!(attached.is_empty());
    }

    #[test]
    fn test_max_frame_fits_radio() {
        assert!(HEADER_LEN + CHUNK_SIZE <= RADIO_MTU);
        assert_eq!(data_frame(1, 0, &[0u8; CHUNK_SIZE]).len(), 213);
    }

    #[test]
    fn test_chunk_math() {
        assert_eq!(chunk_count(2048, 200), 11);
        assert_eq!(chunk_range(2048, 200, 10), 2000..2048);
        assert_eq!(chunk_count(200, 200), 1);
        assert_eq!(chunk_count(201, 200), 2);

        for size in [1usize, 199, 200, 201, 2048, MAX_PAYLOAD] {
            let count = chunk_count(size, CHUNK_SIZE);
            assert_eq!(count, (size + CHUNK_SIZE - 1) / CHUNK_SIZE);
            let total: usize = (0..count).map(|i| chunk_range(size, CHUNK_SIZE, i).len()).sum();
            assert_eq!(total, size);
        }
    }

    #[test]
    fn test_progress_bar() {
        assert_eq!(progress_bar(0, 11), "0% [                    ]");
        assert_eq!(progress_bar(6, 11), "54% [==========          ]");
        assert_eq!(progress_bar(11, 11), "100% [====================]");
    }

    #[test]
    fn test_transfer_ids_never_repeat_last() {
        let mut ids = TransferIds::new();
        assert_eq!(ids.next_from(1000), 1000);
        assert_eq!(ids.next_from(1000), 1001);
        assert_eq!(ids.next_from(1000), 1000);
        assert_eq!(ids.next_from(u32::MAX), u32::MAX);
        assert_eq!(ids.next_from(u32::MAX), 0);
    }
}
