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

//! CRC-16 used on every chunk and on the START/END integrity samples.

use crc::{Crc, CRC_16_MODBUS};

/// Reflected polynomial 0xA001, seeded at 0xFFFF, no final xor.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Number of payload bytes fingerprinted at each end of a transfer.
pub const SAMPLE_LEN: usize = 32;

pub fn checksum(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Checksum over the first `SAMPLE_LEN` bytes (or fewer for short payloads).
pub fn head_sample(payload: &[u8]) -> u16 {
    checksum(&payload[..payload.len().min(SAMPLE_LEN)])
}

/// Checksum over the last `SAMPLE_LEN` bytes (or fewer for short payloads).
pub fn tail_sample(payload: &[u8]) -> u16 {
    checksum(&payload[payload.len().saturating_sub(SAMPLE_LEN)..])
}
