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

use std::marker::PhantomData;
use std::time::Instant;
use crate::clock::Clock;
use crate::companion::{CompanionChannel, CompanionError};
use crate::config::ProtocolConfig;
use crate::protocol::*;
use crate::radio::{RadioError, RadioLink, ReceivedFrame, SignalQuality};
use crate::reassembly::{ChunkOutcome, Reassembly};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("radio poll failed: {0}")]
    Radio(#[from] RadioError),

    #[error("delivery failed: {0}")]
    Companion(#[from] CompanionError),
}

// ============================================================================
// States
// ============================================================================

pub struct Listening;
pub struct Receiving;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    radio: Box<dyn RadioLink>,
    companion: Box<dyn CompanionChannel>,
    clock: Box<dyn Clock>,
    config: ProtocolConfig,
    transfer: Option<Reassembly>,
    delivered: u32,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError>;

    /// Transfer id currently being reassembled, if any.
    fn active_transfer(&self) -> Option<u32>;

    /// Number of payloads handed to the companion so far.
    fn delivered(&self) -> u32;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            radio: self.radio,
            companion: self.companion,
            clock: self.clock,
            config: self.config,
            transfer: self.transfer,
            delivered: self.delivered,
        })
    }

    fn poll(&mut self) -> Result<Option<ReceivedFrame>, ReceiverError> {
        Ok(self.radio.poll_frame(self.config.poll_interval)?)
    }

    /// Send an ACK or NACK. A lost reply is recovered by the sender's retry,
    /// so failures are only logged.
    fn reply(&mut self, header: FrameHeader) {
        if let Err(e) = self.radio.transmit(&header.encode(&[])) {
            tracing::warn!(
                frame_type = ?header.frame_type,
                chunk = header.chunk_index,
                "reply not sent: {}",
                e
            );
        }
        if let Err(e) = self.radio.start_listening() {
            tracing::warn!("could not return to receive mode: {}", e);
        }
    }

    /// Validate a START frame and allocate its reassembly buffer.
    fn open_transfer(&mut self, header: &FrameHeader, attached: &[u8], now: Instant) -> Option<Reassembly> {
        let Some(total_size) = start_total_size(header, attached) else {
            tracing::warn!(transfer_id = header.transfer_id, len = attached.len(), "malformed START");
            return None;
        };

        match Reassembly::new(
            header.transfer_id,
            total_size as usize,
            header.chunk_count,
            header.checksum,
            self.config.chunk_size,
            self.config.max_payload,
            now,
        ) {
            Ok(transfer) => {
                tracing::info!(
                    transfer_id = header.transfer_id,
                    size = total_size,
                    chunks = header.chunk_count,
                    "transfer started"
                );
                self.companion.on_transfer_started(header.transfer_id, total_size, header.chunk_count);
                Some(transfer)
            }
            Err(e) => {
                tracing::warn!(transfer_id = header.transfer_id, "rejecting START: {}", e);
                None
            }
        }
    }
}

fn log_ping(header: &FrameHeader, quality: SignalQuality) {
    tracing::info!(
        transfer_id = header.transfer_id,
        rssi = quality.rssi_dbm,
        snr = quality.snr_db,
        "PING received"
    );
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<Listening> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        let Some(received) = fsm.poll()? else {
            return Ok(Box::new(fsm));
        };

        match decode_frame(&received.bytes) {
            Ok((header, attached)) => match header.frame_type {
                FrameType::Start => {
                    let now = fsm.clock.now();
                    if let Some(transfer) = fsm.open_transfer(&header, attached, now) {
                        fsm.transfer = Some(transfer);
                        return Ok(fsm.transition::<Receiving>());
                    }
                }
                FrameType::Ping => log_ping(&header, received.quality),
                other => {
                    tracing::debug!(frame_type = ?other, transfer_id = header.transfer_id, "no active transfer, ignoring");
                }
            },
            Err(e) => tracing::debug!("ignoring undecodable frame: {}", e),
        }

        Ok(Box::new(fsm))
    }

    fn active_transfer(&self) -> Option<u32> {
        None
    }

    fn delivered(&self) -> u32 {
        self.delivered
    }
}

impl ReceiverState for ReceiverFsm<Receiving> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        if fsm.abandon_if_stale() {
            return Ok(fsm.transition::<Listening>());
        }

        let Some(received) = fsm.poll()? else {
            return Ok(Box::new(fsm));
        };

        let (header, attached) = match decode_frame(&received.bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("ignoring undecodable frame: {}", e);
                return Ok(Box::new(fsm));
            }
        };

        let active = fsm.active_transfer();
        match header.frame_type {
            FrameType::Start if active == Some(header.transfer_id) => {
                tracing::debug!(transfer_id = header.transfer_id, "repeated START ignored");
            }
            FrameType::Start => {
                if fsm.abandon_if_stale() {
                    let now = fsm.clock.now();
                    if let Some(transfer) = fsm.open_transfer(&header, attached, now) {
                        fsm.transfer = Some(transfer);
                        return Ok(Box::new(fsm));
                    }
                    return Ok(fsm.transition::<Listening>());
                }
                tracing::warn!(
                    transfer_id = header.transfer_id,
                    active = ?active,
                    "receiver busy, discarding START"
                );
            }
            FrameType::Data if active == Some(header.transfer_id) => {
                fsm.handle_data(&header, attached);
            }
            FrameType::End if active == Some(header.transfer_id) => {
                return fsm.handle_end(&header);
            }
            FrameType::Ping => log_ping(&header, received.quality),
            other => {
                tracing::debug!(frame_type = ?other, transfer_id = header.transfer_id, "ignoring frame");
            }
        }

        Ok(Box::new(fsm))
    }

    fn active_transfer(&self) -> Option<u32> {
        self.transfer.as_ref().map(Reassembly::transfer_id)
    }

    fn delivered(&self) -> u32 {
        self.delivered
    }
}

impl ReceiverFsm<Receiving> {
    /// Drop the active transfer if no chunk has landed within the
    /// inactivity window.
    fn abandon_if_stale(&mut self) -> bool {
        let now = self.clock.now();
        let stale = match &self.transfer {
            Some(transfer) => transfer.is_stale(now, self.config.inactivity_timeout),
            None => true,
        };
        if stale {
            if let Some(transfer) = self.transfer.take() {
                tracing::warn!(
                    transfer_id = transfer.transfer_id(),
                    received = transfer.received_chunks(),
                    total = transfer.chunk_count(),
                    "transfer abandoned after inactivity"
                );
            }
        }
        stale
    }

    fn handle_data(&mut self, header: &FrameHeader, attached: &[u8]) {
        let now = self.clock.now();
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        let (transfer_id, index) = (header.transfer_id, header.chunk_index);

        match transfer.accept_chunk(header, attached, now) {
            Ok(ChunkOutcome::Stored) => {
                let (received, total) = (transfer.received_chunks(), transfer.chunk_count());
                tracing::debug!(transfer_id, chunk = index, bytes = attached.len(), "chunk stored");
                tracing::info!(transfer_id, "[{}/{}] {}", received, total, progress_bar(received, total));
                self.reply(FrameHeader::ack(transfer_id, index));
                self.companion.on_progress(transfer_id, received, total);
            }
            Ok(ChunkOutcome::Duplicate) => {
                tracing::debug!(transfer_id, chunk = index, "duplicate chunk");
                self.reply(FrameHeader::ack(transfer_id, index));
            }
            Err(rejection) => {
                tracing::warn!(transfer_id, chunk = index, "chunk rejected: {}", rejection);
                self.reply(FrameHeader::nack(transfer_id, index));
            }
        }
    }

    fn handle_end(mut self, header: &FrameHeader) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let transfer = match self.transfer.take() {
            Some(transfer) if transfer.is_complete() => transfer,
            other => {
                if let Some(transfer) = &other {
                    tracing::warn!(
                        transfer_id = header.transfer_id,
                        missing = ?transfer.missing_chunks(),
                        "END received with chunks missing"
                    );
                }
                self.transfer = other;
                return Ok(Box::new(self));
            }
        };

        let elapsed = transfer.elapsed(self.clock.now());
        let transfer_id = transfer.transfer_id();

        match transfer.finish(header.checksum) {
            Ok(payload) => {
                let secs = elapsed.as_secs_f64().max(0.001);
                tracing::info!(
                    transfer_id,
                    size = payload.len(),
                    duration_ms = elapsed.as_millis() as u64,
                    bps = payload.len() as f64 * 8.0 / secs,
                    "transfer complete"
                );
                self.companion.on_transfer_complete(transfer_id, &payload)?;
                self.delivered += 1;
            }
            Err(e) => {
                tracing::error!(transfer_id, "integrity check failed, payload discarded: {}", e);
            }
        }

        Ok(self.transition::<Listening>())
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl ReceiverFsm<Listening> {
    pub fn new(
        radio: Box<dyn RadioLink>,
        companion: Box<dyn CompanionChannel>,
        clock: Box<dyn Clock>,
        config: ProtocolConfig,
    ) -> Box<dyn ReceiverState> {
        Box::new(ReceiverFsm {
            state: PhantomData::<Listening>,
            radio,
            companion,
            clock,
            config,
            transfer: None,
            delivered: 0,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
