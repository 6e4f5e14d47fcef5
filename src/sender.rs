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

use std::fmt;
use std::marker::PhantomData;
use std::time::{Duration, Instant};
use crate::checksum::{head_sample, tail_sample};
use crate::clock::Clock;
use crate::config::ProtocolConfig;
use crate::protocol::*;
use crate::radio::{RadioError, RadioLink};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("payload is empty")]
    EmptyPayload,

    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("START frame not sent: {0}")]
    StartFailed(#[source] RadioError),

    #[error("END frame not sent: {0}")]
    EndFailed(#[source] RadioError),

    #[error("chunk {chunk_index} not delivered after {attempts} attempts")]
    ChunkDeliveryFailed { chunk_index: u16, attempts: u8 },
}

/// Why a single transmission of a chunk did not get acknowledged.
#[derive(Debug)]
pub enum AttemptFailure {
    Timeout,
    Nack,
    Radio(RadioError),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Timeout => write!(f, "ACK timeout"),
            AttemptFailure::Nack => write!(f, "NACK received"),
            AttemptFailure::Radio(e) => write!(f, "radio error: {}", e),
        }
    }
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub transfer_id: u32,
    pub total_size: usize,
    pub chunk_count: u16,
    /// From the first DATA frame until END was sent
    pub elapsed: Duration,
    pub failed_attempts: u32,
}

impl TransferReport {
    pub fn bits_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64().max(0.001);
        self.total_size as f64 * 8.0 / secs
    }
}

// ============================================================================
// States
// ============================================================================

pub struct Announce;
pub struct SendChunk;
pub struct Finish;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    radio: Box<dyn RadioLink>,
    clock: Box<dyn Clock>,
    config: ProtocolConfig,
    payload: Vec<u8>,
    transfer_id: u32,
    chunk_count: u16,
    chunk_index: u16,
    attempts: u8,
    failed_attempts: u32,
    started_at: Option<Instant>,
}

pub enum Step {
    Next(Box<dyn SenderState>),
    Complete(TransferReport),
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Step, SenderError>;

    fn transfer_id(&self) -> u32;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            radio: self.radio,
            clock: self.clock,
            config: self.config,
            payload: self.payload,
            transfer_id: self.transfer_id,
            chunk_count: self.chunk_count,
            chunk_index: self.chunk_index,
            attempts: self.attempts,
            failed_attempts: self.failed_attempts,
            started_at: self.started_at,
        })
    }
}

fn next<S>(fsm: Box<SenderFsm<S>>) -> Result<Step, SenderError>
where
    SenderFsm<S>: SenderState + 'static,
{
    Ok(Step::Next(fsm as Box<dyn SenderState>))
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<Announce> {
    fn step(self: Box<Self>) -> Result<Step, SenderError> {
        let mut fsm = *self;

        let frame = start_frame(
            fsm.transfer_id,
            fsm.payload.len() as u32,
            fsm.chunk_count,
            head_sample(&fsm.payload),
        );
        fsm.radio.transmit(&frame).map_err(SenderError::StartFailed)?;
        tracing::info!(
            transfer_id = fsm.transfer_id,
            size = fsm.payload.len(),
            chunks = fsm.chunk_count,
            chunk_size = fsm.config.chunk_size,
            "sent START"
        );

        // Receiver allocates its buffer on START; the first chunk must not
        // arrive before that.
        fsm.clock.sleep(fsm.config.settle_delay);
        fsm.started_at = Some(fsm.clock.now());

        next(fsm.transition::<SendChunk>())
    }

    fn transfer_id(&self) -> u32 {
        self.transfer_id
    }
}

impl SenderState for SenderFsm<SendChunk> {
    fn step(self: Box<Self>) -> Result<Step, SenderError> {
        let mut fsm = *self;
        let index = fsm.chunk_index;

        if fsm.attempts > 0 {
            fsm.clock.sleep(fsm.config.retry_delay);
            tracing::info!(chunk = index, attempt = fsm.attempts + 1, max = fsm.config.max_attempts, "retrying chunk");
        }
        fsm.attempts += 1;

        match fsm.deliver_chunk(index) {
            Ok(()) => {
                fsm.attempts = 0;
                fsm.chunk_index += 1;
                tracing::info!(
                    chunk = index,
                    "[{}/{}] {}",
                    fsm.chunk_index,
                    fsm.chunk_count,
                    progress_bar(fsm.chunk_index, fsm.chunk_count)
                );

                if fsm.chunk_index == fsm.chunk_count {
                    next(fsm.transition::<Finish>())
                } else {
                    next(Box::new(fsm))
                }
            }
            Err(failure) => {
                fsm.failed_attempts += 1;
                tracing::warn!(chunk = index, attempt = fsm.attempts, "{}", failure);

                if fsm.attempts >= fsm.config.max_attempts {
                    tracing::error!(
                        transfer_id = fsm.transfer_id,
                        chunk = index,
                        attempts = fsm.attempts,
                        "chunk not delivered, aborting transfer"
                    );
                    return Err(SenderError::ChunkDeliveryFailed {
                        chunk_index: index,
                        attempts: fsm.attempts,
                    });
                }
                next(Box::new(fsm))
            }
        }
    }

    fn transfer_id(&self) -> u32 {
        self.transfer_id
    }
}

impl SenderState for SenderFsm<Finish> {
    fn step(self: Box<Self>) -> Result<Step, SenderError> {
        let mut fsm = *self;

        let frame = end_frame(
            fsm.transfer_id,
            fsm.payload.len() as u32,
            fsm.chunk_count,
            tail_sample(&fsm.payload),
        );
        fsm.radio.transmit(&frame).map_err(SenderError::EndFailed)?;
        tracing::debug!(transfer_id = fsm.transfer_id, "sent END");

        let now = fsm.clock.now();
        let elapsed = fsm
            .started_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();

        let report = TransferReport {
            transfer_id: fsm.transfer_id,
            total_size: fsm.payload.len(),
            chunk_count: fsm.chunk_count,
            elapsed,
            failed_attempts: fsm.failed_attempts,
        };
        tracing::info!(
            transfer_id = report.transfer_id,
            duration_ms = report.elapsed.as_millis() as u64,
            bps = report.bits_per_second(),
            failed_attempts = report.failed_attempts,
            "transfer complete"
        );
        Ok(Step::Complete(report))
    }

    fn transfer_id(&self) -> u32 {
        self.transfer_id
    }
}

impl SenderFsm<SendChunk> {
    /// One transmission of `index` followed by a bounded wait for its reply.
    fn deliver_chunk(&mut self, index: u16) -> Result<(), AttemptFailure> {
        let range = chunk_range(self.payload.len(), self.config.chunk_size, index as usize);
        let frame = data_frame(self.transfer_id, index, &self.payload[range]);

        self.radio.transmit(&frame).map_err(AttemptFailure::Radio)?;
        tracing::debug!(chunk = index, bytes = frame.len() - HEADER_LEN, "sent DATA");

        self.radio.start_listening().map_err(AttemptFailure::Radio)?;
        self.await_reply(index)
    }

    fn await_reply(&mut self, index: u16) -> Result<(), AttemptFailure> {
        let deadline = self.clock.now() + self.config.ack_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(self.clock.now());
            if remaining.is_zero() {
                return Err(AttemptFailure::Timeout);
            }

            let Some(received) = self.radio.poll_frame(remaining).map_err(AttemptFailure::Radio)? else {
                return Err(AttemptFailure::Timeout);
            };

            match decode_frame(&received.bytes) {
                Ok((header, _)) if header.transfer_id == self.transfer_id && header.chunk_index == index => {
                    match header.frame_type {
                        FrameType::Ack => {
                            tracing::debug!(chunk = index, rssi = received.quality.rssi_dbm, "ACK");
                            return Ok(());
                        }
                        FrameType::Nack => return Err(AttemptFailure::Nack),
                        other => tracing::debug!(?other, "ignoring frame while awaiting ACK"),
                    }
                }
                Ok((header, _)) => {
                    tracing::debug!(
                        frame_type = ?header.frame_type,
                        transfer_id = header.transfer_id,
                        chunk = header.chunk_index,
                        "ignoring unrelated frame"
                    );
                }
                Err(e) => tracing::debug!("ignoring undecodable frame: {}", e),
            }
        }
    }
}

// ============================================================================
// Constructor & Helpers
// ============================================================================

impl SenderFsm<Announce> {
    pub fn new(
        radio: Box<dyn RadioLink>,
        clock: Box<dyn Clock>,
        config: ProtocolConfig,
        payload: Vec<u8>,
        transfer_id: u32,
    ) -> Result<Box<dyn SenderState>, SenderError> {
        if payload.is_empty() {
            return Err(SenderError::EmptyPayload);
        }
        let chunks = chunk_count(payload.len(), config.chunk_size);
        if payload.len() > config.max_payload || chunks > u16::MAX as usize {
            return Err(SenderError::PayloadTooLarge { size: payload.len(), max: config.max_payload });
        }
        let chunk_count = chunks as u16;

        Ok(Box::new(SenderFsm {
            state: PhantomData::<Announce>,
            radio,
            clock,
            config,
            payload,
            transfer_id,
            chunk_count,
            chunk_index: 0,
            attempts: 0,
            failed_attempts: 0,
            started_at: None,
        }))
    }
}

/// Drive a sender until the transfer completes or aborts.
pub fn run_transfer(mut state: Box<dyn SenderState>) -> Result<TransferReport, SenderError> {
    loop {
        match state.step()? {
            Step::Next(next_state) => state = next_state,
            Step::Complete(report) => return Ok(report),
        }
    }
}

/// Transmit a connectivity probe.
pub fn send_ping(radio: &mut dyn RadioLink, transfer_id: u32) -> Result<(), RadioError> {
    radio.transmit(&FrameHeader::ping(transfer_id).encode(&[]))
}

/// 2 KB JPEG-shaped test pattern.
pub fn demo_photo() -> Vec<u8> {
    const SIZE: usize = 2048;
    let mut photo: Vec<u8> = (0..SIZE).map(|i| (i * 137 % 256) as u8).collect();
    photo[..2].copy_from_slice(&[0xFF, 0xD8]);
    photo[SIZE - 2..].copy_from_slice(&[0xFF, 0xD9]);
    photo
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::radio::{MockEvent, MockRadio};

    const ID: u32 = 0xC0FFEE;

    fn ack(index: u16) -> MockEvent {
        MockEvent::Frame(FrameHeader::ack(ID, index).encode(&[]))
    }

    fn nack(index: u16) -> MockEvent {
        MockEvent::Frame(FrameHeader::nack(ID, index).encode(&[]))
    }

    fn sender(radio: MockRadio, clock: &MockClock, payload: Vec<u8>) -> Box<dyn SenderState> {
        SenderFsm::new(Box::new(radio), Box::new(clock.clone()), ProtocolConfig::default(), payload, ID)
            .expect("valid payload")
    }

    /// Frame types and chunk indices, in transmit order.
    fn summarize(frames: &[Vec<u8>]) -> Vec<(FrameType, u16)> {
        frames
            .iter()
            .map(|f| {
                let (header, _) = decode_frame(f).expect("decode");
                (header.frame_type, header.chunk_index)
            })
            .collect()
    }

    #[test]
    fn test_sender_full_transfer() {
        let clock = MockClock::new();
        let payload = demo_photo();
        let radio = MockRadio::new(clock.clone(), (0..11).map(ack).collect());
        let log = radio.log();

        let report = run_transfer(sender(radio, &clock, payload.clone())).expect("transfer");
        assert_eq!(report.transfer_id, ID);
        assert_eq!(report.chunk_count, 11);
        assert_eq!(report.total_size, 2048);
        assert_eq!(report.failed_attempts, 0);

        let frames = log.frames();
        assert_eq!(frames.len(), 13);
        assert_eq!(frames[0], start_frame(ID, 2048, 11, head_sample(&payload)));
        for i in 0..11u16 {
            let range = chunk_range(2048, 200, i as usize);
            assert_eq!(frames[1 + i as usize], data_frame(ID, i, &payload[range]));
        }
        assert_eq!(frames[12], end_frame(ID, 2048, 11, tail_sample(&payload)));

        let (_, last) = decode_frame(&frames[11]).expect("decode");
        assert_eq!(last.len(), 48);

        // Only the settle delay consumed time
        assert_eq!(clock.elapsed(), Duration::from_millis(500));
    }

    #[test]
    fn test_sender_nack_retry() {
        let clock = MockClock::new();
        let radio = MockRadio::new(clock.clone(), vec![nack(0), ack(0)]);
        let log = radio.log();

        let report = run_transfer(sender(radio, &clock, b"retry me".to_vec())).expect("transfer");
        assert_eq!(report.failed_attempts, 1);
        assert_eq!(
            summarize(&log.frames()),
            vec![(FrameType::Start, 0), (FrameType::Data, 0), (FrameType::Data, 0), (FrameType::End, 1)]
        );
        assert_eq!(clock.elapsed(), Duration::from_millis(500 + 100));
    }

    #[test]
    fn test_sender_timeout_retry() {
        let clock = MockClock::new();
        let radio = MockRadio::new(clock.clone(), vec![MockEvent::Silence, ack(0)]);
        let log = radio.log();

        let report = run_transfer(sender(radio, &clock, vec![7u8; 10])).expect("transfer");
        assert_eq!(report.failed_attempts, 1);
        assert_eq!(log.frames().len(), 4);
        assert_eq!(report.elapsed, Duration::from_millis(2000 + 100));
    }

    #[test]
    fn test_sender_ignores_unrelated_frames() {
        let clock = MockClock::new();
        let events = vec![
            MockEvent::Frame(FrameHeader::ack(ID + 1, 0).encode(&[])),
            MockEvent::Frame(FrameHeader::nack(ID, 3).encode(&[])),
            MockEvent::Frame(FrameHeader::ping(ID).encode(&[])),
            MockEvent::Frame(vec![0x04, 0x01]),
            ack(0),
        ];
        let radio = MockRadio::new(clock.clone(), events);

        let report = run_transfer(sender(radio, &clock, vec![1, 2, 3])).expect("transfer");
        assert_eq!(report.failed_attempts, 0);
    }

    #[test]
    fn test_sender_retry_bound() {
        let clock = MockClock::new();
        let radio = MockRadio::new(clock.clone(), vec![MockEvent::Silence; 3]);
        let log = radio.log();

        let result = run_transfer(sender(radio, &clock, vec![0xAB; 450]));
        assert!(matches!(
            result,
            Err(SenderError::ChunkDeliveryFailed { chunk_index: 0, attempts: 3 })
        ));

        // START then exactly three copies of chunk 0, nothing for chunk 1
        assert_eq!(
            summarize(&log.frames()),
            vec![(FrameType::Start, 0), (FrameType::Data, 0), (FrameType::Data, 0), (FrameType::Data, 0)]
        );
        assert_eq!(clock.elapsed(), Duration::from_millis(500 + 3 * 2000 + 2 * 100));
    }

    #[test]
    fn test_sender_aborts_on_undeliverable_chunk() {
        let clock = MockClock::new();
        let mut events: Vec<MockEvent> = (0..5).map(ack).collect();
        events.extend([nack(5), MockEvent::Silence, nack(5)]);
        let radio = MockRadio::new(clock.clone(), events);
        let log = radio.log();

        let result = run_transfer(sender(radio, &clock, demo_photo()));
        assert!(matches!(
            result,
            Err(SenderError::ChunkDeliveryFailed { chunk_index: 5, attempts: 3 })
        ));

        let sent = summarize(&log.frames());
        assert_eq!(sent.len(), 1 + 5 + 3);
        assert!(!sent.contains(&(FrameType::Data, 6)));
        assert!(sent.iter().all(|(t, _)| *t != FrameType::End));
    }

    #[test]
    fn test_sender_transmit_error_consumes_attempt() {
        let clock = MockClock::new();
        // Call 0 is START, call 1 the first DATA
        let radio = MockRadio::new(clock.clone(), vec![ack(0)]).fail_transmit_calls(&[1]);
        let log = radio.log();

        let report = run_transfer(sender(radio, &clock, vec![9u8; 20])).expect("transfer");
        assert_eq!(report.failed_attempts, 1);
        assert_eq!(
            summarize(&log.frames()),
            vec![(FrameType::Start, 0), (FrameType::Data, 0), (FrameType::End, 1)]
        );
    }

    #[test]
    fn test_sender_transmit_errors_exhaust_retries() {
        let clock = MockClock::new();
        let radio = MockRadio::new(clock.clone(), vec![]).fail_transmit_calls(&[1, 2, 3]);

        let result = run_transfer(sender(radio, &clock, vec![9u8; 20]));
        assert!(matches!(
            result,
            Err(SenderError::ChunkDeliveryFailed { chunk_index: 0, attempts: 3 })
        ));
    }

    #[test]
    fn test_sender_start_failure() {
        let clock = MockClock::new();
        let radio = MockRadio::new(clock.clone(), vec![]).fail_transmit_calls(&[0]);
        let log = radio.log();

        let result = run_transfer(sender(radio, &clock, vec![1]));
        assert!(matches!(result, Err(SenderError::StartFailed(_))));
        assert!(log.frames().is_empty());
    }

    #[test]
    fn test_sender_rejects_bad_payloads() {
        let clock = MockClock::new();
        let config = ProtocolConfig::default();

        let radio = MockRadio::new(clock.clone(), vec![]);
        let result = SenderFsm::new(Box::new(radio), Box::new(clock.clone()), config.clone(), Vec::new(), ID);
        assert!(matches!(result, Err(SenderError::EmptyPayload)));

        let radio = MockRadio::new(clock.clone(), vec![]);
        let result = SenderFsm::new(Box::new(radio), Box::new(clock), config, vec![0; 100_001], ID);
        assert!(matches!(
            result,
            Err(SenderError::PayloadTooLarge { size: 100_001, max: 100_000 })
        ));
    }

    #[test]
    fn test_ping_frame() {
        let clock = MockClock::new();
        let mut radio = MockRadio::new(clock, vec![]);
        let log = radio.log();

        send_ping(&mut radio, 99).expect("ping");
        let frames = log.frames();
        assert_eq!(frames.len(), 1);
        let (header, attached) = decode_frame(&frames[0]).expect("decode");
        assert_eq!(header.frame_type, FrameType::Ping);
        assert_eq!(header.transfer_id, 99);
        assert!(attached.is_empty());
    }

    #[test]
    fn test_report_throughput() {
        let report = TransferReport {
            transfer_id: 1,
            total_size: 2048,
            chunk_count: 11,
            elapsed: Duration::from_secs(2),
            failed_attempts: 0,
        };
        assert_eq!(report.bits_per_second(), 8192.0);
    }

    #[test]
    fn test_demo_photo_shape() {
        let photo = demo_photo();
        assert_eq!(photo.len(), 2048);
        assert_eq!(&photo[..2], &[0xFF, 0xD8]);
        assert_eq!(&photo[2046..], &[0xFF, 0xD9]);
        assert_eq!(photo[2], (2 * 137 % 256) as u8);
    }
}
