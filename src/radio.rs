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

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};
use crate::protocol::RADIO_MTU;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("frame of {len} bytes exceeds radio MTU of {}", RADIO_MTU)]
    FrameTooLarge { len: usize },
}

// ============================================================================
// RadioLink Trait
// ============================================================================

/// Link quality of the most recent packet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalQuality {
    pub rssi_dbm: i16,
    pub snr_db: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub bytes: Vec<u8>,
    pub quality: SignalQuality,
}

/// Half-duplex packet radio operations needed by the photo tunnel.
/// Transmitting implicitly leaves receive mode.
pub trait RadioLink: Send {
    fn transmit(&mut self, frame: &[u8]) -> Result<(), RadioError>;

    fn start_listening(&mut self) -> Result<(), RadioError>;

    /// Wait up to `timeout` for one inbound packet. `Ok(None)` means the
    /// timeout expired with nothing received.
    fn poll_frame(&mut self, timeout: Duration) -> Result<Option<ReceivedFrame>, RadioError>;

    fn signal_quality(&self) -> SignalQuality;
}

// ============================================================================
// KISS framing
// ============================================================================

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

/// Data frame on port 0
pub const CMD_DATA: u8 = 0x00;

/// RSSI of the last packet, offset by `RSSI_OFFSET`
pub const CMD_STAT_RSSI: u8 = 0x23;

/// SNR of the last packet in quarter dB, signed
pub const CMD_STAT_SNR: u8 = 0x24;

pub const RSSI_OFFSET: i16 = 157;

pub fn kiss_encode(command: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    out.push(FEND);
    out.push(command);
    for &byte in data {
        match byte {
            FEND => out.extend_from_slice(&[FESC, TFEND]),
            FESC => out.extend_from_slice(&[FESC, TFESC]),
            b => out.push(b),
        }
    }
    out.push(FEND);
    out
}

/// Incremental KISS decoder fed one byte at a time from the modem.
#[derive(Debug, Default)]
pub struct KissDecoder {
    buffer: Vec<u8>,
    in_frame: bool,
    escaped: bool,
}

impl KissDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `(command, data)` once a non-empty frame is closed.
    pub fn push(&mut self, byte: u8) -> Option<(u8, Vec<u8>)> {
        if byte == FEND {
            let frame = if self.in_frame && !self.buffer.is_empty() {
                let command = self.buffer[0];
                Some((command, self.buffer[1..].to_vec()))
            } else {
                None
            };
            self.buffer.clear();
            self.in_frame = true;
            self.escaped = false;
            return frame;
        }

        if !self.in_frame {
            return None;
        }

        if self.escaped {
            self.escaped = false;
            match byte {
                TFEND => self.buffer.push(FEND),
                TFESC => self.buffer.push(FESC),
                _ => {
                    // Invalid escape, drop the frame
                    self.buffer.clear();
                    self.in_frame = false;
                }
            }
        } else if byte == FESC {
            self.escaped = true;
        } else {
            self.buffer.push(byte);
        }

        None
    }
}

// ============================================================================
// Serial-attached modem
// ============================================================================

/// LoRa modem on a serial port speaking KISS. Modulation settings live on
/// the modem and must match on both stations.
pub struct SerialRadio {
    port: Box<dyn SerialPortTrait>,
    decoder: KissDecoder,
    quality: SignalQuality,
}

impl SerialRadio {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, RadioError> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(SerialRadio {
            port,
            decoder: KissDecoder::new(),
            quality: SignalQuality::default(),
        })
    }

    /// Another handle on the same port, for running transfers back to back.
    pub fn try_clone(&self) -> Result<Self, RadioError> {
        Ok(SerialRadio {
            port: self.port.try_clone()?,
            decoder: KissDecoder::new(),
            quality: self.quality,
        })
    }

    fn handle_kiss(&mut self, command: u8, data: Vec<u8>) -> Option<ReceivedFrame> {
        if command == CMD_DATA {
            return Some(ReceivedFrame { bytes: data, quality: self.quality });
        }

        match (command, data.as_slice()) {
            (CMD_STAT_RSSI, [raw]) => {
                self.quality.rssi_dbm = *raw as i16 - RSSI_OFFSET;
                None
            }
            (CMD_STAT_SNR, [raw]) => {
                self.quality.snr_db = (*raw as i8) as f32 / 4.0;
                None
            }
            _ => {
                tracing::trace!(command, len = data.len(), "ignoring modem frame");
                None
            }
        }
    }
}

impl RadioLink for SerialRadio {
    fn transmit(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        if frame.len() > RADIO_MTU {
            return Err(RadioError::FrameTooLarge { len: frame.len() });
        }
        self.port.write_all(&kiss_encode(CMD_DATA, frame))?;
        self.port.flush()?;
        Ok(())
    }

    fn start_listening(&mut self) -> Result<(), RadioError> {
        // The modem drops back to receive after every transmission
        Ok(())
    }

    fn poll_frame(&mut self, timeout: Duration) -> Result<Option<ReceivedFrame>, RadioError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            self.port.set_timeout(remaining)?;
            let n = match self.port.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            for &byte in &buf[..n] {
                if let Some((command, data)) = self.decoder.push(byte) {
                    if let Some(frame) = self.handle_kiss(command, data) {
                        return Ok(Some(frame));
                    }
                }
            }
        }
    }

    fn signal_quality(&self) -> SignalQuality {
        self.quality
    }
}

// ============================================================================
// Mock Radio for Testing
// ============================================================================

#[cfg(test)]
pub use mock::{MockEvent, MockRadio, TransmitLog, channel_pair};

#[cfg(test)]
mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
    use crate::clock::MockClock;

    /// One scripted outcome of `poll_frame`.
    #[derive(Debug, Clone)]
    pub enum MockEvent {
        Frame(Vec<u8>),
        /// Timeout with nothing received
        Silence,
        /// Nothing received for this long; advances the mock clock
        Idle(Duration),
    }

    /// Every frame a mock radio transmitted, shared with the test.
    #[derive(Clone, Default)]
    pub struct TransmitLog(Arc<Mutex<Vec<Vec<u8>>>>);

    impl TransmitLog {
        pub fn frames(&self) -> Vec<Vec<u8>> {
            self.0.lock().unwrap().clone()
        }
    }

    pub struct MockRadio {
        events: VecDeque<MockEvent>,
        clock: MockClock,
        log: TransmitLog,
        failing_calls: Vec<usize>,
        transmit_calls: usize,
    }

    impl MockRadio {
        pub fn new(clock: MockClock, events: Vec<MockEvent>) -> Self {
            MockRadio {
                events: events.into(),
                clock,
                log: TransmitLog::default(),
                failing_calls: Vec::new(),
                transmit_calls: 0,
            }
        }

        /// Transmit calls at these 0-based positions fail and are not logged.
        pub fn fail_transmit_calls(mut self, calls: &[usize]) -> Self {
            self.failing_calls = calls.to_vec();
            self
        }

        pub fn log(&self) -> TransmitLog {
            self.log.clone()
        }
    }

    impl RadioLink for MockRadio {
        fn transmit(&mut self, frame: &[u8]) -> Result<(), RadioError> {
            let call = self.transmit_calls;
            self.transmit_calls += 1;
            if self.failing_calls.contains(&call) {
                return Err(RadioError::Io(std::io::Error::new(ErrorKind::Other, "Mock TX failure")));
            }
            self.log.0.lock().unwrap().push(frame.to_vec());
            Ok(())
        }

        fn start_listening(&mut self) -> Result<(), RadioError> {
            Ok(())
        }

        fn poll_frame(&mut self, timeout: Duration) -> Result<Option<ReceivedFrame>, RadioError> {
            match self.events.pop_front() {
                Some(MockEvent::Frame(bytes)) => Ok(Some(ReceivedFrame {
                    bytes,
                    quality: self.signal_quality(),
                })),
                Some(MockEvent::Idle(duration)) => {
                    self.clock.advance(duration);
                    Ok(None)
                }
                // Out of events = timeout
                Some(MockEvent::Silence) | None => {
                    self.clock.advance(timeout);
                    Ok(None)
                }
            }
        }

        fn signal_quality(&self) -> SignalQuality {
            SignalQuality { rssi_dbm: -42, snr_db: 9.5 }
        }
    }

    impl Drop for MockRadio {
        fn drop(&mut self) {
            if !std::thread::panicking() {
                assert!(
                    self.events.is_empty(),
                    "MockRadio dropped with {} unconsumed events: {:?}",
                    self.events.len(),
                    self.events
                );
            }
        }
    }

    type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

    /// In-process radio; frames sent on one end arrive at the other.
    pub struct ChannelRadio {
        tx: Sender<Vec<u8>>,
        rx: Receiver<Vec<u8>>,
        drop_filter: Option<DropFilter>,
    }

    impl ChannelRadio {
        /// Frames for which `filter` returns true are lost in the air.
        pub fn lose_when(mut self, filter: impl FnMut(&[u8]) -> bool + Send + 'static) -> Self {
            self.drop_filter = Some(Box::new(filter));
            self
        }
    }

    pub fn channel_pair() -> (ChannelRadio, ChannelRadio) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            ChannelRadio { tx: a_tx, rx: a_rx, drop_filter: None },
            ChannelRadio { tx: b_tx, rx: b_rx, drop_filter: None },
        )
    }

    impl RadioLink for ChannelRadio {
        fn transmit(&mut self, frame: &[u8]) -> Result<(), RadioError> {
            if let Some(filter) = self.drop_filter.as_mut() {
                if filter(frame) {
                    return Ok(());
                }
            }
            // The far end may already be gone; that is just a lost packet
            let _ = self.tx.send(frame.to_vec());
            Ok(())
        }

        fn start_listening(&mut self) -> Result<(), RadioError> {
            Ok(())
        }

        fn poll_frame(&mut self, timeout: Duration) -> Result<Option<ReceivedFrame>, RadioError> {
            match self.rx.recv_timeout(timeout) {
                Ok(bytes) => Ok(Some(ReceivedFrame { bytes, quality: self.signal_quality() })),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(timeout);
                    Ok(None)
                }
            }
        }

        fn signal_quality(&self) -> SignalQuality {
            SignalQuality::default()
        }
    }
}
