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

// Chunked photo transfer over a LoRa modem
mod checksum;
mod clock;
mod companion;
mod config;
mod protocol;
mod radio;
mod reassembly;
mod receiver;
mod sender;

use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use clock::SystemClock;
use companion::DirectoryCompanion;
use config::ProtocolConfig;
use protocol::TransferIds;
use radio::SerialRadio;

#[derive(Parser)]
#[command(name = "phototunnel")]
#[command(about = "Chunked photo transfer over a serial-attached LoRa modem", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port of the modem (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// Payload bytes per DATA frame; must match on both stations
    #[arg(long, default_value = "200", value_name = "BYTES")]
    chunk_size: usize,

    /// Largest payload accepted or sent
    #[arg(long, default_value = "100000", value_name = "BYTES")]
    max_payload: usize,

    /// Transmissions per chunk before the transfer is aborted
    #[arg(long, default_value = "3", value_name = "N")]
    max_attempts: u8,

    /// How long the sender waits for an ACK or NACK
    #[arg(long, default_value = "2000", value_name = "MS")]
    ack_timeout: u64,

    /// Pause between START and the first DATA frame
    #[arg(long, default_value = "500", value_name = "MS")]
    settle_delay: u64,

    /// Pause before re-sending a chunk
    #[arg(long, default_value = "100", value_name = "MS")]
    retry_delay: u64,

    /// Receiver drops a transfer after this long without a new chunk
    #[arg(long, default_value = "10000", value_name = "MS")]
    inactivity_timeout: u64,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one or more photos
    Send {
        /// Files to send, one transfer each
        #[arg(required_unless_present = "demo")]
        files: Vec<PathBuf>,

        /// Send a built-in 2 KB test image instead of files
        #[arg(long, conflicts_with = "files")]
        demo: bool,
    },
    /// Receive photos into a directory
    Receive {
        /// Directory to save received photos
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Exit after the first photo is saved
        #[arg(long)]
        once: bool,
    },
    /// Transmit a single PING probe
    Ping,
}

impl Cli {
    fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            chunk_size: self.chunk_size,
            max_payload: self.max_payload,
            max_attempts: self.max_attempts,
            ack_timeout: Duration::from_millis(self.ack_timeout),
            settle_delay: Duration::from_millis(self.settle_delay),
            retry_delay: Duration::from_millis(self.retry_delay),
            inactivity_timeout: Duration::from_millis(self.inactivity_timeout),
            ..ProtocolConfig::default()
        }
    }
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "phototunnel=debug" } else { "phototunnel=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn exit_with(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let data_bits = parse_data_bits(cli.data_bits).unwrap_or_else(|e| exit_with(e));
    let parity = parse_parity(&cli.parity).unwrap_or_else(|e| exit_with(e));
    let stop_bits = parse_stop_bits(cli.stop_bits).unwrap_or_else(|e| exit_with(e));

    let config = cli.protocol_config();
    if let Err(e) = config.validate() {
        exit_with(e);
    }

    tracing::info!(port = %cli.port, "opening modem");
    tracing::info!("settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let radio = match SerialRadio::open(&cli.port, cli.baud, data_bits, parity, stop_bits) {
        Ok(radio) => radio,
        Err(e) => exit_with(format!("failed to open serial port: {}", e)),
    };

    match cli.command {
        Commands::Send { files, demo } => {
            if let Err(e) = send_photos(radio, config, files, demo) {
                exit_with(format!("send failed: {}", e));
            }
        }
        Commands::Receive { output_dir, once } => {
            if !output_dir.is_dir() {
                exit_with(format!("output directory not found: {}", output_dir.display()));
            }
            tracing::info!(dir = %output_dir.display(), "receiving photos");
            if let Err(e) = receive_photos(radio, config, output_dir, once) {
                exit_with(format!("receive failed: {}", e));
            }
        }
        Commands::Ping => {
            let mut radio = radio;
            let transfer_id = TransferIds::new().next();
            if let Err(e) = sender::send_ping(&mut radio, transfer_id) {
                exit_with(format!("ping failed: {}", e));
            }
            tracing::info!(transfer_id, "PING sent");
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error(transparent)]
    Radio(#[from] radio::RadioError),

    #[error(transparent)]
    Transfer(#[from] sender::SenderError),
}

fn send_photos(radio: SerialRadio, config: ProtocolConfig, files: Vec<PathBuf>, demo: bool) -> Result<(), SendError> {
    use sender::SenderFsm;

    let mut payloads = Vec::new();
    if demo {
        payloads.push(("demo image".to_string(), sender::demo_photo()));
    }
    for path in files {
        let data = std::fs::read(&path).map_err(|source| SendError::Read { path: path.clone(), source })?;
        payloads.push((path.display().to_string(), data));
    }

    let mut ids = TransferIds::new();
    for (name, payload) in payloads {
        let size = payload.len();
        let state = SenderFsm::new(
            Box::new(radio.try_clone()?),
            Box::new(SystemClock),
            config.clone(),
            payload,
            ids.next(),
        )?;
        tracing::info!(transfer_id = state.transfer_id(), "sending {} ({} bytes)", name, size);
        let report = sender::run_transfer(state)?;

        println!(
            "{}: {} bytes in {:.2}s, {:.0} bit/s, {:.0} B/s, {} retries",
            name,
            report.total_size,
            report.elapsed.as_secs_f64(),
            report.bits_per_second(),
            report.bits_per_second() / 8.0,
            report.failed_attempts
        );
    }
    Ok(())
}

fn receive_photos(
    radio: SerialRadio,
    config: ProtocolConfig,
    output_dir: PathBuf,
    once: bool,
) -> Result<(), receiver::ReceiverError> {
    use receiver::ReceiverFsm;

    let companion = DirectoryCompanion::new(output_dir);
    let mut state = ReceiverFsm::new(Box::new(radio), Box::new(companion), Box::new(SystemClock), config);

    loop {
        state = state.step()?;
        if once && state.delivered() > 0 {
            return Ok(());
        }
    }
}
