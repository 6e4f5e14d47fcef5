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

use std::fs;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Onward delivery path for received payloads. Only fully reassembled and
/// validated payloads reach `on_transfer_complete`.
pub trait CompanionChannel: Send {
    fn on_transfer_started(&mut self, transfer_id: u32, total_size: u32, chunk_count: u16);

    fn on_progress(&mut self, transfer_id: u32, received_chunks: u16, total_chunks: u16);

    fn on_transfer_complete(&mut self, transfer_id: u32, payload: &[u8]) -> Result<(), CompanionError>;
}

// ============================================================================
// Directory sink
// ============================================================================

/// Writes each completed payload into a directory as `photo_<id>.<ext>`.
pub struct DirectoryCompanion {
    output_dir: PathBuf,
}

impl DirectoryCompanion {
    pub fn new(output_dir: PathBuf) -> Self {
        DirectoryCompanion { output_dir }
    }
}

impl CompanionChannel for DirectoryCompanion {
    fn on_transfer_started(&mut self, transfer_id: u32, total_size: u32, chunk_count: u16) {
        tracing::info!(transfer_id, total_size, chunk_count, "photo incoming");
    }

    fn on_progress(&mut self, transfer_id: u32, received_chunks: u16, total_chunks: u16) {
        tracing::debug!(transfer_id, received_chunks, total_chunks, "photo progress");
    }

    fn on_transfer_complete(&mut self, transfer_id: u32, payload: &[u8]) -> Result<(), CompanionError> {
        let path = self.output_dir.join(photo_filename(transfer_id, payload));
        fs::write(&path, payload).map_err(|source| CompanionError::Write {
            path: path.clone(),
            source,
        })?;
        tracing::info!(transfer_id, path = %path.display(), bytes = payload.len(), "photo saved");
        Ok(())
    }
}

fn photo_filename(transfer_id: u32, payload: &[u8]) -> String {
    let ext = if payload.starts_with(&[0xFF, 0xD8]) { "jpg" } else { "bin" };
    format!("photo_{:08x}.{}", transfer_id, ext)
}

// ============================================================================
// Recording sink for tests
// ============================================================================

#[cfg(test)]
pub use recording::{CompanionEvent, RecordingCompanion};


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photo_filename() {
        assert_eq!(photo_filename(0x1234, &[0xFF, 0xD8, 0xFF, 0xE0]), "photo_00001234.jpg");
        assert_eq!(photo_filename(0xDEADBEEF, b"not a jpeg"), "photo_deadbeef.bin");
        assert_eq!(photo_filename(1, &[0xFF]), "photo_00000001.bin");
    }

    #[test]
    fn test_directory_companion_writes_payload() {
        let dir = std::env::temp_dir().join("phototunnel_companion_test");
        std::fs::create_dir_all(&dir).unwrap();

        let mut companion = DirectoryCompanion::new(dir.clone());
        let payload = vec![0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        companion.on_transfer_started(77, payload.len() as u32, 1);
        companion.on_progress(77, 1, 1);
        companion.on_transfer_complete(77, &payload).expect("write");

        let path = dir.join("photo_0000004d.jpg");
        assert_eq!(std::fs::read(&path).unwrap(), payload);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_directory_companion_missing_dir() {
        let dir = std::env::temp_dir().join("phototunnel_companion_missing").join("nested");
        let mut companion = DirectoryCompanion::new(dir);
        let err = companion.on_transfer_complete(1, b"data").unwrap_err();
        assert!(matches!(err, CompanionError::Write { .. }));
    }
}
