//! Disk storage: writes verified pieces into the files a torrent
//! describes.
//!
//! Not on the network I/O path — invoked only by the piece manager's
//! caller after a piece's SHA-1 has verified, so a corrupted in-flight
//! piece never touches disk.
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::torrent::{Mode, Torrent};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create output directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },

    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: std::io::Error },

    #[error("failed to write to {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
}

/// One (file, byte-range-within-file) slice of a piece write.
struct FileSpan {
    path: PathBuf,
    file_offset: u64,
    piece_offset: usize,
    len: usize,
}

/// Maps a verified piece's bytes onto the files under `output_dir`.
pub struct Storage {
    output_dir: PathBuf,
}

impl Storage {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self { output_dir: output_dir.into() }
    }

    /// Pre-creates the directory tree for multi-file torrents and
    /// truncates/creates every destination file to its final length.
    #[instrument(skip(self, torrent))]
    pub async fn prepare(&self, torrent: &Torrent) -> Result<(), StorageError> {
        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| StorageError::CreateDir { path: self.output_dir.clone(), source })?;

        match &torrent.info.mode {
            Mode::SingleFile { length } => {
                let path = self.output_dir.join(&torrent.info.name);
                self.allocate(&path, *length).await?;
            }
            Mode::MultiFile { files } => {
                let root = self.output_dir.join(&torrent.info.name);
                let mut cursor = 0u64;
                for entry in files {
                    let mut path = root.clone();
                    path.extend(&entry.path);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).await.map_err(|source| {
                            StorageError::CreateDir { path: parent.to_path_buf(), source }
                        })?;
                    }
                    self.allocate(&path, entry.length).await?;
                    cursor += entry.length;
                }
                debug!(total = cursor, "multi-file layout allocated");
            }
        }
        Ok(())
    }

    async fn allocate(&self, path: &Path, length: u64) -> Result<(), StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .await
            .map_err(|source| StorageError::Open { path: path.to_path_buf(), source })?;
        file.set_len(length)
            .await
            .map_err(|source| StorageError::Write { path: path.to_path_buf(), source })?;
        Ok(())
    }

    /// Writes a verified piece's bytes, splitting across file boundaries
    /// for multi-file torrents.
    #[instrument(skip(self, torrent, data))]
    pub async fn write_piece(&self, torrent: &Torrent, index: usize, data: &[u8]) -> Result<(), StorageError> {
        for span in self.spans_for_piece(torrent, index) {
            let mut file = OpenOptions::new()
                .write(true)
                .open(&span.path)
                .await
                .map_err(|source| StorageError::Open { path: span.path.clone(), source })?;
            file.seek(SeekFrom::Start(span.file_offset))
                .await
                .map_err(|source| StorageError::Write { path: span.path.clone(), source })?;
            file.write_all(&data[span.piece_offset..span.piece_offset + span.len])
                .await
                .map_err(|source| StorageError::Write { path: span.path.clone(), source })?;
        }
        Ok(())
    }

    /// Computes the file-relative byte ranges a piece overlaps, mirroring
    /// [`Torrent::file_paths_for_piece`] but keeping the byte offsets
    /// needed to perform the writes.
    fn spans_for_piece(&self, torrent: &Torrent, index: usize) -> Vec<FileSpan> {
        let piece_start = index as u64 * torrent.info.piece_length as u64;
        let piece_size = torrent.piece_size(index);
        let piece_end = piece_start + piece_size;

        match &torrent.info.mode {
            Mode::SingleFile { .. } => vec![FileSpan {
                path: self.output_dir.join(&torrent.info.name),
                file_offset: piece_start,
                piece_offset: 0,
                len: piece_size as usize,
            }],
            Mode::MultiFile { files } => {
                let root = self.output_dir.join(&torrent.info.name);
                let mut spans = Vec::new();
                let mut cursor = 0u64;
                for entry in files {
                    let file_start = cursor;
                    let file_end = file_start + entry.length;
                    if file_end > piece_start && file_start < piece_end {
                        let overlap_start = piece_start.max(file_start);
                        let overlap_end = piece_end.min(file_end);
                        let mut path = root.clone();
                        path.extend(&entry.path);
                        spans.push(FileSpan {
                            path,
                            file_offset: overlap_start - file_start,
                            piece_offset: (overlap_start - piece_start) as usize,
                            len: (overlap_end - overlap_start) as usize,
                        });
                    }
                    cursor = file_end;
                }
                spans
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_torrent() -> Torrent {
        let pieces = vec![0u8; 40];
        let mut buf = Vec::new();
        buf.extend(b"d8:announce3:foo4:infod5:filesld6:lengthi5e4:pathl1:aeed6:lengthi5e4:pathl1:beee4:name4:root12:piece lengthi8e6:pieces40:");
        buf.extend(&pieces);
        buf.extend(b"ee");
        Torrent::parse(&buf).unwrap()
    }

    #[test]
    fn splits_piece_across_two_files_at_correct_offsets() {
        let torrent = fixture_torrent();
        let storage = Storage::new("/tmp/does-not-matter");
        let spans = storage.spans_for_piece(&torrent, 0);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].file_offset, 0);
        assert_eq!(spans[0].piece_offset, 0);
        assert_eq!(spans[0].len, 5);
        assert_eq!(spans[1].file_offset, 0);
        assert_eq!(spans[1].piece_offset, 5);
        assert_eq!(spans[1].len, 3);
    }
}
