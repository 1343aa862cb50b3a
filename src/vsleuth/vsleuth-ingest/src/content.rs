/*
 * vSleuth mail log forensics
 * Copyright (C) 2022 viridIT SAS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/
use crate::planner::FileEntry;
use anyhow::Context;
use std::io::{Read, Seek};
use vsleuth_common::runner::Cancellation;

/// Follows one growing file, emitting complete lines written after a
/// given offset. Ends when cancelled (or, for test fakes, when the
/// scripted content runs out).
#[async_trait::async_trait]
pub trait FileWatcher: Send {
    /// Watch until cancelled, sending complete lines in on-disk order.
    async fn run(self: Box<Self>, cancellation: Cancellation, lines: tokio::sync::mpsc::Sender<String>);
}

/// What the importer needs from a log directory. Production reads the
/// filesystem; tests script the content.
pub trait DirectoryContent: Send + Sync + 'static {
    /// directory path, for diagnostics.
    fn dir_name(&self) -> String;

    /// every file in the directory with its modification time.
    ///
    /// # Errors
    ///
    /// * the directory cannot be listed
    fn file_entries(&self) -> anyhow::Result<Vec<FileEntry>>;

    /// modification time of one file.
    ///
    /// # Errors
    ///
    /// * the file disappeared
    fn modification_time_for_entry(&self, filename: &str) -> anyhow::Result<time::OffsetDateTime>;

    /// a line reader over the whole file, decompressed when the name
    /// carries a `.gz` / `.bz2` suffix.
    ///
    /// # Errors
    ///
    /// * the file disappeared or cannot be opened
    fn reader_for_entry(&self, filename: &str)
        -> anyhow::Result<Box<dyn std::io::BufRead + Send>>;

    /// a reader over the file capped at its *current* size, plus that
    /// size. Used for the current base file, which another process keeps
    /// appending to: everything past the cap belongs to the watcher.
    ///
    /// # Errors
    ///
    /// * the file disappeared or cannot be opened
    fn capped_reader_for_entry(
        &self,
        filename: &str,
    ) -> anyhow::Result<(Box<dyn std::io::BufRead + Send>, u64)>;

    /// a watcher emitting lines written strictly after `offset`.
    ///
    /// # Errors
    ///
    /// * the file cannot be watched
    fn watcher_for_entry(&self, filename: &str, offset: u64)
        -> anyhow::Result<Box<dyn FileWatcher>>;
}

/// The production [`DirectoryContent`], reading a real directory.
pub struct FsDirectoryContent {
    directory: std::path::PathBuf,
}

impl FsDirectoryContent {
    /// Serve the given directory.
    #[must_use]
    pub const fn new(directory: std::path::PathBuf) -> Self {
        Self { directory }
    }

    fn path_of(&self, filename: &str) -> std::path::PathBuf {
        self.directory.join(filename)
    }
}

fn decoded_reader(
    filename: &str,
    file: std::fs::File,
) -> Box<dyn std::io::BufRead + Send> {
    let reader: Box<dyn Read + Send> = if filename.ends_with(".gz") {
        Box::new(flate2::read::GzDecoder::new(file))
    } else if filename.ends_with(".bz2") {
        Box::new(bzip2::read::BzDecoder::new(file))
    } else {
        Box::new(file)
    };

    Box::new(std::io::BufReader::new(reader))
}

impl DirectoryContent for FsDirectoryContent {
    fn dir_name(&self) -> String {
        self.directory.display().to_string()
    }

    fn file_entries(&self) -> anyhow::Result<Vec<FileEntry>> {
        let mut entries = Vec::new();

        for dir_entry in std::fs::read_dir(&self.directory)
            .context(format!("listing {}", self.directory.display()))?
        {
            let dir_entry = dir_entry.context("reading a directory entry")?;

            if !dir_entry.file_type().context("stat entry")?.is_file() {
                continue;
            }

            let modified = dir_entry
                .metadata()
                .and_then(|m| m.modified())
                .context("reading a modification time")?;

            entries.push(FileEntry {
                filename: dir_entry.file_name().to_string_lossy().into_owned(),
                modification_time: time::OffsetDateTime::from(modified),
            });
        }

        Ok(entries)
    }

    fn modification_time_for_entry(&self, filename: &str) -> anyhow::Result<time::OffsetDateTime> {
        let modified = std::fs::metadata(self.path_of(filename))
            .and_then(|m| m.modified())
            .context(format!("stat '{filename}'"))?;

        Ok(time::OffsetDateTime::from(modified))
    }

    fn reader_for_entry(
        &self,
        filename: &str,
    ) -> anyhow::Result<Box<dyn std::io::BufRead + Send>> {
        let file = std::fs::File::open(self.path_of(filename))
            .context(format!("opening '{filename}'"))?;

        Ok(decoded_reader(filename, file))
    }

    fn capped_reader_for_entry(
        &self,
        filename: &str,
    ) -> anyhow::Result<(Box<dyn std::io::BufRead + Send>, u64)> {
        let file = std::fs::File::open(self.path_of(filename))
            .context(format!("opening '{filename}'"))?;

        let size = file.metadata().context("stat for size")?.len();

        Ok((
            Box::new(std::io::BufReader::new(file.take(size))),
            size,
        ))
    }

    fn watcher_for_entry(
        &self,
        filename: &str,
        offset: u64,
    ) -> anyhow::Result<Box<dyn FileWatcher>> {
        Ok(Box::new(FsFileWatcher {
            path: self.path_of(filename),
            offset,
        }))
    }
}

/// How often the tail watcher checks the file for growth.
const POLL_PERIOD: std::time::Duration = std::time::Duration::from_millis(500);

struct FsFileWatcher {
    path: std::path::PathBuf,
    offset: u64,
}

impl FsFileWatcher {
    fn read_from_offset(&self, length: u64) -> std::io::Result<Vec<u8>> {
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(std::io::SeekFrom::Start(self.offset))?;

        let mut buffer = Vec::with_capacity(usize::try_from(length - self.offset).unwrap_or(0));
        file.take(length - self.offset).read_to_end(&mut buffer)?;

        Ok(buffer)
    }
}

#[async_trait::async_trait]
impl FileWatcher for FsFileWatcher {
    async fn run(
        mut self: Box<Self>,
        cancellation: Cancellation,
        lines: tokio::sync::mpsc::Sender<String>,
    ) {
        let mut remainder: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                () = tokio::time::sleep(POLL_PERIOD) => {}
                () = cancellation.cancelled() => return,
            }

            let Ok(metadata) = std::fs::metadata(&self.path) else {
                // transiently absent during a rotation
                continue;
            };

            let length = metadata.len();

            if length < self.offset {
                // the file was rotated under us: start from scratch
                tracing::info!(path = %self.path.display(), "watched file shrank, following the new one");
                self.offset = 0;
                remainder.clear();
            }

            if length == self.offset {
                continue;
            }

            let chunk = match self.read_from_offset(length) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "cannot read the watched file");
                    continue;
                }
            };

            self.offset = length;
            remainder.extend_from_slice(&chunk);

            while let Some(position) = remainder.iter().position(|&b| b == b'\n') {
                let mut line_bytes: Vec<u8> = remainder.drain(..=position).collect();
                line_bytes.pop(); // the newline itself

                if line_bytes.last() == Some(&b'\r') {
                    line_bytes.pop();
                }

                let line = String::from_utf8_lossy(&line_bytes).into_owned();

                if lines.send(line).await.is_err() {
                    return;
                }
            }
        }
    }
}
