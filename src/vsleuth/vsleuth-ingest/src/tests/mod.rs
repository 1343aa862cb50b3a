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
use crate::content::{DirectoryContent, FileWatcher};
use crate::planner::FileEntry;
use vsleuth_common::runner::Cancellation;
use vsleuth_common::{Publisher, Record};

mod regression;

pub(crate) struct FakeFileData {
    initial: String,
    appended: String,
}

/// A rotated file: its content is fixed.
pub(crate) fn plain_data_file(content: &str) -> FakeFileData {
    FakeFileData {
        initial: content.to_string(),
        appended: String::new(),
    }
}

/// A compressed rotated file. The fake serves it decoded, the way the
/// production reader does.
pub(crate) fn gzipped_data_file(content: &str) -> FakeFileData {
    plain_data_file(content)
}

/// The current base file: `initial` is there when the import starts,
/// `appended` shows up while the watcher is running.
pub(crate) fn plain_current_data_file(initial: &str, appended: &str) -> FakeFileData {
    FakeFileData {
        initial: initial.to_string(),
        appended: appended.to_string(),
    }
}

pub(crate) struct FakeDirectoryContent {
    pub entries: Vec<FileEntry>,
    pub contents: std::collections::HashMap<String, FakeFileData>,
}

impl FakeDirectoryContent {
    fn data(&self, filename: &str) -> anyhow::Result<&FakeFileData> {
        self.contents
            .get(filename)
            .ok_or_else(|| anyhow::anyhow!("file '{filename}' disappeared"))
    }
}

struct FakeWatcher {
    lines: Vec<String>,
}

#[async_trait::async_trait]
impl FileWatcher for FakeWatcher {
    async fn run(
        self: Box<Self>,
        _cancellation: Cancellation,
        lines: tokio::sync::mpsc::Sender<String>,
    ) {
        for line in self.lines {
            if lines.send(line).await.is_err() {
                return;
            }
        }
        // the scripted content is exhausted: the watcher ends, letting
        // the importer run to completion in tests
    }
}

impl DirectoryContent for FakeDirectoryContent {
    fn dir_name(&self) -> String {
        "/fake/log/dir".to_string()
    }

    fn file_entries(&self) -> anyhow::Result<Vec<FileEntry>> {
        Ok(self.entries.clone())
    }

    fn modification_time_for_entry(&self, filename: &str) -> anyhow::Result<time::OffsetDateTime> {
        self.entries
            .iter()
            .find(|e| e.filename == filename)
            .map(|e| e.modification_time)
            .ok_or_else(|| anyhow::anyhow!("file '{filename}' disappeared"))
    }

    fn reader_for_entry(
        &self,
        filename: &str,
    ) -> anyhow::Result<Box<dyn std::io::BufRead + Send>> {
        let data = self.data(filename)?;

        Ok(Box::new(std::io::Cursor::new(data.initial.clone())))
    }

    fn capped_reader_for_entry(
        &self,
        filename: &str,
    ) -> anyhow::Result<(Box<dyn std::io::BufRead + Send>, u64)> {
        let data = self.data(filename)?;

        Ok((
            Box::new(std::io::Cursor::new(data.initial.clone())),
            data.initial.len() as u64,
        ))
    }

    fn watcher_for_entry(
        &self,
        filename: &str,
        offset: u64,
    ) -> anyhow::Result<Box<dyn FileWatcher>> {
        let data = self.data(filename)?;

        assert_eq!(
            offset,
            data.initial.len() as u64,
            "the watcher must start exactly where the import stopped"
        );

        let lines = data
            .appended
            .lines()
            .map(str::to_string)
            .collect::<Vec<_>>();

        Ok(Box::new(FakeWatcher { lines }))
    }
}

/// Collects everything published, for assertions.
#[derive(Clone, Default)]
pub(crate) struct FakePublisher(pub std::sync::Arc<std::sync::Mutex<Vec<Record>>>);

impl Publisher for FakePublisher {
    fn publish(&mut self, record: Record) {
        self.0.lock().unwrap().push(record);
    }
}

impl FakePublisher {
    pub(crate) fn records(&self) -> Vec<Record> {
        self.0.lock().unwrap().clone()
    }
}
