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
use crate::announcer::{ImportAnnouncer, Notifier};
use crate::content::DirectoryContent;
use crate::guess::guess_initial_date_for_file;
use crate::planner::{build_files_to_import, FileEntry, FileQueues, LogPatterns};
use crate::IngestError;
use anyhow::Context;
use vsleuth_common::runner::Cancellation;
use vsleuth_common::{compute_checksum, Publisher, Record, RecordLocation, SumPair};
use vsleuth_parser::timeutil::{datetime_with_year, Clock, TimeConverter};
use vsleuth_parser::{parse_header, parse_payload, Header};

/// While the archived logs are still being imported, how many freshly
/// watched lines we keep sorted in memory, and the per-family watcher
/// buffer size.
const MAX_CACHED_RECORDS_IN_HEAP: usize = 2048;

/// How often the live sorter flushes its heap to the publisher.
const FLUSH_PERIOD: std::time::Duration = std::time::Duration::from_secs(2);

/// Replays a whole log directory in chronological order across families,
/// then (optionally) keeps following the current files.
pub struct DirectoryImporter<C: DirectoryContent> {
    content: std::sync::Arc<C>,
    sum: SumPair,
    patterns: LogPatterns,
    clock: std::sync::Arc<dyn Clock>,
    announcer: std::sync::Arc<dyn ImportAnnouncer>,
}

#[derive(Clone)]
struct PendingRecord {
    time: time::OffsetDateTime,
    header: Header,
    payload_offset: usize,
    line: String,
    location: RecordLocation,
}

struct SortableRecord {
    time: time::OffsetDateTime,
    queue_index: usize,
    sequence: u64,
    header: Header,
    payload_offset: usize,
    line: String,
    location: RecordLocation,
}

impl SortableRecord {
    const fn key(&self) -> (time::OffsetDateTime, usize, u64) {
        (self.time, self.queue_index, self.sequence)
    }
}

impl PartialEq for SortableRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for SortableRecord {}

impl PartialOrd for SortableRecord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortableRecord {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Keeps stale lines from being re-published: anything at or before the
/// last published `(time, checksum)` is dropped, silently when it is an
/// exact duplicate.
struct IgnoringPublisher<'a> {
    inner: &'a mut (dyn Publisher + Send),
    last: SumPair,
}

impl IgnoringPublisher<'_> {
    fn publish(&mut self, record: Record) {
        let should_ignore = self.last.time.is_some_and(|last_time| {
            record.time < last_time
                || (record.time == last_time && self.last.sum == Some(record.sum))
        });

        if !should_ignore {
            self.last = SumPair {
                time: Some(record.time),
                sum: Some(record.sum),
            };

            self.inner.publish(record);
            return;
        }

        if self.last.sum == Some(record.sum) {
            // the same line produced twice within a second, or by two
            // families at once. Nothing to say about it.
            return;
        }

        tracing::warn!(
            time = %record.time,
            location = %record.location,
            "discarding old log line that should be more recent than the last published one"
        );
    }
}

struct QueueProcessor {
    family_index: usize,
    entries: Vec<FileEntry>,
    scanners: Vec<Box<dyn std::io::BufRead + Send>>,
    current_index: usize,
    line_number: u64,
    filename: String,
    converter: Option<TimeConverter>,
    converter_tx: Option<tokio::sync::oneshot::Sender<TimeConverter>>,
    record: Option<PendingRecord>,
}

fn year_change_logger(filename: String) -> vsleuth_parser::timeutil::OnYearChange {
    Box::new(move |year, from, to| {
        tracing::info!(year, %from, %to, file = %filename, "changed year on log file");
    })
}

impl QueueProcessor {
    fn build<C: DirectoryContent>(
        content: &C,
        pattern: &str,
        family_index: usize,
        entries: Vec<FileEntry>,
        offset_tx: Option<tokio::sync::oneshot::Sender<u64>>,
        converter_tx: Option<tokio::sync::oneshot::Sender<TimeConverter>>,
    ) -> anyhow::Result<Self> {
        let mut scanners = Vec::with_capacity(entries.len());
        let mut offset_tx = offset_tx;

        for entry in &entries {
            if entry.filename == pattern {
                // the current log file is being appended to by another
                // process: read it only up to its present size and tell
                // the watcher where to pick up from
                let (reader, offset) = content.capped_reader_for_entry(&entry.filename)?;

                if let Some(tx) = offset_tx.take() {
                    let _ = tx.send(offset);
                }

                scanners.push(reader);
            } else {
                scanners.push(content.reader_for_entry(&entry.filename)?);
            }
        }

        Ok(Self {
            family_index,
            entries,
            scanners,
            current_index: 0,
            line_number: 0,
            filename: String::new(),
            converter: None,
            converter_tx,
            record: None,
        })
    }

    fn set_file_location_if_needed(&mut self) {
        if self.current_index >= self.entries.len() || self.line_number > 0 {
            return;
        }

        self.filename = self.entries[self.current_index].filename.clone();
        tracing::info!(file = %self.filename, "starting importing log file");
    }

    fn create_converter<C: DirectoryContent>(
        &self,
        content: &C,
        clock: &std::sync::Arc<dyn Clock>,
        header: &Header,
    ) -> anyhow::Result<TimeConverter> {
        let entry = &self.entries[self.current_index];

        let modification_time = content.modification_time_for_entry(&entry.filename)?;
        let reader = content.reader_for_entry(&entry.filename)?;

        let initial_time = guess_initial_date_for_file(reader, modification_time)?;

        Ok(TimeConverter::new(
            datetime_with_year(header.time, initial_time.year()),
            clock.clone(),
            year_change_logger(entry.filename.clone()),
        ))
    }

    /// Make sure a current record is available, moving through files as
    /// they run out. `false` means the family is exhausted.
    fn advance<C: DirectoryContent>(
        &mut self,
        content: &C,
        clock: &std::sync::Arc<dyn Clock>,
        notifier: &Notifier,
    ) -> anyhow::Result<bool> {
        self.set_file_location_if_needed();

        loop {
            if self.current_index >= self.scanners.len() {
                return Ok(false);
            }

            let mut line = String::new();
            let read = self.scanners[self.current_index]
                .read_line(&mut line)
                .context(format!("reading from '{}'", self.filename))?;

            if read == 0 {
                // file ended, use the next one
                tracing::info!(file = %self.filename, "finished importing log file");
                notifier.step(self.record.as_ref().map(|r| r.time));

                self.current_index += 1;
                self.line_number = 0;
                self.set_file_location_if_needed();
                continue;
            }

            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }

            self.line_number += 1;

            let location = RecordLocation {
                filename: self.filename.clone(),
                line: self.line_number,
            };

            let Ok((header, payload_offset)) = parse_header(&line) else {
                tracing::warn!(%location, "could not parse log line");
                continue;
            };

            if self.converter.is_none() {
                self.converter = Some(self.create_converter(content, clock, &header)?);
            }

            let time = self
                .converter
                .as_mut()
                .expect("created right above")
                .convert(header.time);

            self.record = Some(PendingRecord {
                time,
                header,
                payload_offset,
                line,
                location,
            });

            return Ok(true);
        }
    }

    /// Hand the time converter over to the live watcher of this family.
    ///
    /// When no line was ever parsed, one is synthesised from the most
    /// recent file's modification time, so the watcher can still promote
    /// whatever arrives later (an initially empty log file).
    fn hand_over_converter(mut self, clock: &std::sync::Arc<dyn Clock>) {
        let Some(tx) = self.converter_tx.take() else {
            return;
        };

        let converter = self.converter.take().or_else(|| {
            self.entries.last().map(|entry| {
                TimeConverter::new(
                    entry.modification_time,
                    clock.clone(),
                    year_change_logger(entry.filename.clone()),
                )
            })
        });

        if let Some(converter) = converter {
            let _ = tx.send(converter);
        }
    }
}

struct FamilyWiring {
    offset_tx: Option<tokio::sync::oneshot::Sender<u64>>,
    converter_tx: Option<tokio::sync::oneshot::Sender<TimeConverter>>,
}

impl<C: DirectoryContent> DirectoryImporter<C> {
    /// A new importer over `content`, resuming after `sum`.
    #[must_use]
    pub fn new(
        content: std::sync::Arc<C>,
        sum: SumPair,
        patterns: LogPatterns,
        clock: std::sync::Arc<dyn Clock>,
        announcer: std::sync::Arc<dyn ImportAnnouncer>,
    ) -> Self {
        Self {
            content,
            sum,
            patterns,
            clock,
            announcer,
        }
    }

    /// Replay the directory, then keep following the current files until
    /// cancelled.
    ///
    /// # Errors
    ///
    /// * [`IngestError::LogFilesNotFound`] when nothing matches
    /// * a file disappears mid-import, or any I/O failure
    pub async fn run(
        &self,
        publisher: &mut (dyn Publisher + Send),
        cancellation: Cancellation,
    ) -> anyhow::Result<()> {
        self.run_inner(publisher, cancellation, true).await
    }

    /// Replay the directory and stop.
    ///
    /// # Errors
    ///
    /// See [`DirectoryImporter::run`].
    pub async fn import_only(
        &self,
        publisher: &mut (dyn Publisher + Send),
        cancellation: Cancellation,
    ) -> anyhow::Result<()> {
        self.run_inner(publisher, cancellation, false).await
    }

    fn build_queues(&self) -> anyhow::Result<FileQueues> {
        let entries = self
            .content
            .file_entries()
            .context("listing the log directory")?;

        let queues = if entries.is_empty() {
            FileQueues::new()
        } else {
            build_files_to_import(&entries, &self.patterns, self.sum.time)
        };

        if queues.values().all(Vec::is_empty) {
            return Err(IngestError::LogFilesNotFound).context(format!(
                "no log files more recent than {:?} in directory {}",
                self.sum.time,
                self.content.dir_name()
            ));
        }

        Ok(queues)
    }

    async fn run_inner(
        &self,
        publisher: &mut (dyn Publisher + Send),
        cancellation: Cancellation,
        follow: bool,
    ) -> anyhow::Result<()> {
        tracing::debug!(directory = %self.content.dir_name(), "reading logs from directory");

        let queues = self.build_queues()?;

        let mut ignoring = IgnoringPublisher {
            inner: publisher,
            last: self.sum,
        };

        let (mut wirings, mut sorted_rx) = if follow {
            let (wirings, sorted_rx) = self.start_file_watchers(&queues, &cancellation)?;
            (wirings, Some(sorted_rx))
        } else {
            (std::collections::HashMap::new(), None)
        };

        self.import_existing_logs(&queues, &mut wirings, &mut ignoring)
            .await?;

        if !follow {
            return Ok(());
        }

        // from here on, the watchers own the time converters: publish
        // their heap-sorted output until cancellation closes them
        if let Some(sorted_rx) = sorted_rx.as_mut() {
            while let Some(sortable) = sorted_rx.recv().await {
                let payload =
                    match parse_payload(&sortable.header, &sortable.line[sortable.payload_offset..])
                    {
                        Ok(payload) => Some(payload),
                        Err(e) => {
                            tracing::debug!(location = %sortable.location, error = %e, "unsupported live payload");
                            None
                        }
                    };

                let sum = compute_checksum(&sortable.line);

                ignoring.publish(Record {
                    time: sortable.time,
                    header: sortable.header,
                    payload,
                    line: sortable.line,
                    location: sortable.location,
                    sum,
                });
            }
        }

        Ok(())
    }

    /// Start one watcher and one timestamper per family, plus the shared
    /// heap sorter. Returns the wiring the importer must feed (offsets
    /// and, at end of history, time converters) and the sorted output.
    fn start_file_watchers(
        &self,
        queues: &FileQueues,
        cancellation: &Cancellation,
    ) -> anyhow::Result<(
        std::collections::HashMap<String, FamilyWiring>,
        tokio::sync::mpsc::Receiver<SortableRecord>,
    )> {
        let (sortable_tx, sortable_rx) =
            tokio::sync::mpsc::channel::<SortableRecord>(MAX_CACHED_RECORDS_IN_HEAP);
        let (sorted_tx, sorted_rx) =
            tokio::sync::mpsc::channel::<SortableRecord>(MAX_CACHED_RECORDS_IN_HEAP);

        let mut wirings = std::collections::HashMap::new();

        for (pattern, queue) in queues {
            if queue.is_empty() {
                continue;
            }

            let current = queue.last().expect("non-empty queue");

            anyhow::ensure!(
                current.filename == *pattern,
                "missing current log file '{pattern}', found '{}' instead",
                current.filename
            );

            let (offset_tx, offset_rx) = tokio::sync::oneshot::channel::<u64>();
            let (converter_tx, converter_rx) = tokio::sync::oneshot::channel::<TimeConverter>();
            let (line_tx, mut line_rx) =
                tokio::sync::mpsc::channel::<String>(MAX_CACHED_RECORDS_IN_HEAP);

            wirings.insert(
                pattern.clone(),
                FamilyWiring {
                    offset_tx: Some(offset_tx),
                    converter_tx: Some(converter_tx),
                },
            );

            // the watcher: waits for the import to record the file size,
            // then emits everything written after it
            let content = self.content.clone();
            let filename = current.filename.clone();
            let watcher_cancellation = cancellation.clone();

            tokio::spawn(async move {
                let Ok(offset) = offset_rx.await else {
                    return;
                };

                match content.watcher_for_entry(&filename, offset) {
                    Ok(watcher) => watcher.run(watcher_cancellation, line_tx).await,
                    Err(e) => {
                        tracing::error!(file = %filename, error = %e, "cannot watch the current log file");
                    }
                }
            });

            // the timestamper: takes converter ownership at end of
            // history and promotes watched lines from there on
            let queue_index = self.patterns.index_of(pattern);
            let family_sortable_tx = sortable_tx.clone();
            let pattern_for_location = pattern.clone();

            tokio::spawn(async move {
                let Ok(mut converter) = converter_rx.await else {
                    return;
                };

                let mut sequence = 0_u64;
                let mut line_number = 0_u64;

                while let Some(line) = line_rx.recv().await {
                    line_number += 1;

                    let Ok((header, payload_offset)) = parse_header(&line) else {
                        tracing::warn!(file = %pattern_for_location, "could not parse watched log line");
                        continue;
                    };

                    let time = converter.convert(header.time);

                    let sortable = SortableRecord {
                        time,
                        queue_index,
                        sequence,
                        header,
                        payload_offset,
                        line,
                        location: RecordLocation {
                            filename: pattern_for_location.clone(),
                            line: line_number,
                        },
                    };

                    sequence += 1;

                    if family_sortable_tx.send(sortable).await.is_err() {
                        return;
                    }
                }
            });
        }

        // the sorter: a bounded min-heap flushed every two seconds, so a
        // fast family cannot overtake a slower one by more than the
        // flush window
        tokio::spawn(async move {
            let mut heap: std::collections::BinaryHeap<std::cmp::Reverse<SortableRecord>> =
                std::collections::BinaryHeap::with_capacity(MAX_CACHED_RECORDS_IN_HEAP);
            let mut sortable_rx = sortable_rx;
            let mut ticker = tokio::time::interval(FLUSH_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            fn drain(
                heap: &mut std::collections::BinaryHeap<std::cmp::Reverse<SortableRecord>>,
            ) -> Vec<SortableRecord> {
                let mut drained = Vec::with_capacity(heap.len());
                while let Some(std::cmp::Reverse(record)) = heap.pop() {
                    drained.push(record);
                }
                drained
            }

            loop {
                tokio::select! {
                    maybe = sortable_rx.recv() => match maybe {
                        Some(record) => {
                            heap.push(std::cmp::Reverse(record));

                            if heap.len() >= MAX_CACHED_RECORDS_IN_HEAP {
                                for record in drain(&mut heap) {
                                    if sorted_tx.send(record).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        for record in drain(&mut heap) {
                            if sorted_tx.send(record).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            for record in drain(&mut heap) {
                if sorted_tx.send(record).await.is_err() {
                    return;
                }
            }
        });

        Ok((wirings, sorted_rx))
    }

    /// Phase A: open every planned file and replay all families in one
    /// globally time-ordered stream, skipping everything at or before
    /// the high-water mark.
    async fn import_existing_logs(
        &self,
        queues: &FileQueues,
        wirings: &mut std::collections::HashMap<String, FamilyWiring>,
        ignoring: &mut IgnoringPublisher<'_>,
    ) -> anyhow::Result<()> {
        let import_started = std::time::Instant::now();

        let mut processors = Vec::new();

        let mut families: Vec<(&String, &Vec<FileEntry>)> = queues.iter().collect();
        families.sort_by_key(|(pattern, _)| self.patterns.index_of(pattern));

        for (pattern, entries) in families {
            if entries.is_empty() {
                continue;
            }

            let wiring = wirings.get_mut(pattern);
            let (offset_tx, converter_tx) = wiring
                .map_or((None, None), |w| (w.offset_tx.take(), w.converter_tx.take()));

            processors.push(QueueProcessor::build(
                self.content.as_ref(),
                pattern,
                self.patterns.index_of(pattern),
                entries.clone(),
                offset_tx,
                converter_tx,
            )?);
        }

        let mut notifier = Notifier::new(self.announcer.clone());
        let mut current_log_time: Option<time::OffsetDateTime> = None;
        let mut last_consumed: Option<usize> = None;
        let mut checksum_has_already_matched = false;

        loop {
            match last_consumed {
                None => {
                    // first iteration: every processor needs a record
                    let mut kept = Vec::with_capacity(processors.len());

                    for mut processor in processors {
                        if processor.advance(self.content.as_ref(), &self.clock, &notifier)? {
                            kept.push(processor);
                        } else {
                            processor.hand_over_converter(&self.clock);
                        }
                    }

                    processors = kept;
                }
                Some(index) => {
                    if !processors[index].advance(self.content.as_ref(), &self.clock, &notifier)? {
                        let processor = processors.remove(index);
                        processor.hand_over_converter(&self.clock);
                    }
                }
            }

            if processors.is_empty() {
                notifier.end(current_log_time);

                tracing::info!(
                    elapsed = ?import_started.elapsed(),
                    "finished importing the log directory"
                );

                return Ok(());
            }

            let chosen = processors
                .iter()
                .enumerate()
                .min_by_key(|(index, p)| {
                    (
                        p.record.as_ref().expect("advanced above").time,
                        p.family_index,
                        *index,
                    )
                })
                .map(|(index, _)| index)
                .expect("processors is not empty");

            last_consumed = Some(chosen);

            let record = processors[chosen]
                .record
                .clone()
                .expect("the chosen processor was advanced");

            // ignore anything at or before the high-water
            if let Some(high_water) = self.sum.time {
                if record.time < high_water {
                    continue;
                }

                if record.time == high_water {
                    let Some(high_water_sum) = self.sum.sum else {
                        // a workspace from before raw-line checksums: the
                        // whole equal-second band is skipped
                        continue;
                    };

                    if !checksum_has_already_matched {
                        if compute_checksum(&record.line) == high_water_sum {
                            checksum_has_already_matched = true;
                        }

                        // same second, but at or before the matching line
                        continue;
                    }
                }
            }

            notifier.start_if_needed(Some(record.time));
            current_log_time = Some(record.time);

            let payload = match parse_payload(&record.header, &record.line[record.payload_offset..])
            {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::debug!(location = %record.location, error = %e, "unsupported payload");
                    None
                }
            };

            let sum = compute_checksum(&record.line);

            ignoring.publish(Record {
                time: record.time,
                header: record.header,
                payload,
                line: record.line,
                location: record.location,
                sum,
            });
        }
    }
}
