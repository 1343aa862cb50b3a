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
use crate::Checksum;
use vsleuth_parser::{Header, Payload};

/// Where a record came from, for error messages and forensics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RecordLocation {
    /// base name of the log file.
    pub filename: String,
    /// 1-based line number within that file.
    pub line: u64,
}

impl std::fmt::Display for RecordLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.filename, self.line)
    }
}

/// One fully parsed log line with its absolute time and provenance.
///
/// Immutable once built; consumers clone what they keep.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// absolute instant, promoted by the time converter.
    pub time: time::OffsetDateTime,
    /// parsed syslog header.
    pub header: Header,
    /// structured payload; `None` when the payload shape is unsupported
    /// but the line still advances the ingest high-water.
    pub payload: Option<Payload>,
    /// the raw line, unmodified.
    pub line: String,
    /// provenance of the line.
    pub location: RecordLocation,
    /// stable content checksum of [`Record::line`].
    pub sum: Checksum,
}

/// Consumers of the parsed record stream.
pub trait Publisher {
    /// Hand one record over. Ordering follows the importer guarantees.
    fn publish(&mut self, record: Record);
}

/// Fans one record stream out to several publishers.
#[derive(Default)]
pub struct ComposedPublisher(Vec<Box<dyn Publisher + Send>>);

impl ComposedPublisher {
    /// Compose publishers; they receive records in insertion order.
    #[must_use]
    pub fn new(publishers: Vec<Box<dyn Publisher + Send>>) -> Self {
        Self(publishers)
    }

    /// Append one more consumer.
    pub fn push(&mut self, publisher: Box<dyn Publisher + Send>) {
        self.0.push(publisher);
    }
}

impl Publisher for ComposedPublisher {
    fn publish(&mut self, record: Record) {
        if let Some((last, head)) = self.0.split_last_mut() {
            for publisher in head {
                publisher.publish(record.clone());
            }

            last.publish(record);
        }
    }
}
