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

//! The detective: paginated, grouped forensic reports over the delivery
//! store. "Did this message get delivered, when, through which relay?"

#![doc(html_no_source)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod sql;

pub use sql::SqlDetective;

use vsleuth_common::runner::Cancellation;
use vsleuth_common::TimeInterval;
use vsleuth_parser::SmtpStatus;

/// Page size when the caller does not specify one.
pub const RESULTS_PER_PAGE: i64 = 100;

/// The status filter value meaning "any status".
pub const NO_STATUS: i64 = -1;

/// Failure modes of detective queries.
#[derive(Debug, thiserror::Error)]
pub enum DetectiveError {
    /// nothing has been ingested yet. Expected on a fresh install; the
    /// HTTP layer turns it into an empty result, not an error.
    #[error("no available logs")]
    NoAvailableLogs,

    /// anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The forensic query interface, mockable for the HTTP layer's tests.
#[async_trait::async_trait]
pub trait Detective: Send + Sync {
    /// Run the delivery search and shape one page of grouped messages.
    async fn check_message_delivery(
        &self,
        cancellation: &Cancellation,
        mail_from: &str,
        mail_to: &str,
        interval: TimeInterval,
        status: i64,
        some_id: &str,
        page: i64,
        limit: i64,
    ) -> anyhow::Result<MessagesPage>;

    /// The time of the oldest delivery on record.
    async fn oldest_available_time(
        &self,
        cancellation: &Cancellation,
    ) -> Result<time::OffsetDateTime, DetectiveError>;
}

/// One grouped set of delivery attempts sharing `(queue, status, dsn)`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MessageDelivery {
    /// distinct attempt count.
    pub number_of_attempts: i64,
    /// first attempt in the group.
    #[serde(with = "time::serde::rfc3339")]
    pub time_min: time::OffsetDateTime,
    /// last attempt in the group.
    #[serde(with = "time::serde::rfc3339")]
    pub time_max: time::OffsetDateTime,
    /// status after the read-time overlay.
    pub status: SmtpStatus,
    /// delivery status notification code.
    pub dsn: String,
    /// next-hop relays involved, deduplicated.
    pub relays: Vec<String>,
    /// when the queue expired, if it did.
    #[serde(with = "time::serde::rfc3339::option")]
    pub expired: Option<time::OffsetDateTime>,
    /// envelope sender.
    #[serde(rename = "from")]
    pub mail_from: String,
    /// envelope recipients, deduplicated.
    #[serde(rename = "to")]
    pub mail_to: Vec<String>,
    /// the raw log lines this group was derived from.
    #[serde(rename = "log_msgs")]
    pub raw_log_msgs: Vec<String>,
}

/// One message: all delivery groups sharing a queue.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Postfix queue id.
    pub queue: String,
    /// RFC 5322 message-id.
    pub message_id: String,
    /// the per-`(status, dsn)` groups of this queue.
    pub entries: Vec<MessageDelivery>,
}

/// One page of the paginated report.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MessagesPage {
    /// the requested page, 1-based.
    #[serde(rename = "page")]
    pub page_number: i64,
    /// always 1.
    pub first_page: i64,
    /// the last page at this page size.
    pub last_page: i64,
    /// user-visible message count across all pages.
    pub total: i64,
    /// the messages of this page.
    pub messages: Vec<Message>,
}

/// Column order of the CSV export.
pub const CSV_HEADER: [&str; 12] = [
    "MailFrom",
    "MailTo",
    "MessageID",
    "Queue",
    "NumberOfAttempts",
    "TimeMin",
    "TimeMax",
    "Status",
    "DSN",
    "Expired",
    "Relays",
    "RawLogMsgs",
];

fn rfc3339(t: time::OffsetDateTime) -> String {
    t.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| t.to_string())
}

impl MessageDelivery {
    /// One CSV record, in [`CSV_HEADER`] order.
    #[must_use]
    pub fn export_csv(&self, queue: &str, message_id: &str) -> Vec<String> {
        vec![
            self.mail_from.clone(),
            self.mail_to.join("\n"),
            message_id.to_string(),
            queue.to_string(),
            self.number_of_attempts.to_string(),
            rfc3339(self.time_min),
            rfc3339(self.time_max),
            self.status.to_string(),
            self.dsn.clone(),
            self.expired.map(rfc3339).unwrap_or_default(),
            self.relays.join("\n"),
            self.raw_log_msgs.join("\n"),
        ]
    }
}

impl MessagesPage {
    /// Every entry of this page as CSV records.
    #[must_use]
    pub fn export_csv(&self) -> Vec<Vec<String>> {
        self.messages
            .iter()
            .flat_map(|message| {
                message
                    .entries
                    .iter()
                    .map(|entry| entry.export_csv(&message.queue, &message.message_id))
            })
            .collect()
    }
}
