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
use vsleuth_parser::{Relay, SmtpStatus};

/// Whether a message left this node or arrived at it.
///
/// Discriminants are persisted; do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum MessageDirection {
    /// handed to a remote hop or a command.
    Outbound = 0,
    /// delivered into a local mailbox.
    Incoming = 1,
}

impl MessageDirection {
    /// Integer code used in SQL.
    #[must_use]
    pub const fn code(self) -> i64 {
        self as i64
    }

    /// Reverse of [`MessageDirection::code`].
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Outbound,
            1 => Self::Incoming,
            _ => return None,
        })
    }
}

/// A pointer from a normalised delivery row back to the raw log line it
/// was derived from, resolvable through the raw-logs store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRef {
    /// absolute time of the line.
    pub time: time::OffsetDateTime,
    /// content checksum of the line.
    pub sum: Checksum,
}

/// One completed delivery attempt, as assembled by the tracker and
/// consumed by the delivery-store writer. Append-only downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedDelivery {
    /// Postfix queue id the attempt belongs to.
    pub queue: String,
    /// when the attempt concluded.
    pub delivery_ts: time::OffsetDateTime,
    /// outcome as logged (outbound view).
    pub status: SmtpStatus,
    /// delivery status notification code.
    pub dsn: String,
    /// outbound or incoming.
    pub direction: MessageDirection,
    /// envelope sender, split.
    pub sender_local: String,
    /// envelope sender domain.
    pub sender_domain: String,
    /// envelope recipient, split.
    pub recipient_local: String,
    /// envelope recipient domain.
    pub recipient_domain: String,
    /// RFC 5322 message-id; empty when the queue never got one.
    pub message_id: String,
    /// next hop, when one was involved.
    pub relay: Option<Relay>,
    /// raw-log lines this row was derived from.
    pub log_refs: Vec<LogRef>,
    /// when the queue expired, if it did.
    pub expired_ts: Option<time::OffsetDateTime>,
    /// parent queue, for non-delivery reports.
    pub parent_queue: Option<String>,
    /// `In-Reply-To` header value of the message, when captured.
    pub in_reply_to: Option<String>,
    /// `References` header values of the message, when captured.
    pub references: Vec<String>,
}
