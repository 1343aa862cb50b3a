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

/// Errors produced while parsing a single log line.
///
/// Every variant is recoverable from the point of view of an import: the
/// line is logged and skipped, the stream goes on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// the line does not start with a valid syslog header.
    #[error("malformed syslog header")]
    InvalidHeader,

    /// the line belongs to a process we do not handle.
    #[error("unsupported log line from process `{process}`")]
    UnsupportedProcess {
        /// name of the emitting process, e.g. `dovecot`.
        process: String,
    },

    /// the payload shape is not one of the known Postfix events.
    #[error("unsupported payload")]
    UnsupportedPayload,
}
