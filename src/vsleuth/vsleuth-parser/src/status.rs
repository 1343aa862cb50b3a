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

/// Delivery status of a message, as stored and as exposed over the API.
///
/// The discriminants are part of the persisted format and of the HTTP
/// query contract. They must never be reordered.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(i64)]
pub enum SmtpStatus {
    /// accepted by the next hop.
    Sent = 0,
    /// temporarily rejected, Postfix will retry.
    Deferred = 1,
    /// permanently rejected.
    Bounced = 2,
    /// delivered to a local mailbox (computed at read time).
    Received = 3,
    /// an inbound message answering a previously sent one (read time).
    Replied = 4,
    /// the queue outlived its deferral window.
    Expired = 5,
    /// a non-delivery report sent back to the original sender (read time).
    Returned = 6,
}

impl SmtpStatus {
    /// Integer code used in SQL parameters and HTTP queries.
    #[must_use]
    pub const fn code(self) -> i64 {
        self as i64
    }

    /// Reverse of [`SmtpStatus::code`].
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Sent,
            1 => Self::Deferred,
            2 => Self::Bounced,
            3 => Self::Received,
            4 => Self::Replied,
            5 => Self::Expired,
            6 => Self::Returned,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 0..=6 {
            assert_eq!(SmtpStatus::from_code(code).unwrap().code(), code);
        }
        assert_eq!(SmtpStatus::from_code(7), None);
        assert_eq!(SmtpStatus::from_code(-1), None);
    }

    #[test]
    fn human_strings() {
        assert_eq!(SmtpStatus::Sent.to_string(), "sent");
        assert_eq!(SmtpStatus::Returned.to_string(), "returned");
        assert_eq!("deferred".parse::<SmtpStatus>().unwrap(), SmtpStatus::Deferred);
        assert!("nope".parse::<SmtpStatus>().is_err());
    }
}
