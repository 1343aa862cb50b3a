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

/// Stable content hash over the raw bytes of one log line.
///
/// Distinguishes lines sharing the same wall-clock second on restarts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct Checksum(pub u64);

impl Checksum {
    /// The value as stored in SQLite (which has no unsigned 64-bit type).
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// Reverse of [`Checksum::as_i64`].
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }
}

/// Hash one raw log line.
#[must_use]
pub fn compute_checksum(line: &str) -> Checksum {
    Checksum(xxhash_rust::xxh3::xxh3_64(line.as_bytes()))
}

/// The ingest high-water mark: "everything up to and including this line
/// has already been consumed".
///
/// `time` alone gives coarse, per-second dedup; adding the checksum makes
/// it exact within the equal-second band. `sum == None` happens when
/// bootstrapping from a workspace that predates raw-line checksums: the
/// whole equal-second band is then skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SumPair {
    /// time of the last ingested line; `None` on a fresh workspace.
    pub time: Option<time::OffsetDateTime>,
    /// checksum of the last ingested line, when known.
    pub sum: Option<Checksum>,
}

impl SumPair {
    /// A fresh-workspace marker: nothing ingested yet.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            time: None,
            sum: None,
        }
    }
}
