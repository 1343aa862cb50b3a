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

//! vSleuth common definitions: parsed records, ingest checksums, address
//! splitting and the cancellable-runner toolkit.

#![doc(html_no_source)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod email;
mod interval;
mod record;
mod sum;

/// delivery rows exchanged between the tracker and the store.
pub mod delivery;

/// long-running components that stop cooperatively.
pub mod runner;

pub use email::{is_exact_address, split_partial};
pub use interval::TimeInterval;
pub use record::{ComposedPublisher, Publisher, Record, RecordLocation};
pub use sum::{compute_checksum, Checksum, SumPair};
