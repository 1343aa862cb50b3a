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
use anyhow::Context;

/// A closed interval of absolute time, used for search boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    /// first instant included.
    pub from: time::OffsetDateTime,
    /// last instant included.
    pub to: time::OffsetDateTime,
}

impl TimeInterval {
    /// Build from two `YYYY-MM-DD` dates, both days included entirely.
    ///
    /// # Errors
    ///
    /// * a bound is not a valid `YYYY-MM-DD` date
    /// * the interval is inverted
    pub fn from_dates(from: &str, to: &str) -> anyhow::Result<Self> {
        let format = time::macros::format_description!("[year]-[month]-[day]");

        let from = time::Date::parse(from.trim(), &format)
            .context(format!("cannot parse interval start '{from}'"))?
            .midnight()
            .assume_utc();

        let to = time::Date::parse(to.trim(), &format)
            .context(format!("cannot parse interval end '{to}'"))?
            .with_hms(23, 59, 59)
            .expect("23:59:59 is always a valid time")
            .assume_utc();

        anyhow::ensure!(from <= to, "inverted time interval");

        Ok(Self { from, to })
    }
}
