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
use crate::planner::{build_files_to_import, LogPatterns};
use crate::{DirectoryContent, IngestError};
use anyhow::Context;
use std::io::BufRead;
use vsleuth_parser::timeutil::{datetime_with_year, second_in_the_year, second_in_the_year_of};
use vsleuth_parser::{parse_header, ParsedTime};

fn first_and_last_header_times(
    reader: Box<dyn std::io::BufRead + Send>,
) -> anyhow::Result<(Option<ParsedTime>, Option<ParsedTime>)> {
    let mut first = None;
    let mut last = None;

    for line in reader.lines() {
        let line = line.context("reading a log file while guessing its date")?;

        let Ok((header, _)) = parse_header(&line) else {
            continue;
        };

        if first.is_none() {
            first = Some(header.time);
        } else {
            last = Some(header.time);
        }
    }

    Ok((first, last))
}

/// Guess the absolute time of the first line of a log file, from the
/// file's modification time and its first and last header timestamps.
///
/// The modification time is normalised to UTC: rotated files mounted
/// across containers carry no timezone metadata, so the original time
/// may really be anywhere within ±12 h. The classification below is
/// correct for any offset in that window.
///
/// # Errors
///
/// * reading the file fails
pub fn guess_initial_date_for_file(
    reader: Box<dyn std::io::BufRead + Send>,
    original_modification_time: time::OffsetDateTime,
) -> anyhow::Result<time::OffsetDateTime> {
    let modification_time = original_modification_time.to_offset(time::UtcOffset::UTC);

    let (first, last) = first_and_last_header_times(reader)?;

    let Some(first) = first else {
        // empty file
        return Ok(modification_time);
    };

    let seconds_first = second_in_the_year(first);
    let seconds_modification = second_in_the_year_of(modification_time);

    let modification_plus_12h = modification_time + time::Duration::hours(12);
    let seconds_modification_plus_12h = second_in_the_year_of(modification_plus_12h);

    let adjust_after_12h_jump = modification_plus_12h.year() - modification_time.year();

    if adjust_after_12h_jump != 0 {
        tracing::warn!(
            target: "vsleuth::ingest::tz_window",
            file_mtime = %modification_time,
            "the \u{b1}12h timezone window crosses a year boundary, the guess may be off by one year"
        );
    }

    let Some(last) = last else {
        // one line file
        let year_offset = i32::from(seconds_modification < seconds_first);
        let year = modification_time.year() - year_offset + adjust_after_12h_jump;

        return Ok(datetime_with_year(first, year));
    };

    let seconds_last = second_in_the_year(last);

    let ordered = |a: i64, b: i64, c: i64| a <= b && b <= c;
    let basic_offset =
        |begin: i64, end: i64, modified: i64| i32::from(!(begin <= end && end <= modified));

    let year_offset = if ordered(seconds_first, seconds_modification, seconds_last)
        || ordered(seconds_modification, seconds_first, seconds_last)
    {
        basic_offset(seconds_first, seconds_last, seconds_modification_plus_12h)
            - adjust_after_12h_jump
    } else {
        basic_offset(seconds_first, seconds_last, seconds_modification)
    };

    let year = modification_time.year() - year_offset;

    Ok(datetime_with_year(first, year))
}

/// The earliest guessed time across the first file of every family: the
/// instant the whole import will start from.
///
/// # Errors
///
/// * [`IngestError::LogFilesNotFound`] when nothing matches
/// * [`IngestError::EmptyFileList`] when no family has files
/// * reading a file fails
pub fn find_initial_log_time(
    content: &dyn DirectoryContent,
    patterns: &LogPatterns,
) -> anyhow::Result<time::OffsetDateTime> {
    let entries = content.file_entries()?;

    if entries.is_empty() {
        return Err(IngestError::LogFilesNotFound)
            .context(format!("in directory {}", content.dir_name()));
    }

    let queues = build_files_to_import(&entries, patterns, None);

    let mut earliest: Option<time::OffsetDateTime> = None;

    for queue in queues.values() {
        let Some(entry) = queue.first() else {
            continue;
        };

        let reader = content.reader_for_entry(&entry.filename)?;
        let guessed = guess_initial_date_for_file(reader, entry.modification_time)?;

        earliest = Some(earliest.map_or(guessed, |t| t.min(guessed)));
    }

    earliest.map_or_else(
        || {
            Err(IngestError::EmptyFileList)
                .context(format!("in directory {}", content.dir_name()))
        },
        Ok,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reader(content: &str) -> Box<dyn std::io::BufRead + Send> {
        Box::new(std::io::Cursor::new(content.to_string()))
    }

    #[test]
    fn multi_line_file_with_an_older_year() {
        let date = guess_initial_date_for_file(
            reader(
                "Feb 28 22:08:56 ubuntu-2gb-nbg1-1 postfix/postmap[1400]: fatal: open /x/: No such file or directory
Feb 28 22:39:44 ubuntu-2gb-nbg1-1 postfix/smtpd[4470]: error: open database /y/: No such file or directory
Feb 28 22:43:31 ubuntu-2gb-nbg1-1 postfix/smtpd[4677]: error: open database /y/: No such file or directory",
            ),
            datetime!(2019-02-28 22:43:31 +01:00),
        )
        .unwrap();

        assert_eq!(date, datetime!(2019-02-28 22:08:56 UTC));
    }

    #[test]
    fn file_spanning_a_rotation_period() {
        let date = guess_initial_date_for_file(
            reader(
                "Dec  6 06:25:06 cloud2 postfix/pickup[22197]: D4D433E8C6: uid=0 from=<root>
Dec  6 06:25:06 cloud2 postfix/cleanup[23434]: D4D433E8C6: message-id=<x@y.com>
Dec 14 06:24:27 cloud2 postfix/anvil[15757]: statistics: max cache size 1 at Dec 14 06:21:07",
            ),
            datetime!(2020-12-14 06:24:27 +01:00),
        )
        .unwrap();

        assert_eq!(date, datetime!(2020-12-06 06:25:06 UTC));
    }

    #[test]
    fn empty_file_falls_back_to_the_modification_time() {
        let date =
            guess_initial_date_for_file(reader(""), datetime!(2021-04-27 08:00:20 UTC)).unwrap();

        assert_eq!(date, datetime!(2021-04-27 08:00:20 UTC));
    }

    #[test]
    fn one_line_file_written_right_after_the_line() {
        let date = guess_initial_date_for_file(
            reader("Apr 27 08:00:21 cloud2 postfix/pickup[15941]: AF96E3E8C6: uid=0 from=<root>"),
            datetime!(2021-04-27 08:00:22 UTC),
        )
        .unwrap();

        assert_eq!(date, datetime!(2021-04-27 08:00:21 UTC));
    }

    #[test]
    fn one_line_file_from_late_december_modified_in_january() {
        let date = guess_initial_date_for_file(
            reader("Dec 31 23:59:58 cloud2 postfix/qmgr[1]: AF96E3E8C6: removed"),
            datetime!(2021-01-01 00:00:05 UTC),
        )
        .unwrap();

        assert_eq!(date, datetime!(2020-12-31 23:59:58 UTC));
    }
}
