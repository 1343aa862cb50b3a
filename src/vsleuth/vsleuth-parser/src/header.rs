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
use crate::ParseError;

/// A syslog timestamp as written by Postfix: `Mon DD HH:MM:SS`, no year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTime {
    /// month of the year.
    pub month: time::Month,
    /// day of the month, `1..=31`.
    pub day: u8,
    /// hour, `0..=23`.
    pub hour: u8,
    /// minute, `0..=59`.
    pub minute: u8,
    /// second, `0..=59`.
    pub second: u8,
}

impl std::fmt::Display for ParsedTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:>2} {:02}:{:02}:{:02}",
            &format!("{}", self.month)[..3],
            self.day,
            self.hour,
            self.minute,
            self.second
        )
    }
}

/// The parsed prefix of a log line, up to (excluding) the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// year-less timestamp.
    pub time: ParsedTime,
    /// hostname the line was logged on.
    pub host: String,
    /// process name, e.g. `postfix`.
    pub process: String,
    /// daemon within the process, e.g. `smtpd` for `postfix/smtpd`.
    pub daemon: Option<String>,
    /// pid of the emitting process, when logged.
    pub pid: Option<u32>,
}

fn month_from_abbreviation(s: &str) -> Option<time::Month> {
    Some(match s {
        "Jan" => time::Month::January,
        "Feb" => time::Month::February,
        "Mar" => time::Month::March,
        "Apr" => time::Month::April,
        "May" => time::Month::May,
        "Jun" => time::Month::June,
        "Jul" => time::Month::July,
        "Aug" => time::Month::August,
        "Sep" => time::Month::September,
        "Oct" => time::Month::October,
        "Nov" => time::Month::November,
        "Dec" => time::Month::December,
        _ => return None,
    })
}

fn two_digits(s: &str, space_padded: bool) -> Option<u8> {
    let bytes = s.as_bytes();
    if bytes.len() != 2 {
        return None;
    }

    let high = match bytes[0] {
        b' ' if space_padded => 0,
        c if c.is_ascii_digit() => c - b'0',
        _ => return None,
    };

    if !bytes[1].is_ascii_digit() {
        return None;
    }

    Some(high * 10 + (bytes[1] - b'0'))
}

fn parse_time(line: &str) -> Option<(ParsedTime, &str)> {
    // fixed width: `Mmm dd hh:mm:ss `
    if line.len() < 16 || !line.is_char_boundary(16) {
        return None;
    }

    let month = month_from_abbreviation(line.get(0..3)?)?;
    let day = two_digits(line.get(4..6)?, true)?;
    let hour = two_digits(line.get(7..9)?, false)?;
    let minute = two_digits(line.get(10..12)?, false)?;
    let second = two_digits(line.get(13..15)?, false)?;

    if line.as_bytes()[3] != b' '
        || line.as_bytes()[6] != b' '
        || line.as_bytes()[9] != b':'
        || line.as_bytes()[12] != b':'
        || line.as_bytes()[15] != b' '
        || !(1..=31).contains(&day)
        || hour > 23
        || minute > 59
        || second > 59
    {
        return None;
    }

    Some((
        ParsedTime {
            month,
            day,
            hour,
            minute,
            second,
        },
        &line[16..],
    ))
}

/// Split a syslog tag such as `postfix/smtpd[4470]` into its parts.
fn parse_tag(tag: &str) -> Option<(String, Option<String>, Option<u32>)> {
    let (name, pid) = match tag.split_once('[') {
        Some((name, rest)) => {
            let pid = rest.strip_suffix(']')?.parse::<u32>().ok()?;
            (name, Some(pid))
        }
        None => (tag, None),
    };

    if name.is_empty() {
        return None;
    }

    match name.split_once('/') {
        Some((process, daemon)) if !process.is_empty() && !daemon.is_empty() => {
            Some((process.to_string(), Some(daemon.to_string()), pid))
        }
        Some(_) => None,
        None => Some((name.to_string(), None, pid)),
    }
}

/// Parse the syslog prefix of one raw log line.
///
/// Returns the header and the byte offset of the payload within `line`.
///
/// # Errors
///
/// [`ParseError::InvalidHeader`] when the line does not carry the
/// `Mon DD HH:MM:SS host tag:` shape. This error is recoverable: the line
/// is skipped by importers.
pub fn parse_header(line: &str) -> Result<(Header, usize), ParseError> {
    let (time, rest) = parse_time(line).ok_or(ParseError::InvalidHeader)?;

    let mut parts = rest.splitn(3, ' ');
    let host = parts.next().filter(|h| !h.is_empty()).ok_or(ParseError::InvalidHeader)?;
    let tag = parts.next().ok_or(ParseError::InvalidHeader)?;
    let tag = tag.strip_suffix(':').ok_or(ParseError::InvalidHeader)?;

    let (process, daemon, pid) = parse_tag(tag).ok_or(ParseError::InvalidHeader)?;

    let consumed = line.len() - rest.len() + host.len() + 1 + tag.len() + 1;
    let payload_offset = if line[consumed..].starts_with(' ') {
        consumed + 1
    } else {
        consumed
    };

    Ok((
        Header {
            time,
            host: host.to_string(),
            process,
            daemon,
            pid,
        },
        payload_offset,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_regular_smtpd_line() {
        let line = "Feb 28 22:39:44 ubuntu-2gb-nbg1-1 postfix/smtpd[4470]: error: open database";
        let (header, offset) = parse_header(line).unwrap();

        assert_eq!(header.time.month, time::Month::February);
        assert_eq!(header.time.day, 28);
        assert_eq!(header.time.hour, 22);
        assert_eq!(header.time.minute, 39);
        assert_eq!(header.time.second, 44);
        assert_eq!(header.host, "ubuntu-2gb-nbg1-1");
        assert_eq!(header.process, "postfix");
        assert_eq!(header.daemon.as_deref(), Some("smtpd"));
        assert_eq!(header.pid, Some(4470));
        assert_eq!(&line[offset..], "error: open database");
    }

    #[test]
    fn parses_space_padded_day() {
        let line = "Jan  3 06:25:07 cloud2 postfix/pickup[25779]: DD78F3E8C1: uid=0 from=<root>";
        let (header, _) = parse_header(line).unwrap();

        assert_eq!(header.time.month, time::Month::January);
        assert_eq!(header.time.day, 3);
    }

    #[test]
    fn parses_tag_without_daemon() {
        let line = "Jun 25 16:40:09 cloud2 postfix-script[31421]: fatal: unknown command";
        let (header, _) = parse_header(line).unwrap();

        assert_eq!(header.process, "postfix-script");
        assert_eq!(header.daemon, None);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_header("nonsense"), Err(ParseError::InvalidHeader));
        assert_eq!(parse_header(""), Err(ParseError::InvalidHeader));
        assert_eq!(
            parse_header("Xyz 28 22:39:44 host postfix/smtpd[1]: hi"),
            Err(ParseError::InvalidHeader)
        );
        assert_eq!(
            parse_header("Feb 28 25:39:44 host postfix/smtpd[1]: hi"),
            Err(ParseError::InvalidHeader)
        );
    }

    #[test]
    fn display_round_trips_the_syslog_shape() {
        let line = "Jan  3 06:25:07 cloud2 postfix/pickup[25779]: x";
        let (header, _) = parse_header(line).unwrap();
        assert_eq!(format!("{}", header.time), "Jan  3 06:25:07");
    }
}
