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
use crate::ParsedTime;
use time::OffsetDateTime;

/// A backward jump at least this long is read as a year wrap
/// (`Dec 31 -> Jan  1`), not as a locally reordered line.
pub const YEAR_WRAP_THRESHOLD: time::Duration = time::Duration::days(183);

/// How far in the future a converted time may land before we refuse to
/// bump the year and keep the previous one instead.
pub const FUTURE_SAFETY_MARGIN: time::Duration = time::Duration::days(1);

/// Monotone wall-clock abstraction, so year inference can be tested
/// against a frozen "now".
pub trait Clock: Send + Sync {
    /// current instant.
    fn now(&self) -> OffsetDateTime;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A frozen clock for tests.
#[derive(Debug, Clone, Copy)]
pub struct FakeClock(pub OffsetDateTime);

impl Clock for FakeClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

/// Promote a year-less timestamp to UTC with an explicit year.
///
/// Out-of-range days normalise forward, the way syslog consumers expect:
/// `Feb 29` under a mis-guessed non-leap year becomes `Mar  1`.
#[must_use]
pub fn datetime_with_year(t: ParsedTime, year: i32) -> OffsetDateTime {
    let first_of_month = time::Date::from_calendar_date(year, t.month, 1)
        .expect("the first of a month always exists");

    (first_of_month + time::Duration::days(i64::from(t.day) - 1))
        .with_hms(t.hour, t.minute, t.second)
        .expect("validated when the header was parsed")
        .assume_utc()
}

/// On a leap reference year, the nth second this timestamp falls on.
///
/// Used to compare year-less times with file modification times without
/// committing to a year.
#[must_use]
pub fn second_in_the_year(t: ParsedTime) -> i64 {
    let jan_first = time::Date::from_calendar_date(2000, time::Month::January, 1)
        .expect("the first of a month always exists")
        .midnight();

    (datetime_with_year(t, 2000) - jan_first.assume_utc()).whole_seconds()
}

/// [`second_in_the_year`] for an absolute instant.
#[must_use]
pub fn second_in_the_year_of(t: OffsetDateTime) -> i64 {
    let t = t.to_offset(time::UtcOffset::UTC);

    second_in_the_year(ParsedTime {
        month: t.month(),
        day: t.day(),
        hour: t.hour(),
        minute: t.minute(),
        second: t.second(),
    })
}

/// Callback invoked when the inferred year changes.
pub type OnYearChange = Box<dyn FnMut(i32, ParsedTime, ParsedTime) + Send>;

/// Promotes year-less syslog timestamps to absolute instants, inferring
/// the year from an anchor and from observed wrap-arounds.
pub struct TimeConverter {
    year: i32,
    last: OffsetDateTime,
    last_parsed: Option<ParsedTime>,
    clock: std::sync::Arc<dyn Clock>,
    on_year_change: OnYearChange,
}

impl std::fmt::Debug for TimeConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeConverter")
            .field("year", &self.year)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

impl TimeConverter {
    /// Anchor the converter to a reference instant, usually the guessed
    /// time of the first line of a file.
    #[must_use]
    pub fn new(
        reference: OffsetDateTime,
        clock: std::sync::Arc<dyn Clock>,
        on_year_change: OnYearChange,
    ) -> Self {
        Self {
            year: reference.year(),
            last: reference,
            last_parsed: None,
            clock,
            on_year_change,
        }
    }

    /// Promote one timestamp.
    ///
    /// A backward jump of at least [`YEAR_WRAP_THRESHOLD`] bumps the year,
    /// unless the bumped instant would land in the future of the clock
    /// plus [`FUTURE_SAFETY_MARGIN`]: stale lines replayed into a current
    /// file must not drag the whole stream into next year.
    pub fn convert(&mut self, t: ParsedTime) -> OffsetDateTime {
        let candidate = datetime_with_year(t, self.year);

        if candidate >= self.last {
            self.last = candidate;
            self.last_parsed = Some(t);
            return candidate;
        }

        if self.last - candidate >= YEAR_WRAP_THRESHOLD {
            let bumped = datetime_with_year(t, self.year + 1);

            if bumped <= self.clock.now() + FUTURE_SAFETY_MARGIN {
                let from = self.last_parsed.unwrap_or(t);
                self.year += 1;
                (self.on_year_change)(self.year, from, t);
                self.last = bumped;
                self.last_parsed = Some(t);
                return bumped;
            }

            tracing::warn!(
                target: "vsleuth::timeutil",
                year = self.year + 1,
                time = %t,
                "refusing year bump that would produce a log line from the future"
            );
        }

        // an out-of-order stale line. Convert with the current year and do
        // not move the high-water, downstream dedup will discard it.
        self.last_parsed = Some(t);
        candidate
    }

    /// The year currently inferred.
    #[must_use]
    pub const fn year(&self) -> i32 {
        self.year
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn parsed(month: time::Month, day: u8, hour: u8, minute: u8, second: u8) -> ParsedTime {
        ParsedTime {
            month,
            day,
            hour,
            minute,
            second,
        }
    }

    fn converter(reference: OffsetDateTime, now: OffsetDateTime) -> TimeConverter {
        TimeConverter::new(
            reference,
            std::sync::Arc::new(FakeClock(now)),
            Box::new(|_, _, _| {}),
        )
    }

    #[test]
    fn monotone_times_keep_the_anchor_year() {
        let mut c = converter(datetime!(2020-12-06 06:25:06 UTC), datetime!(2030-01-01 10:00:00 UTC));

        assert_eq!(
            c.convert(parsed(time::Month::December, 6, 6, 25, 6)),
            datetime!(2020-12-06 06:25:06 UTC)
        );
        assert_eq!(
            c.convert(parsed(time::Month::December, 28, 6, 25, 4)),
            datetime!(2020-12-28 06:25:04 UTC)
        );
    }

    #[test]
    fn year_wrap_bumps_once() {
        let changes = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = changes.clone();

        let mut c = TimeConverter::new(
            datetime!(2020-12-06 06:25:06 UTC),
            std::sync::Arc::new(FakeClock(datetime!(2030-01-01 10:00:00 UTC))),
            Box::new(move |_, _, _| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );

        c.convert(parsed(time::Month::December, 28, 6, 25, 4));
        assert_eq!(
            c.convert(parsed(time::Month::January, 3, 6, 22, 59)),
            datetime!(2021-01-03 06:22:59 UTC)
        );
        assert_eq!(c.year(), 2021);
        assert_eq!(changes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn short_backward_jumps_do_not_bump() {
        let mut c = converter(datetime!(2021-03-06 00:00:00 UTC), datetime!(2021-12-10 20:00:00 UTC));

        c.convert(parsed(time::Month::March, 6, 10, 0, 0));

        // two months back: a stale line, not a wrap
        assert_eq!(
            c.convert(parsed(time::Month::January, 3, 6, 25, 7)),
            datetime!(2021-01-03 06:25:07 UTC)
        );
        assert_eq!(c.year(), 2021);

        // and the stream resumes where it was
        assert_eq!(
            c.convert(parsed(time::Month::March, 7, 10, 11, 12)),
            datetime!(2021-03-07 10:11:12 UTC)
        );
    }

    #[test]
    fn refuses_bumps_into_the_future() {
        // clock says early 2021: a wrap-sized backward jump must not move
        // the stream into 2022
        let mut c = converter(datetime!(2021-12-01 00:00:00 UTC), datetime!(2021-12-10 20:00:00 UTC));

        c.convert(parsed(time::Month::December, 1, 0, 0, 0));
        assert_eq!(
            c.convert(parsed(time::Month::February, 1, 0, 0, 0)),
            datetime!(2021-02-01 00:00:00 UTC)
        );
        assert_eq!(c.year(), 2021);
    }

    #[test]
    fn feb_29_normalises_forward_on_non_leap_years() {
        assert_eq!(
            datetime_with_year(parsed(time::Month::February, 29, 12, 0, 0), 2019),
            datetime!(2019-03-01 12:00:00 UTC)
        );
        assert_eq!(
            datetime_with_year(parsed(time::Month::February, 29, 12, 0, 0), 2020),
            datetime!(2020-02-29 12:00:00 UTC)
        );
    }

    #[test]
    fn seconds_in_the_year_order_like_dates() {
        let early = second_in_the_year(parsed(time::Month::February, 28, 22, 8, 56));
        let late = second_in_the_year(parsed(time::Month::December, 14, 6, 24, 27));
        assert!(early < late);

        assert_eq!(
            second_in_the_year_of(datetime!(2019-02-28 22:08:56 UTC)),
            early
        );
    }
}
