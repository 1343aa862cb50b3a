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

// Lessons baked into these scenarios:
//  - timezone information is lost when a log directory is mounted across
//    containers, so modification times are normalised to UTC and the
//    year inference must hold for any offset within half a day;
//  - an updated file can carry lines from the past (rsync artifacts,
//    operator mistakes). Those must never bump the inferred year, and
//    must be discarded instead of being re-published.

use super::{
    gzipped_data_file, plain_current_data_file, plain_data_file, FakeDirectoryContent,
    FakePublisher,
};
use crate::importer::DirectoryImporter;
use crate::planner::{FileEntry, LogPatterns};
use crate::NullAnnouncer;
use time::macros::datetime;
use vsleuth_common::runner::Cancellation;
use vsleuth_common::SumPair;
use vsleuth_parser::timeutil::FakeClock;

fn entry(filename: &str, modification_time: time::OffsetDateTime) -> FileEntry {
    FileEntry {
        filename: filename.to_string(),
        modification_time,
    }
}

fn importer(
    content: FakeDirectoryContent,
    sum: SumPair,
    now: time::OffsetDateTime,
) -> DirectoryImporter<FakeDirectoryContent> {
    DirectoryImporter::new(
        std::sync::Arc::new(content),
        sum,
        LogPatterns::default_patterns(),
        std::sync::Arc::new(FakeClock(now)),
        std::sync::Arc::new(NullAnnouncer),
    )
}

fn epoch_sum() -> SumPair {
    SumPair {
        time: Some(datetime!(1970-01-01 00:00:00 +01:00)),
        sum: None,
    }
}

#[tokio::test]
async fn year_inference_across_multiple_rotated_families() {
    let content = FakeDirectoryContent {
        entries: vec![
            entry("mail.err", datetime!(2020-06-26 06:25:01 +02:00)),
            entry("mail.err.1", datetime!(2020-06-25 16:40:09 +02:00)),
            // this file is in early 2019, much older than the others
            entry("mail.err.2.gz", datetime!(2019-02-28 22:43:31 +01:00)),
            entry("mail.log", datetime!(2021-01-05 14:05:47 +01:00)),
            entry("mail.log.1", datetime!(2021-01-03 06:22:59 +01:00)),
            entry("mail.log.2.gz", datetime!(2020-12-28 06:25:04 +01:00)),
            entry("mail.log.3.gz", datetime!(2020-12-20 06:22:40 +01:00)),
            entry("mail.log.4.gz", datetime!(2020-12-14 06:24:27 +01:00)),
            entry("nonsense", datetime!(2019-02-28 22:43:31 +02:00)),
        ],
        contents: [
            ("mail.err".to_string(), plain_current_data_file("", "")),
            (
                "mail.err.1".to_string(),
                plain_data_file("Jun 25 16:40:09 cloud2 postfix/postfix-script[31421]: fatal: unknown command: 'reloadd'. Usage: postfix start (or stop, reload, abort, flush, check, status, set-permissions, upgrade-configuration)"),
            ),
            (
                "mail.err.2.gz".to_string(),
                gzipped_data_file("Feb 28 22:08:56 ubuntu-2gb-nbg1-1 postfix/postmap[1400]: fatal: open /x/: No such file or directory
Feb 28 22:39:44 ubuntu-2gb-nbg1-1 postfix/smtpd[4470]: error: open database /y/: No such file or directory
Feb 28 22:43:31 ubuntu-2gb-nbg1-1 postfix/smtpd[4677]: error: open database /y/: No such file or directory"),
            ),
            (
                "mail.log".to_string(),
                plain_current_data_file("Jan  3 06:25:07 cloud2 postfix/pickup[25779]: DD78F3E8C1: uid=0 from=<root>
Jan  3 06:25:07 cloud2 postfix/cleanup[26489]: DD78F3E8C1: message-id=<h-02419a263e@h-32c0e.com>
Jan  5 14:05:47 cloud2 postfix/qmgr[1428]: 5EEC73E8C6: removed", ""),
            ),
            (
                "mail.log.1".to_string(),
                plain_data_file("Dec 28 06:25:07 cloud2 postfix/pickup[24537]: 572F93E8B7: uid=0 from=<root>
Dec 28 06:25:07 cloud2 postfix/cleanup[27496]: 572F93E8B7: message-id=<h-52b735975@h-32c0e.com>
Jan  3 06:22:59 cloud2 postfix/smtpd[26341]: disconnect from h-1c62d[26.93.33.217] commands=0/0"),
            ),
            (
                "mail.log.2.gz".to_string(),
                gzipped_data_file("Dec 20 06:25:07 cloud2 postfix/pickup[15941]: AF96E3E8C6: uid=0 from=<root>
Dec 20 06:25:07 cloud2 postfix/cleanup[16236]: AF96E3E8C6: message-id=<h-006d72b77@h-32c0e.com>
Dec 28 06:25:04 cloud2 postfix/smtpd[27432]: disconnect from h-1c62d[26.93.33.217] commands=0/0"),
            ),
            (
                "mail.log.3.gz".to_string(),
                gzipped_data_file("Dec 14 06:25:07 cloud2 postfix/pickup[14915]: E75F43E8C5: uid=0 from=<root>
Dec 14 06:25:07 cloud2 postfix/cleanup[16017]: E75F43E8C5: message-id=<h-ec6557888@h-32c0e.com>
Dec 20 06:22:40 cloud2 postfix/smtpd[16077]: disconnect from h-1c62d[26.93.33.217] commands=0/0"),
            ),
            (
                "mail.log.4.gz".to_string(),
                gzipped_data_file("Dec  6 06:25:06 cloud2 postfix/pickup[22197]: D4D433E8C6: uid=0 from=<root>
Dec  6 06:25:06 cloud2 postfix/cleanup[23434]: D4D433E8C6: message-id=<h-e24810f14@h-32c0e.com>
Dec 14 06:24:27 cloud2 postfix/anvil[15757]: statistics: max cache size 1 at Dec 14 06:21:07"),
            ),
        ]
        .into_iter()
        .collect(),
    };

    let mut publisher = FakePublisher::default();
    let importer = importer(content, epoch_sum(), datetime!(2030-01-01 10:00:00 UTC));

    importer
        .run(&mut publisher, Cancellation::none())
        .await
        .unwrap();

    let records = publisher.records();
    assert_eq!(records.len(), 19);

    assert_eq!(records[0].time, datetime!(2019-02-28 22:08:56 UTC));
    assert_eq!(
        records.last().unwrap().time,
        datetime!(2021-01-05 14:05:47 UTC)
    );

    // the merged stream is never decreasing in time
    for window in records.windows(2) {
        assert!(window[0].time <= window[1].time);
    }
}

#[tokio::test]
async fn an_initially_empty_file_becoming_nonempty_is_imported() {
    // the log file starts empty and is only updated once the watcher is
    // in charge. The synthesised time converter must handle that line.
    let content = FakeDirectoryContent {
        entries: vec![entry("mail.err", datetime!(2021-04-27 08:00:20 UTC))],
        contents: [(
            "mail.err".to_string(),
            plain_current_data_file(
                "",
                "Apr 27 08:00:21 cloud2 postfix/pickup[15941]: AF96E3E8C6: uid=0 from=<root>",
            ),
        )]
        .into_iter()
        .collect(),
    };

    let mut publisher = FakePublisher::default();
    let importer = importer(
        content,
        SumPair {
            time: Some(datetime!(1970-01-01 00:00:00 UTC)),
            sum: None,
        },
        datetime!(2030-01-01 10:00:00 UTC),
    );

    importer
        .run(&mut publisher, Cancellation::none())
        .await
        .unwrap();

    let records = publisher.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].time, datetime!(2021-04-27 08:00:21 UTC));
}

#[tokio::test]
async fn stale_lines_in_an_updated_file_do_not_bump_the_year() {
    let now = datetime!(2021-12-10 20:00:00 UTC);
    let publisher = FakePublisher::default();

    {
        let content = FakeDirectoryContent {
            entries: vec![entry("mail.log", datetime!(2021-03-05 14:05:47 UTC))],
            contents: [(
                "mail.log".to_string(),
                plain_current_data_file(
                    "Jan  2 06:25:07 cloud2 postfix/pickup[25779]: DD78F3E8C1: uid=0 from=<root>
Jan  3 06:25:07 cloud2 postfix/cleanup[26489]: DD78F3E8C1: message-id=<h-02419a263e@h-32c0e.com>
Jan  4 07:00:00 cloud2 postfix/cleanup[26489]: Something not supported
Mar  5 14:05:47 cloud2 postfix/qmgr[1428]: 5EEC73E8C6: removed
",
                    "",
                ),
            )]
            .into_iter()
            .collect(),
        };

        let mut publisher = publisher.clone();
        importer(content, epoch_sum(), now)
            .run(&mut publisher, Cancellation::none())
            .await
            .unwrap();
    }

    {
        // the file was updated with two new lines, then two repeated
        // ones from the past, then new lines again. The repeated ones
        // are ignored and do not drag the stream into next year.
        let content = FakeDirectoryContent {
            entries: vec![entry("mail.log", datetime!(2021-03-08 14:05:47 UTC))],
            contents: [(
                "mail.log".to_string(),
                plain_current_data_file(
                    "Mar  6 00:00:00 cloud2 postfix/qmgr[1428]: 5EEC73E8C6: removed
Mar  6 10:00:00 cloud2 postfix/qmgr[1428]: 5EEC73E8C6: removed
Jan  3 06:25:07 cloud2 postfix/cleanup[26489]: DD78F3E8C1: message-id=<h-02419a263e@h-32c0e.com>
Jan  4 07:00:00 cloud2 postfix/cleanup[26489]: Something not supported
Mar  7 10:11:12 cloud2 postfix/qmgr[1428]: 5EEC73E8C6: removed
Mar  8 10:11:12 cloud2 postfix/qmgr[1428]: 5EEC73E8C6: removed",
                    "",
                ),
            )]
            .into_iter()
            .collect(),
        };

        let mut publisher = publisher.clone();
        importer(content, epoch_sum(), now)
            .run(&mut publisher, Cancellation::none())
            .await
            .unwrap();
    }

    let records = publisher.records();
    assert_eq!(records.len(), 8);

    assert_eq!(records[0].time, datetime!(2021-01-02 06:25:07 UTC));
    assert_eq!(
        records.last().unwrap().time,
        datetime!(2021-03-08 10:11:12 UTC)
    );
}

fn four_line_current_file() -> FakeDirectoryContent {
    FakeDirectoryContent {
        entries: vec![entry("mail.log", datetime!(2021-03-05 14:05:47 UTC))],
        contents: [(
            "mail.log".to_string(),
            plain_current_data_file(
                "Jan  2 06:25:07 cloud2 postfix/pickup[25779]: DD78F3E8C1: uid=0 from=<root>
Jan  2 06:25:07 cloud2 postfix/cleanup[26489]: DD78F3E8C1: message-id=<h-02419a263e@h-32c0e.com>
Jan  4 07:00:00 cloud2 postfix/qmgr[1428]: DD78F3E8C1: removed
Mar  5 14:05:47 cloud2 postfix/qmgr[1428]: 5EEC73E8C6: removed
",
                "",
            ),
        )]
        .into_iter()
        .collect(),
    }
}

#[tokio::test]
async fn a_rerun_from_the_last_high_water_emits_nothing() {
    let now = datetime!(2021-12-10 20:00:00 UTC);

    let mut first_run = FakePublisher::default();
    importer(four_line_current_file(), SumPair::zero(), now)
        .import_only(&mut first_run, Cancellation::none())
        .await
        .unwrap();

    let records = first_run.records();
    assert_eq!(records.len(), 4);

    let high_water = SumPair {
        time: Some(records.last().unwrap().time),
        sum: Some(records.last().unwrap().sum),
    };

    let mut second_run = FakePublisher::default();
    importer(four_line_current_file(), high_water, now)
        .import_only(&mut second_run, Cancellation::none())
        .await
        .unwrap();

    assert!(second_run.records().is_empty());
}

#[tokio::test]
async fn a_rerun_from_an_earlier_high_water_resumes_strictly_after_it() {
    let now = datetime!(2021-12-10 20:00:00 UTC);

    let mut first_run = FakePublisher::default();
    importer(four_line_current_file(), SumPair::zero(), now)
        .import_only(&mut first_run, Cancellation::none())
        .await
        .unwrap();

    let records = first_run.records();

    // resume from the first line of the equal-second band: its twin in
    // the same second is distinguished by the checksum
    let high_water = SumPair {
        time: Some(records[0].time),
        sum: Some(records[0].sum),
    };

    let mut second_run = FakePublisher::default();
    importer(four_line_current_file(), high_water, now)
        .import_only(&mut second_run, Cancellation::none())
        .await
        .unwrap();

    let resumed = second_run.records();
    assert_eq!(resumed.len(), 3);
    assert_eq!(resumed[0].sum, records[1].sum);

    // without a checksum, the whole equal-second band is skipped
    let coarse_high_water = SumPair {
        time: Some(records[0].time),
        sum: None,
    };

    let mut third_run = FakePublisher::default();
    importer(four_line_current_file(), coarse_high_water, now)
        .import_only(&mut third_run, Cancellation::none())
        .await
        .unwrap();

    assert_eq!(third_run.records().len(), 2);
    assert_eq!(
        third_run.records()[0].time,
        datetime!(2021-01-04 07:00:00 UTC)
    );
}

#[tokio::test]
async fn live_lines_of_one_family_keep_their_on_disk_order() {
    // three lines within the same second: the heap must not reorder them
    let content = FakeDirectoryContent {
        entries: vec![entry("mail.log", datetime!(2021-03-05 14:05:47 UTC))],
        contents: [(
            "mail.log".to_string(),
            plain_current_data_file(
                "",
                "Mar  6 10:00:00 cloud2 postfix/qmgr[1428]: AAAA73E8C6: removed
Mar  6 10:00:00 cloud2 postfix/qmgr[1428]: BBBB73E8C6: removed
Mar  6 10:00:00 cloud2 postfix/qmgr[1428]: CCCC73E8C6: removed",
            ),
        )]
        .into_iter()
        .collect(),
    };

    let mut publisher = FakePublisher::default();
    importer(content, epoch_sum(), datetime!(2021-12-10 20:00:00 UTC))
        .run(&mut publisher, Cancellation::none())
        .await
        .unwrap();

    let records = publisher.records();
    assert_eq!(records.len(), 3);

    let queues: Vec<String> = records
        .iter()
        .map(|r| r.payload.as_ref().unwrap().queue().to_string())
        .collect();
    assert_eq!(queues, vec!["AAAA73E8C6", "BBBB73E8C6", "CCCC73E8C6"]);
}

#[tokio::test]
async fn live_records_across_families_come_out_time_sorted() {
    // mail.err's line is older than mail.log's: the heap must put it
    // first even though both arrive concurrently
    let content = FakeDirectoryContent {
        entries: vec![
            entry("mail.log", datetime!(2021-03-05 14:05:47 UTC)),
            entry("mail.err", datetime!(2021-03-04 09:00:00 UTC)),
        ],
        contents: [
            (
                "mail.log".to_string(),
                plain_current_data_file(
                    "",
                    "Mar  6 10:00:00 cloud2 postfix/qmgr[1428]: AAAA73E8C6: removed",
                ),
            ),
            (
                "mail.err".to_string(),
                plain_current_data_file(
                    "",
                    "Mar  5 09:00:00 cloud2 postfix/qmgr[1428]: BBBB73E8C6: removed",
                ),
            ),
        ]
        .into_iter()
        .collect(),
    };

    let mut publisher = FakePublisher::default();
    importer(content, epoch_sum(), datetime!(2021-12-10 20:00:00 UTC))
        .run(&mut publisher, Cancellation::none())
        .await
        .unwrap();

    let records = publisher.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].time, datetime!(2021-03-05 09:00:00 UTC));
    assert_eq!(records[1].time, datetime!(2021-03-06 10:00:00 UTC));
}

#[tokio::test]
async fn a_file_disappearing_mid_plan_fails_the_import() {
    // listed in the directory, but gone by the time it is opened
    let content = FakeDirectoryContent {
        entries: vec![
            entry("mail.log", datetime!(2021-03-05 14:05:47 UTC)),
            entry("mail.log.1", datetime!(2021-03-01 00:00:00 UTC)),
        ],
        contents: [(
            "mail.log".to_string(),
            plain_current_data_file(
                "Mar  5 14:05:47 cloud2 postfix/qmgr[1428]: 5EEC73E8C6: removed",
                "",
            ),
        )]
        .into_iter()
        .collect(),
    };

    let mut publisher = FakePublisher::default();
    let err = importer(content, SumPair::zero(), datetime!(2030-01-01 10:00:00 UTC))
        .import_only(&mut publisher, Cancellation::none())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("disappeared"));
}

#[tokio::test]
async fn the_initial_log_time_is_the_earliest_across_families() {
    let content = FakeDirectoryContent {
        entries: vec![
            entry("mail.log", datetime!(2021-01-05 14:05:47 UTC)),
            entry("mail.err", datetime!(2019-02-28 22:43:31 UTC)),
        ],
        contents: [
            (
                "mail.log".to_string(),
                plain_current_data_file(
                    "Jan  3 06:25:07 cloud2 postfix/pickup[25779]: DD78F3E8C1: uid=0 from=<root>",
                    "",
                ),
            ),
            (
                "mail.err".to_string(),
                plain_current_data_file(
                    "Feb 28 22:08:56 cloud2 postfix/smtpd[4470]: error: open database /y/",
                    "",
                ),
            ),
        ]
        .into_iter()
        .collect(),
    };

    let initial = crate::find_initial_log_time(&content, &LogPatterns::default_patterns()).unwrap();

    assert_eq!(initial, datetime!(2019-02-28 22:08:56 UTC));
}

#[tokio::test]
async fn an_empty_directory_fails_ingest_startup() {
    let content = FakeDirectoryContent {
        entries: vec![],
        contents: std::collections::HashMap::new(),
    };

    let mut publisher = FakePublisher::default();
    let err = importer(content, SumPair::zero(), datetime!(2030-01-01 10:00:00 UTC))
        .run(&mut publisher, Cancellation::none())
        .await
        .unwrap_err();

    assert!(err
        .chain()
        .any(|cause| cause.downcast_ref::<crate::IngestError>().is_some()));
}

#[tokio::test]
async fn following_without_a_current_base_file_is_refused() {
    let content = FakeDirectoryContent {
        entries: vec![
            entry("mail.log.1", datetime!(2021-06-01 00:00:00 UTC)),
            entry("mail.log.2.gz", datetime!(2021-05-01 00:00:00 UTC)),
        ],
        contents: [
            (
                "mail.log.1".to_string(),
                plain_data_file("Jun  1 00:00:00 cloud2 postfix/qmgr[1]: 5EEC73E8C6: removed"),
            ),
            (
                "mail.log.2.gz".to_string(),
                gzipped_data_file("May  1 00:00:00 cloud2 postfix/qmgr[1]: 5EEC73E8C6: removed"),
            ),
        ]
        .into_iter()
        .collect(),
    };

    let mut publisher = FakePublisher::default();
    let err = importer(content, SumPair::zero(), datetime!(2030-01-01 10:00:00 UTC))
        .run(&mut publisher, Cancellation::none())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("missing current log file"));
}
