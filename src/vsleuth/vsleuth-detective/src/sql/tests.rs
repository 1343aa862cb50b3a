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
use super::*;
use time::macros::datetime;
use vsleuth_common::delivery::{LogRef, TrackedDelivery};
use vsleuth_store::{dbconn, deliverydb, migrator};

struct FakeRawLogs(std::collections::HashMap<(i64, i64), String>);

#[async_trait::async_trait]
impl Accessor for FakeRawLogs {
    async fn fetch_log_line(
        &self,
        _cancellation: &Cancellation,
        time: time::OffsetDateTime,
        sum: Checksum,
    ) -> Result<String, FetchError> {
        self.0
            .get(&(time.unix_timestamp(), sum.as_i64()))
            .cloned()
            .ok_or(FetchError::LogLineNotFound)
    }
}

fn delivery(queue: &str, ts: time::OffsetDateTime) -> TrackedDelivery {
    TrackedDelivery {
        queue: queue.to_string(),
        delivery_ts: ts,
        status: SmtpStatus::Sent,
        dsn: "2.0.0".into(),
        direction: MessageDirection::Outbound,
        sender_local: "alice".into(),
        sender_domain: "example.com".into(),
        recipient_local: "bob".into(),
        recipient_domain: "example.org".into(),
        message_id: "m1@example.com".into(),
        relay: Some(vsleuth_parser::Relay {
            hostname: "mx.example.org".into(),
            port: Some(25),
        }),
        log_refs: vec![],
        expired_ts: None,
        parent_queue: None,
        in_reply_to: None,
        references: vec![],
    }
}

struct Env {
    _dir: tempfile::TempDir,
    detective: SqlDetective,
}

const WIDE: fn() -> TimeInterval = || TimeInterval {
    from: datetime!(2020-01-01 00:00:00 UTC),
    to: datetime!(2021-12-31 23:59:59 UTC),
};

async fn populated_env() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let mut pair = dbconn::open(&dir.path().join("logs.db"), 2).unwrap();
    migrator::run(&mut pair.rw, "logs").unwrap();

    let mut raw_lines = std::collections::HashMap::new();

    // Q1: two attempts to bob@example.org, deferred then sent
    let mut deferred = delivery("Q1AAAAAA", datetime!(2021-01-03 06:25:09 UTC));
    deferred.status = SmtpStatus::Deferred;
    deferred.dsn = "4.4.1".into();
    let deferred_line = "Jan  3 06:25:09 cloud2 postfix/smtp[2650]: Q1AAAAAA: status=deferred";
    let deferred_sum = vsleuth_common::compute_checksum(deferred_line);
    deferred.log_refs = vec![LogRef {
        time: deferred.delivery_ts,
        sum: deferred_sum,
    }];
    raw_lines.insert(
        (deferred.delivery_ts.unix_timestamp(), deferred_sum.as_i64()),
        deferred_line.to_string(),
    );
    deliverydb::insert_delivery(&mut pair.rw, &deferred).unwrap();

    let sent = delivery("Q1AAAAAA", datetime!(2021-01-03 07:25:09 UTC));
    deliverydb::insert_delivery(&mut pair.rw, &sent).unwrap();

    // Q2: a bounce, with the non-delivery report in child queue Q3
    let mut bounced = delivery("Q2BBBBBB", datetime!(2021-01-04 10:00:00 UTC));
    bounced.status = SmtpStatus::Bounced;
    bounced.dsn = "5.1.1".into();
    bounced.recipient_local = "carol".into();
    bounced.recipient_domain = "nowhere.org".into();
    bounced.message_id = "m2@example.com".into();
    deliverydb::insert_delivery(&mut pair.rw, &bounced).unwrap();

    let mut notification = delivery("Q3CCCCCC", datetime!(2021-01-04 10:00:05 UTC));
    notification.sender_local = String::new();
    notification.sender_domain = String::new();
    notification.recipient_local = "alice".into();
    notification.recipient_domain = "example.com".into();
    notification.message_id = "m3@example.com".into();
    notification.parent_queue = Some("Q2BBBBBB".into());
    deliverydb::insert_delivery(&mut pair.rw, &notification).unwrap();

    // Q4: an inbound message for alice
    let mut inbound = delivery("Q4DDDDDD", datetime!(2021-01-05 09:00:00 UTC));
    inbound.direction = MessageDirection::Incoming;
    inbound.sender_local = "carol".into();
    inbound.sender_domain = "example.net".into();
    inbound.recipient_local = "alice".into();
    inbound.recipient_domain = "example.com".into();
    inbound.message_id = "m4@example.net".into();
    inbound.relay = None;
    deliverydb::insert_delivery(&mut pair.rw, &inbound).unwrap();

    // Q5: deferred forever, then expired
    let mut expired = delivery("Q5EEEEEE", datetime!(2021-01-06 09:00:00 UTC));
    expired.status = SmtpStatus::Deferred;
    expired.dsn = "4.4.1".into();
    expired.message_id = "m5@example.com".into();
    expired.expired_ts = Some(datetime!(2021-01-11 09:00:00 UTC));
    deliverydb::insert_delivery(&mut pair.rw, &expired).unwrap();

    // Q6: an inbound reply to m1, stored as a plain sent delivery
    let mut reply = delivery("Q6FFFFFF", datetime!(2021-01-07 09:00:00 UTC));
    reply.direction = MessageDirection::Incoming;
    reply.sender_local = "dave".into();
    reply.sender_domain = "example.net".into();
    reply.recipient_local = "alice".into();
    reply.recipient_domain = "example.com".into();
    reply.message_id = "m6@example.net".into();
    reply.in_reply_to = Some("m1@example.com".into());
    reply.relay = None;
    deliverydb::insert_delivery(&mut pair.rw, &reply).unwrap();

    // Q7: delivered to a smarthost whose hostname encodes the
    // destination domain
    let mut smarthosted = delivery("Q7GGGGGG", datetime!(2021-01-08 09:00:00 UTC));
    smarthosted.recipient_local = "erin".into();
    smarthosted.recipient_domain = "internal.lan".into();
    smarthosted.message_id = "m7@example.com".into();
    smarthosted.relay = Some(vsleuth_parser::Relay {
        hostname: "relay.dest.example".into(),
        port: Some(25),
    });
    deliverydb::insert_delivery(&mut pair.rw, &smarthosted).unwrap();

    let detective = SqlDetective::new(
        pair.ro.clone(),
        std::sync::Arc::new(FakeRawLogs(raw_lines)),
    )
    .await
    .unwrap();

    Env {
        _dir: dir,
        detective,
    }
}

async fn search(
    env: &Env,
    mail_from: &str,
    mail_to: &str,
    status: i64,
    some_id: &str,
) -> MessagesPage {
    env.detective
        .check_message_delivery(
            &Cancellation::none(),
            mail_from,
            mail_to,
            WIDE(),
            status,
            some_id,
            1,
            crate::RESULTS_PER_PAGE,
        )
        .await
        .unwrap()
}

fn message<'a>(page: &'a MessagesPage, queue: &str) -> &'a Message {
    page.messages
        .iter()
        .find(|m| m.queue == queue)
        .unwrap_or_else(|| panic!("queue {queue} not in the page"))
}

#[tokio::test]
async fn attempts_group_per_queue_and_status() {
    let env = populated_env().await;

    let page = search(&env, "alice@example.com", "bob@example.org", NO_STATUS, "").await;

    assert_eq!(page.messages.len(), 1);

    let q1 = message(&page, "Q1AAAAAA");
    assert_eq!(q1.message_id, "m1@example.com");
    assert_eq!(q1.entries.len(), 2);

    let deferred = q1.entries.iter().find(|e| e.dsn == "4.4.1").unwrap();
    assert_eq!(deferred.status, SmtpStatus::Deferred);
    assert_eq!(deferred.mail_to, vec!["bob@example.org".to_string()]);
    assert_eq!(deferred.relays, vec!["example.org".to_string()]);
    assert_eq!(
        deferred.raw_log_msgs,
        vec!["Jan  3 06:25:09 cloud2 postfix/smtp[2650]: Q1AAAAAA: status=deferred".to_string()]
    );

    // two grouped rows folded into one user-visible message
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn bounced_messages_carry_their_return_entry() {
    let env = populated_env().await;

    let page = search(&env, "alice@example.com", "carol@nowhere.org", NO_STATUS, "").await;

    let q2 = message(&page, "Q2BBBBBB");

    let statuses: Vec<SmtpStatus> = q2.entries.iter().map(|e| e.status).collect();
    assert!(statuses.contains(&SmtpStatus::Bounced));
    assert!(statuses.contains(&SmtpStatus::Returned));
}

#[tokio::test]
async fn the_status_overlay_turns_inbound_replies_into_replied() {
    let env = populated_env().await;

    // stored as status=sent, direction=inbound, is_reply set by the
    // search: replied wins
    let page = search(&env, "", "", SmtpStatus::Replied.code(), "").await;

    assert_eq!(page.messages.len(), 1);
    let q6 = message(&page, "Q6FFFFFF");
    assert_eq!(q6.entries[0].status, SmtpStatus::Replied);
}

#[tokio::test]
async fn inbound_deliveries_surface_as_received() {
    let env = populated_env().await;

    let page = search(&env, "", "alice@example.com", SmtpStatus::Received.code(), "").await;

    let queues: Vec<&str> = page.messages.iter().map(|m| m.queue.as_str()).collect();
    assert!(queues.contains(&"Q4DDDDDD"));
    assert!(queues.contains(&"Q6FFFFFF"));

    for m in &page.messages {
        for entry in &m.entries {
            assert_eq!(entry.status, SmtpStatus::Received);
        }
    }
}

#[tokio::test]
async fn expired_queues_are_found_with_their_expiration() {
    let env = populated_env().await;

    let page = search(&env, "", "", SmtpStatus::Expired.code(), "").await;

    assert_eq!(page.messages.len(), 1);
    let q5 = message(&page, "Q5EEEEEE");
    assert_eq!(
        q5.entries[0].expired,
        Some(datetime!(2021-01-11 09:00:00 UTC))
    );
}

#[tokio::test]
async fn some_id_matches_queue_ids_and_message_ids() {
    let env = populated_env().await;

    let by_queue = search(&env, "", "", NO_STATUS, "Q1AAAAAA").await;
    assert_eq!(by_queue.messages.len(), 1);
    assert_eq!(by_queue.messages[0].queue, "Q1AAAAAA");

    let by_message_id = search(&env, "", "", NO_STATUS, "m1@example.com").await;
    assert_eq!(by_message_id.messages.len(), 1);
    assert_eq!(by_message_id.messages[0].queue, "Q1AAAAAA");
}

#[tokio::test]
async fn recipient_domains_fall_back_to_the_relay_hostname() {
    let env = populated_env().await;

    let page = search(&env, "", "dest.example", NO_STATUS, "").await;

    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].queue, "Q7GGGGGG");
}

#[tokio::test]
async fn sent_status_excludes_inbound_messages() {
    let env = populated_env().await;

    let page = search(&env, "", "", SmtpStatus::Sent.code(), "").await;

    let queues: Vec<&str> = page.messages.iter().map(|m| m.queue.as_str()).collect();
    assert!(queues.contains(&"Q1AAAAAA"));
    assert!(!queues.contains(&"Q4DDDDDD"));
    assert!(!queues.contains(&"Q6FFFFFF"));
}

#[tokio::test]
async fn paging_concatenation_equals_the_unpaged_result() {
    let env = populated_env().await;

    let all = search(&env, "", "", NO_STATUS, "").await;

    let mut paged_queues = std::collections::BTreeSet::new();
    let mut page_number = 1;

    loop {
        let page = env
            .detective
            .check_message_delivery(
                &Cancellation::none(),
                "",
                "",
                WIDE(),
                NO_STATUS,
                "",
                page_number,
                1,
            )
            .await
            .unwrap();

        for m in &page.messages {
            // a queue whose groups span page boundaries shows up once
            // per page; the set of visible messages is what must match
            paged_queues.insert(m.queue.clone());
        }

        if page_number >= page.last_page {
            break;
        }

        page_number += 1;
    }

    let all_queues: std::collections::BTreeSet<String> =
        all.messages.iter().map(|m| m.queue.clone()).collect();

    assert_eq!(paged_queues, all_queues);
}

#[tokio::test]
async fn an_interval_without_matches_yields_an_empty_page() {
    let env = populated_env().await;

    let page = env
        .detective
        .check_message_delivery(
            &Cancellation::none(),
            "",
            "",
            TimeInterval {
                from: datetime!(2019-01-01 00:00:00 UTC),
                to: datetime!(2019-12-31 23:59:59 UTC),
            },
            NO_STATUS,
            "",
            1,
            crate::RESULTS_PER_PAGE,
        )
        .await
        .unwrap();

    assert!(page.messages.is_empty());
    assert_eq!(page.total, 0);
    assert_eq!(page.first_page, 1);
    assert_eq!(page.last_page, 1);
}

#[tokio::test]
async fn oldest_available_time_is_the_first_recorded_delivery() {
    let env = populated_env().await;

    let oldest = env
        .detective
        .oldest_available_time(&Cancellation::none())
        .await
        .unwrap();

    assert_eq!(oldest, datetime!(2021-01-03 06:25:09 UTC));
}

#[tokio::test]
async fn a_fresh_store_has_no_available_logs() {
    let dir = tempfile::tempdir().unwrap();
    let mut pair = dbconn::open(&dir.path().join("logs.db"), 1).unwrap();
    migrator::run(&mut pair.rw, "logs").unwrap();

    let detective = SqlDetective::new(
        pair.ro.clone(),
        std::sync::Arc::new(FakeRawLogs(std::collections::HashMap::new())),
    )
    .await
    .unwrap();

    assert!(matches!(
        detective.oldest_available_time(&Cancellation::none()).await,
        Err(DetectiveError::NoAvailableLogs)
    ));
}

#[tokio::test]
async fn case_is_ignored_in_address_matching() {
    let env = populated_env().await;

    let page = search(&env, "ALICE@EXAMPLE.COM", "", SmtpStatus::Sent.code(), "").await;

    let queues: Vec<&str> = page.messages.iter().map(|m| m.queue.as_str()).collect();
    assert!(queues.contains(&"Q1AAAAAA"));
}
