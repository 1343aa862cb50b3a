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
use crate::{
    Detective, DetectiveError, Message, MessageDelivery, MessagesPage, NO_STATUS,
};
use anyhow::Context;
use vsleuth_common::delivery::MessageDirection;
use vsleuth_common::runner::Cancellation;
use vsleuth_common::{split_partial, Checksum, TimeInterval};
use vsleuth_parser::SmtpStatus;
use vsleuth_store::dbconn::{RoPool, RoPooledConn};
use vsleuth_store::rawlogsdb::{Accessor, FetchError};

const CHECK_MESSAGE_DELIVERY_KEY: &str = "detective_check_message_delivery";
const OLDEST_AVAILABLE_TIME_KEY: &str = "detective_oldest_available_time";

// NOTE: one statement covers every search mode, discriminated by the
// :status parameter. It computes more than some modes need; splitting it
// per mode would only be acceptable with every branch covered by the
// paging/overlay test matrix.
const CHECK_MESSAGE_DELIVERY_SQL: &str = r"
with
sent_deliveries_filtered_by_condition(id, delivery_ts, status, dsn, queue_id, message_id, direction, returned, mailfrom, mailto, relay_id, is_reply) as (
    select
        d.id, d.delivery_ts, d.status, d.dsn, dq.queue_id, mid.value, d.direction, false,
        d.sender_local_part    || '@' || sender_domain.domain    as mailfrom,
        d.recipient_local_part || '@' || recipient_domain.domain as mailto,
        d.next_relay_id,
        (:status = :replied_status)
    from
        deliveries d
    join
        remote_domains sender_domain    on sender_domain.id    = d.sender_domain_part_id
    join
        remote_domains recipient_domain on recipient_domain.id = d.recipient_domain_part_id
    left join
        next_relays relay on relay.id = d.next_relay_id
    join
        delivery_queue dq on dq.delivery_id = d.id
    join
        queues q on q.id = dq.queue_id
    join
        messageids mid on mid.id = d.message_id
    where
        (d.sender_local_part     = :sender_local_part    collate nocase or :sender_local_part = '') and
        (sender_domain.domain    = :sender_domain        collate nocase or :sender_domain = '') and
        (d.recipient_local_part  = :recipient_local_part collate nocase or :recipient_local_part = '') and
        (recipient_domain.domain = :recipient_domain     collate nocase or :recipient_domain = '' or relay.hostname like :recipient_domain_like collate nocase) and
        (d.delivery_ts between :start and :end) and
        (
            (d.status = :status and d.status not in (:received_status, :replied_status) and d.direction = :direction_outbound)  -- sent emails
            or (:status = :received_status and d.direction = :direction_inbound)                                                -- received emails
            or (
                :status = :replied_status
                    and d.direction = :direction_inbound
                    and d.sender_local_part != '' -- bounce messages, where the sender is empty, are not replies
                    and exists(select * from messageids_replies mr where mr.reply_id = d.message_id)
            )
            or :status = :no_status
            or (:status = :expired_status and exists(select * from expired_queues where queue_id = q.id))
        ) and
        (q.name = :some_id or mid.value = :some_id or :some_id = '')
),
returned_deliveries(id, delivery_ts, status, dsn, queue_id, message_id, direction, returned, mailfrom, mailto, relay_id, is_reply) as (
    select d.id, d.delivery_ts, d.status, d.dsn, sd.queue_id, mid.value, d.direction, true, sd.mailfrom, sd.mailto, d.next_relay_id, false
    from
        deliveries d
    join
        delivery_queue on delivery_queue.delivery_id = d.id
    join
        queue_parenting on delivery_queue.queue_id = queue_parenting.child_queue_id
    join
        queues qp on queue_parenting.parent_queue_id = qp.id
    join
        sent_deliveries_filtered_by_condition sd on qp.id = sd.queue_id
    join
        messageids mid on mid.id = d.message_id
),
deliveries_filtered_by_condition(id, delivery_ts, status, dsn, queue_id, message_id, direction, returned, mailfrom, mailto, relay_id, is_reply) as (
    select id, delivery_ts, status, dsn, queue_id, message_id, direction, returned, mailfrom, mailto, relay_id, is_reply from sent_deliveries_filtered_by_condition
    union
    select id, delivery_ts, status, dsn, queue_id, message_id, direction, returned, mailfrom, mailto, relay_id, is_reply from returned_deliveries
),
queues_filtered_by_condition(delivery_id, queue_id, expired_ts, mailfrom, mailto) as (
    select distinct deliveries_filtered_by_condition.id, delivery_queue.queue_id, expired_ts, mailfrom, mailto
    from deliveries_filtered_by_condition
    left join expired_queues eq on eq.queue_id = deliveries_filtered_by_condition.queue_id
    join delivery_queue on delivery_queue.delivery_id = deliveries_filtered_by_condition.id
),
grouped_and_computed(log_refs, rn, total, delivery_ts, status, dsn, queue_id, message_id, queue, expired_ts, number_of_attempts, min_ts, max_ts, direction, returned, mailfrom, mailto, relay, is_reply) as (
    select
        json_group_array(distinct iif(ref.time is null, json_object('invalid', json('true')), json_object('time', ref.time, 'checksum', ref.checksum))),
        row_number() over (order by delivery_ts),
        count() over () as total,
        delivery_ts, status, dsn, d.queue_id, d.message_id, queues.name as queue, expired_ts,
        count(distinct delivery_ts) as number_of_attempts, min(delivery_ts) as min_ts, max(delivery_ts) as max_ts,
        d.direction as direction,
        d.returned as returned,
        d.mailfrom, json_group_array(distinct d.mailto),
        json_group_array(distinct host_domain_from_domain(coalesce(next_relays.hostname, 'local'))),
        d.is_reply as is_reply
    from deliveries_filtered_by_condition d
    join queues on d.queue_id = queues.id
    join queues_filtered_by_condition q on q.queue_id = d.queue_id
    left join next_relays on d.relay_id = next_relays.id
    left join log_lines_ref ref on d.id = ref.delivery_id
    group by d.queue_id, status, dsn
)
select total, status, dsn, queue, message_id, expired_ts, number_of_attempts, min_ts, max_ts, direction, returned, mailfrom, mailto, relay, log_refs, is_reply
from grouped_and_computed
order by delivery_ts, returned
limit :limit
offset :offset
";

const OLDEST_AVAILABLE_TIME_SQL: &str = r"
with first_delivery_queue(delivery_id) as
(
    select delivery_id from delivery_queue order by id asc limit 1
)
select
    deliveries.delivery_ts
from
    deliveries join first_delivery_queue on first_delivery_queue.delivery_id = deliveries.id
";

/// Map a relay hostname to its representative domain: the last two
/// labels, so `mx1.mail.example.com` groups with `example.com`.
fn host_domain_from_domain(hostname: &str) -> String {
    let labels: Vec<&str> = hostname.split('.').collect();

    if labels.len() <= 2 {
        return hostname.to_string();
    }

    labels[labels.len() - 2..].join(".")
}

/// The SQL-backed [`Detective`] over the delivery store's read pool.
pub struct SqlDetective {
    pool: std::sync::Arc<RoPool>,
    raw_logs: std::sync::Arc<dyn Accessor>,
}

impl SqlDetective {
    /// Register the detective's statements and SQL functions on every
    /// pooled handle.
    ///
    /// # Errors
    ///
    /// * a statement fails to prepare
    pub async fn new(
        pool: std::sync::Arc<RoPool>,
        raw_logs: std::sync::Arc<dyn Accessor>,
    ) -> anyhow::Result<Self> {
        pool.for_each(|conn| {
            conn.raw()
                .create_scalar_function(
                    "host_domain_from_domain",
                    1,
                    rusqlite::functions::FunctionFlags::SQLITE_UTF8
                        | rusqlite::functions::FunctionFlags::SQLITE_DETERMINISTIC,
                    |ctx| {
                        let hostname: String = ctx.get(0)?;
                        Ok(host_domain_from_domain(&hostname))
                    },
                )
                .context("registering host_domain_from_domain")?;

            conn.prepare(CHECK_MESSAGE_DELIVERY_KEY, CHECK_MESSAGE_DELIVERY_SQL)?;
            conn.prepare(OLDEST_AVAILABLE_TIME_KEY, OLDEST_AVAILABLE_TIME_SQL)?;

            Ok(())
        })
        .await?;

        Ok(Self { pool, raw_logs })
    }
}

struct FetchedRow {
    total: i64,
    status: i64,
    dsn: String,
    queue: String,
    message_id: String,
    expired_ts: Option<i64>,
    number_of_attempts: i64,
    ts_min: i64,
    ts_max: i64,
    direction: i64,
    returned: bool,
    mail_from: String,
    mail_to_json: String,
    relays_json: String,
    log_refs_json: String,
    is_reply: bool,
}

#[derive(serde::Deserialize)]
struct RawLogRef {
    time: Option<i64>,
    checksum: Option<i64>,
    #[serde(default)]
    invalid: Option<bool>,
}

#[allow(clippy::too_many_arguments)]
fn fetch_rows(
    conn: &RoPooledConn,
    sender: (&str, &str),
    recipient: (&str, &str),
    interval: TimeInterval,
    status: i64,
    some_id: &str,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<FetchedRow>> {
    let mut stmt = conn.stmt(CHECK_MESSAGE_DELIVERY_KEY);

    let rows = stmt
        .query_map(
            rusqlite::named_params! {
                ":start": interval.from.unix_timestamp(),
                ":end": interval.to.unix_timestamp(),
                ":status": status,
                ":received_status": SmtpStatus::Received.code(),
                ":replied_status": SmtpStatus::Replied.code(),
                ":expired_status": SmtpStatus::Expired.code(),
                ":direction_inbound": MessageDirection::Incoming.code(),
                ":no_status": NO_STATUS,
                ":direction_outbound": MessageDirection::Outbound.code(),
                ":sender_local_part": sender.0,
                ":sender_domain": sender.1,
                ":recipient_local_part": recipient.0,
                ":recipient_domain": recipient.1,
                ":recipient_domain_like": format!("%{}", recipient.1),
                ":some_id": some_id,
                ":limit": limit,
                ":offset": offset,
            },
            |row| {
                Ok(FetchedRow {
                    total: row.get(0)?,
                    status: row.get(1)?,
                    dsn: row.get(2)?,
                    queue: row.get(3)?,
                    message_id: row.get(4)?,
                    expired_ts: row.get(5)?,
                    number_of_attempts: row.get(6)?,
                    ts_min: row.get(7)?,
                    ts_max: row.get(8)?,
                    direction: row.get(9)?,
                    returned: row.get(10)?,
                    mail_from: row.get(11)?,
                    mail_to_json: row.get(12)?,
                    relays_json: row.get(13)?,
                    log_refs_json: row.get(14)?,
                    is_reply: row.get(15)?,
                })
            },
        )
        .context("running the delivery search")?;

    rows.collect::<Result<Vec<_>, _>>()
        .context("reading delivery search rows")
}

impl SqlDetective {
    async fn resolve_log_refs(
        &self,
        cancellation: &Cancellation,
        log_refs_json: &str,
    ) -> anyhow::Result<Vec<String>> {
        let refs: Vec<RawLogRef> =
            serde_json::from_str(log_refs_json).context("malformed log-ref array")?;

        let mut lines = Vec::with_capacity(refs.len());

        for log_ref in refs {
            if log_ref.invalid == Some(true) {
                continue;
            }

            let (Some(ts), Some(checksum)) = (log_ref.time, log_ref.checksum) else {
                continue;
            };

            let time =
                time::OffsetDateTime::from_unix_timestamp(ts).context("log ref out of range")?;

            match self
                .raw_logs
                .fetch_log_line(cancellation, time, Checksum::from_i64(checksum))
                .await
            {
                Ok(line) => lines.push(line),
                // the raw line already fell out of retention; the report
                // is still useful without it
                Err(FetchError::LogLineNotFound) => {}
                Err(FetchError::Other(e)) => return Err(e),
            }
        }

        Ok(lines)
    }
}

#[async_trait::async_trait]
impl Detective for SqlDetective {
    async fn check_message_delivery(
        &self,
        cancellation: &Cancellation,
        mail_from: &str,
        mail_to: &str,
        interval: TimeInterval,
        status: i64,
        some_id: &str,
        page: i64,
        limit: i64,
    ) -> anyhow::Result<MessagesPage> {
        anyhow::ensure!(page >= 1, "page numbers are 1-based");
        anyhow::ensure!(limit > 0, "the page size must be positive");

        let sender = split_partial(mail_from);
        let recipient = split_partial(mail_to);

        let query_started = std::time::Instant::now();

        let conn = self.pool.acquire(cancellation).await?;

        // a cancelled caller aborts the statement mid-flight
        let interrupt = conn.interrupt_handle();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let watched_cancellation = cancellation.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = watched_cancellation.cancelled() => interrupt.interrupt(),
                _ = done_rx => {}
            }
        });

        let some_id = some_id.trim().to_string();
        let offset = (page - 1) * limit;

        let rows = tokio::task::spawn_blocking(move || {
            let rows = fetch_rows(
                &conn,
                (&sender.0, &sender.1),
                (&recipient.0, &recipient.1),
                interval,
                status,
                &some_id,
                limit,
                offset,
            );

            drop(done_tx);
            drop(conn);

            rows
        })
        .await
        .context("the delivery search task died")??;

        tracing::debug!(elapsed = ?query_started.elapsed(), "executed the delivery search");

        let mut total = 0;
        let mut grouped = 0;
        let mut messages: Vec<Message> = Vec::new();

        for row in rows {
            total = row.total;

            let mut status = SmtpStatus::from_code(row.status)
                .context("unknown status stored in the delivery store")?;

            // the read-time overlay, in this order: later overrides win
            if MessageDirection::from_code(row.direction) == Some(MessageDirection::Incoming) {
                status = SmtpStatus::Received;
            }

            if row.returned {
                status = SmtpStatus::Returned;
            }

            if row.is_reply {
                status = SmtpStatus::Replied;
            }

            let mail_to: Vec<String> =
                serde_json::from_str(&row.mail_to_json).context("malformed recipient array")?;
            let relays: Vec<String> =
                serde_json::from_str(&row.relays_json).context("malformed relay array")?;

            let raw_log_msgs = self
                .resolve_log_refs(cancellation, &row.log_refs_json)
                .await?;

            let entry = MessageDelivery {
                number_of_attempts: row.number_of_attempts,
                time_min: time::OffsetDateTime::from_unix_timestamp(row.ts_min)
                    .context("stored timestamp out of range")?,
                time_max: time::OffsetDateTime::from_unix_timestamp(row.ts_max)
                    .context("stored timestamp out of range")?,
                status,
                dsn: row.dsn,
                relays,
                expired: row
                    .expired_ts
                    .map(time::OffsetDateTime::from_unix_timestamp)
                    .transpose()
                    .context("stored expiration out of range")?,
                mail_from: row.mail_from,
                mail_to,
                raw_log_msgs,
            };

            // rows of the same queue fold into one user-visible message
            match messages.iter_mut().find(|m| m.queue == row.queue) {
                Some(message) => {
                    grouped += 1;
                    message.entries.push(entry);
                }
                None => messages.push(Message {
                    queue: row.queue,
                    message_id: row.message_id,
                    entries: vec![entry],
                }),
            }
        }

        Ok(MessagesPage {
            page_number: page,
            first_page: 1,
            last_page: total / limit + 1,
            total: total - grouped,
            messages,
        })
    }

    async fn oldest_available_time(
        &self,
        cancellation: &Cancellation,
    ) -> Result<time::OffsetDateTime, DetectiveError> {
        let conn = self.pool.acquire(cancellation).await?;

        let ts = conn
            .stmt(OLDEST_AVAILABLE_TIME_KEY)
            .query_row([], |row| row.get::<_, i64>(0));

        match ts {
            Ok(ts) => Ok(time::OffsetDateTime::from_unix_timestamp(ts)
                .context("stored timestamp out of range")?),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(DetectiveError::NoAvailableLogs),
            Err(e) => Err(DetectiveError::Other(
                anyhow::Error::new(e).context("reading the oldest available time"),
            )),
        }
    }
}

#[cfg(test)]
mod tests;
