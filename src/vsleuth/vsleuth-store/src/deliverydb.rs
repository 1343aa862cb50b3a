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
use crate::dbconn::{RoPool, RwConn};
use anyhow::Context;
use vsleuth_common::delivery::TrackedDelivery;
use vsleuth_common::runner::{self, Cancellation, RunnerHandle};

/// Tunables of the delivery store.
pub struct Options {
    /// rows older than this are dropped by the periodic cleanup.
    pub retention: std::time::Duration,
}

/// How often the retention cleanup runs.
const CLEANUP_PERIOD: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// Sends tracked deliveries into the single-writer task.
#[derive(Clone)]
pub struct DeliveryPublisher(tokio::sync::mpsc::UnboundedSender<TrackedDelivery>);

impl DeliveryPublisher {
    /// Enqueue one delivery row. Rows are append-only once written.
    pub fn publish(&self, delivery: TrackedDelivery) {
        if self.0.send(delivery).is_err() {
            tracing::warn!("the delivery writer is gone, dropping a row");
        }
    }
}

/// The delivery store writer: owns the only writable handle of `logs`.
pub struct DeliveryDb {
    publisher: DeliveryPublisher,
}

impl DeliveryDb {
    /// Spawn the writer task on the current runtime.
    #[must_use]
    pub fn spawn(mut rw: RwConn, options: Options) -> (Self, RunnerHandle) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<TrackedDelivery>();

        let handle = runner::spawn("delivery-writer", move |cancellation| async move {
            let mut cleanup_timer = tokio::time::interval(CLEANUP_PERIOD);
            cleanup_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            cleanup_timer.tick().await; // the first tick fires immediately

            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(delivery) => {
                            if let Err(e) = insert_delivery(&mut rw, &delivery) {
                                tracing::error!(error = %e, queue = %delivery.queue, "failed to store a delivery");
                            }
                        }
                        None => return Ok(()),
                    },
                    _ = cleanup_timer.tick() => {
                        let cutoff = time::OffsetDateTime::now_utc() - options.retention;
                        if let Err(e) = cleanup(&mut rw, cutoff) {
                            tracing::error!(error = %e, "delivery retention cleanup failed");
                        }
                    }
                    () = cancellation.cancelled() => {
                        // drain whatever the tracker already handed over
                        rx.close();

                        while let Ok(delivery) = rx.try_recv() {
                            if let Err(e) = insert_delivery(&mut rw, &delivery) {
                                tracing::error!(error = %e, "failed to store a delivery while draining");
                            }
                        }

                        return Ok(());
                    }
                }
            }
        });

        (
            Self {
                publisher: DeliveryPublisher(tx),
            },
            handle,
        )
    }

    /// Where the tracker sends its output.
    #[must_use]
    pub fn results_publisher(&self) -> DeliveryPublisher {
        self.publisher.clone()
    }
}

fn id_for(
    tx: &rusqlite::Transaction<'_>,
    insert: &str,
    select: &str,
    param: &dyn rusqlite::ToSql,
) -> anyhow::Result<i64> {
    tx.execute(insert, [param]).context("upsert")?;

    tx.query_row(select, [param], |row| row.get(0))
        .context("reading back an upserted id")
}

fn relay_id(tx: &rusqlite::Transaction<'_>, relay: &vsleuth_parser::Relay) -> anyhow::Result<i64> {
    tx.execute(
        "insert into next_relays(hostname, port) values (?1, ?2)
         on conflict(hostname, port) do nothing",
        rusqlite::params![relay.hostname, relay.port],
    )
    .context("upserting a relay")?;

    tx.query_row(
        "select id from next_relays where hostname = ?1 and port is ?2",
        rusqlite::params![relay.hostname, relay.port],
        |row| row.get(0),
    )
    .context("reading back a relay id")
}

/// Store one tracked delivery into the normalised schema.
///
/// This is the writer task's insert path, exposed for tools and tests
/// that populate a store directly.
///
/// # Errors
///
/// * the transaction fails
pub fn insert_delivery(rw: &mut RwConn, delivery: &TrackedDelivery) -> anyhow::Result<()> {
    rw.tx(|tx| {
        let queue_id = id_for(
            tx,
            "insert into queues(name) values (?1) on conflict(name) do nothing",
            "select id from queues where name = ?1",
            &delivery.queue,
        )?;

        let sender_domain_id = id_for(
            tx,
            "insert into remote_domains(domain) values (?1) on conflict(domain) do nothing",
            "select id from remote_domains where domain = ?1",
            &delivery.sender_domain,
        )?;

        let recipient_domain_id = id_for(
            tx,
            "insert into remote_domains(domain) values (?1) on conflict(domain) do nothing",
            "select id from remote_domains where domain = ?1",
            &delivery.recipient_domain,
        )?;

        let message_id = id_for(
            tx,
            "insert into messageids(value) values (?1) on conflict(value) do nothing",
            "select id from messageids where value = ?1",
            &delivery.message_id,
        )?;

        let next_relay_id = delivery
            .relay
            .as_ref()
            .map(|relay| relay_id(tx, relay))
            .transpose()?;

        tx.execute(
            "insert into deliveries(
                delivery_ts, status, dsn, direction,
                sender_local_part, sender_domain_part_id,
                recipient_local_part, recipient_domain_part_id,
                message_id, next_relay_id
            ) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                delivery.delivery_ts.unix_timestamp(),
                delivery.status.code(),
                delivery.dsn,
                delivery.direction.code(),
                delivery.sender_local,
                sender_domain_id,
                delivery.recipient_local,
                recipient_domain_id,
                message_id,
                next_relay_id,
            ],
        )
        .context("inserting a delivery")?;

        let delivery_id = tx.last_insert_rowid();

        tx.execute(
            "insert into delivery_queue(delivery_id, queue_id) values (?1, ?2)",
            rusqlite::params![delivery_id, queue_id],
        )
        .context("linking the delivery to its queue")?;

        for log_ref in &delivery.log_refs {
            tx.execute(
                "insert into log_lines_ref(delivery_id, time, checksum) values (?1, ?2, ?3)",
                rusqlite::params![
                    delivery_id,
                    log_ref.time.unix_timestamp(),
                    log_ref.sum.as_i64()
                ],
            )
            .context("recording a log back-reference")?;
        }

        if let Some(expired_ts) = delivery.expired_ts {
            tx.execute(
                "insert into expired_queues(queue_id, expired_ts) values (?1, ?2)
                 on conflict(queue_id) do nothing",
                rusqlite::params![queue_id, expired_ts.unix_timestamp()],
            )
            .context("recording a queue expiration")?;
        }

        if let Some(parent) = &delivery.parent_queue {
            let parent_id = id_for(
                tx,
                "insert into queues(name) values (?1) on conflict(name) do nothing",
                "select id from queues where name = ?1",
                parent,
            )?;

            tx.execute(
                "insert into queue_parenting(parent_queue_id, child_queue_id) values (?1, ?2)
                 on conflict(parent_queue_id, child_queue_id) do nothing",
                rusqlite::params![parent_id, queue_id],
            )
            .context("recording queue parenting")?;
        }

        for referenced in delivery.in_reply_to.iter().chain(delivery.references.iter()) {
            let original: Option<i64> = tx
                .query_row(
                    "select id from messageids where value = ?1",
                    [referenced],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
                .context("looking up a referenced message-id")?;

            if let Some(original_id) = original {
                tx.execute(
                    "insert into messageids_replies(original_id, reply_id) values (?1, ?2)
                     on conflict(original_id, reply_id) do nothing",
                    rusqlite::params![original_id, message_id],
                )
                .context("recording a reply reference")?;
            }
        }

        Ok(())
    })
}

fn cleanup(rw: &mut RwConn, cutoff: time::OffsetDateTime) -> anyhow::Result<()> {
    rw.tx(|tx| {
        let cutoff = cutoff.unix_timestamp();

        tx.execute(
            "delete from log_lines_ref where delivery_id in
             (select id from deliveries where delivery_ts < ?1)",
            [cutoff],
        )?;
        tx.execute(
            "delete from delivery_queue where delivery_id in
             (select id from deliveries where delivery_ts < ?1)",
            [cutoff],
        )?;
        let dropped = tx.execute("delete from deliveries where delivery_ts < ?1", [cutoff])?;

        if dropped > 0 {
            tracing::info!(dropped, "dropped deliveries past the retention window");
        }

        Ok(())
    })
}

/// The most recent delivery time, or `None` on a fresh store.
///
/// # Errors
///
/// * pool acquisition was cancelled, or the query failed
pub async fn most_recent_log_time(
    pool: &RoPool,
    cancellation: &Cancellation,
) -> anyhow::Result<Option<time::OffsetDateTime>> {
    let conn = pool.acquire(cancellation).await?;

    let ts: Option<i64> = conn
        .raw()
        .query_row("select max(delivery_ts) from deliveries", [], |row| row.get(0))
        .context("reading the most recent delivery time")?;

    ts.map(|ts| {
        time::OffsetDateTime::from_unix_timestamp(ts).context("stored timestamp out of range")
    })
    .transpose()
}

/// Has anything been ingested yet?
///
/// # Errors
///
/// * pool acquisition was cancelled, or the query failed
pub async fn has_logs(pool: &RoPool, cancellation: &Cancellation) -> anyhow::Result<bool> {
    let conn = pool.acquire(cancellation).await?;

    let count: i64 = conn
        .raw()
        .query_row("select exists(select 1 from deliveries)", [], |row| row.get(0))
        .context("checking for deliveries")?;

    Ok(count != 0)
}
