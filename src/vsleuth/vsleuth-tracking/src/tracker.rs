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
use crate::Filters;
use anyhow::Context;
use vsleuth_common::delivery::{LogRef, MessageDirection, TrackedDelivery};
use vsleuth_common::runner::{self, Cancellation, RunnerHandle};
use vsleuth_common::{split_partial, Publisher, Record};
use vsleuth_parser::{Payload, Relay, SmtpStatus};
use vsleuth_store::dbconn::{RoPool, RwConn};

/// Consumers of completed delivery rows.
pub trait ResultsPublisher: Send {
    /// Hand one completed row over.
    fn publish(&mut self, delivery: TrackedDelivery);
}

impl ResultsPublisher for vsleuth_store::deliverydb::DeliveryPublisher {
    fn publish(&mut self, delivery: TrackedDelivery) {
        Self::publish(self, delivery);
    }
}

/// Feeds parsed records into the tracker task.
pub struct TrackerPublisher(tokio::sync::mpsc::UnboundedSender<Record>);

impl Publisher for TrackerPublisher {
    fn publish(&mut self, record: Record) {
        if self.0.send(record).is_err() {
            tracing::warn!("the tracker is gone, dropping a record");
        }
    }
}

/// If the map of in-flight queues ever reaches this size, something is
/// systematically preventing queue removal lines from being seen.
const IN_FLIGHT_WARN_THRESHOLD: usize = 100_000;

#[derive(Debug, Clone)]
struct PendingResult {
    ts: time::OffsetDateTime,
    status: SmtpStatus,
    dsn: String,
    recipient: String,
    relay: Option<Relay>,
    direction: MessageDirection,
    log_ref: LogRef,
}

#[derive(Debug, Default)]
struct QueueData {
    sender: Option<String>,
    message_id: Option<String>,
    in_reply_to: Option<String>,
    references: Vec<String>,
    results: Vec<PendingResult>,
    expired_ts: Option<time::OffsetDateTime>,
    parent_queue: Option<String>,
    log_refs: Vec<LogRef>,
}

struct TrackingState {
    queues: std::collections::HashMap<String, QueueData>,
    most_recent: Option<time::OffsetDateTime>,
    filters: Filters,
}

impl TrackingState {
    fn handle(&mut self, record: &Record, results: &mut dyn ResultsPublisher) {
        self.most_recent = Some(self.most_recent.map_or(record.time, |t| t.max(record.time)));

        let Some(payload) = &record.payload else {
            return;
        };

        let log_ref = LogRef {
            time: record.time,
            sum: record.sum,
        };

        fn entry<'a>(
            queues: &'a mut std::collections::HashMap<String, QueueData>,
            name: &str,
        ) -> &'a mut QueueData {
            queues.entry(name.to_string()).or_default()
        }

        match payload {
            Payload::QueueNew { queue, .. } => {
                entry(&mut self.queues, queue).log_refs.push(log_ref);
            }

            Payload::CleanupMessageId { queue, message_id } => {
                let data = entry(&mut self.queues, queue);
                data.message_id = Some(message_id.clone());
                data.log_refs.push(log_ref);
            }

            Payload::CleanupReplyHeader {
                queue,
                in_reply_to,
                references,
            } => {
                let data = entry(&mut self.queues, queue);

                if let Some(value) = in_reply_to {
                    data.in_reply_to = Some(value.clone());
                }
                data.references.extend(references.iter().cloned());
                data.log_refs.push(log_ref);
            }

            Payload::QmgrMessageAccepted { queue, sender, .. } => {
                let data = entry(&mut self.queues, queue);
                data.sender = Some(sender.clone());
                data.log_refs.push(log_ref);
            }

            Payload::QmgrExpired { queue, sender } => {
                let data = entry(&mut self.queues, queue);
                data.expired_ts = Some(record.time);

                if data.sender.is_none() {
                    data.sender = Some(sender.clone());
                }
                data.log_refs.push(log_ref);
            }

            Payload::SmtpDelivery {
                queue,
                recipient,
                relay,
                dsn,
                status,
                agent,
                ..
            } => {
                let direction = if agent.is_local_agent() {
                    MessageDirection::Incoming
                } else {
                    MessageDirection::Outbound
                };

                entry(&mut self.queues, queue).results.push(PendingResult {
                    ts: record.time,
                    status: *status,
                    dsn: dsn.clone(),
                    recipient: recipient.clone(),
                    relay: relay.clone(),
                    direction,
                    log_ref,
                });
            }

            Payload::BounceCreated { queue, child_queue } => {
                entry(&mut self.queues, child_queue).parent_queue = Some(queue.clone());
                entry(&mut self.queues, queue).log_refs.push(log_ref);
            }

            Payload::QmgrRemoved { queue } => {
                if let Some(data) = self.queues.remove(queue) {
                    self.flush(queue, data, record.time, results);
                }
            }
        }

        if self.queues.len() == IN_FLIGHT_WARN_THRESHOLD {
            tracing::warn!(
                in_flight = self.queues.len(),
                "unusually many queues never saw their removal line"
            );
        }
    }

    fn flush(
        &self,
        queue: &str,
        data: QueueData,
        removed_at: time::OffsetDateTime,
        results: &mut dyn ResultsPublisher,
    ) {
        let (sender_local, sender_domain) = split_partial(data.sender.as_deref().unwrap_or(""));
        let message_id = data.message_id.clone().unwrap_or_default();

        let base = TrackedDelivery {
            queue: queue.to_string(),
            delivery_ts: removed_at,
            status: SmtpStatus::Expired,
            dsn: String::new(),
            direction: MessageDirection::Outbound,
            sender_local,
            sender_domain,
            recipient_local: String::new(),
            recipient_domain: String::new(),
            message_id,
            relay: None,
            log_refs: data.log_refs.clone(),
            expired_ts: data.expired_ts,
            parent_queue: data.parent_queue.clone(),
            in_reply_to: data.in_reply_to.clone(),
            references: data.references.clone(),
        };

        if data.results.is_empty() {
            // a queue that expired without a single attempt still leaves
            // a trace, carrying its expiration
            if data.expired_ts.is_some() {
                let row = TrackedDelivery {
                    delivery_ts: data.expired_ts.unwrap_or(removed_at),
                    ..base
                };

                if !self.filters.reject(&row) {
                    results.publish(row);
                }
            }

            return;
        }

        for result in data.results {
            let (recipient_local, recipient_domain) = split_partial(&result.recipient);

            let mut log_refs = base.log_refs.clone();
            log_refs.push(result.log_ref);

            let row = TrackedDelivery {
                delivery_ts: result.ts,
                status: result.status,
                dsn: result.dsn,
                direction: result.direction,
                recipient_local,
                recipient_domain,
                relay: result.relay,
                log_refs,
                ..base.clone()
            };

            if self.filters.reject(&row) {
                continue;
            }

            results.publish(row);
        }
    }
}

/// The tracker: one task consuming records, assembling queue histories.
pub struct Tracker {
    tx: tokio::sync::mpsc::UnboundedSender<Record>,
}

impl Tracker {
    /// Spawn the tracker task on the current runtime.
    ///
    /// `logtracker` is the writable handle of the tracker's bookkeeping
    /// database; `results` receives completed rows, already filtered.
    #[must_use]
    pub fn spawn(
        mut logtracker: RwConn,
        mut results: Box<dyn ResultsPublisher>,
        filters: Filters,
    ) -> (Self, RunnerHandle) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Record>();

        let handle = runner::spawn("tracker", move |cancellation| async move {
            let mut state = TrackingState {
                queues: std::collections::HashMap::new(),
                most_recent: None,
                filters,
            };

            let finish = |state: &TrackingState, logtracker: &mut RwConn| {
                if let Some(most_recent) = state.most_recent {
                    if let Err(e) = persist_most_recent(logtracker, most_recent) {
                        tracing::error!(error = %e, "cannot persist the tracker high-water");
                    }
                }
            };

            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(record) => state.handle(&record, results.as_mut()),
                        None => {
                            finish(&state, &mut logtracker);
                            return Ok(());
                        }
                    },
                    () = cancellation.cancelled() => {
                        rx.close();

                        while let Ok(record) = rx.try_recv() {
                            state.handle(&record, results.as_mut());
                        }

                        finish(&state, &mut logtracker);
                        return Ok(());
                    }
                }
            }
        });

        (Self { tx }, handle)
    }

    /// The record sink feeding this tracker.
    #[must_use]
    pub fn publisher(&self) -> TrackerPublisher {
        TrackerPublisher(self.tx.clone())
    }
}

fn persist_most_recent(rw: &mut RwConn, t: time::OffsetDateTime) -> anyhow::Result<()> {
    rw.raw()
        .execute(
            "insert into tracker_state(key, value) values ('most_recent_log_time', ?1)
             on conflict(key) do update set value = max(value, excluded.value)",
            [t.unix_timestamp()],
        )
        .context("persisting the tracker high-water")?;

    Ok(())
}

/// The most recent record time the tracker has seen across runs.
///
/// # Errors
///
/// * pool acquisition was cancelled, or the query failed
pub async fn most_recent_log_time(
    pool: &RoPool,
    cancellation: &Cancellation,
) -> anyhow::Result<Option<time::OffsetDateTime>> {
    let conn = pool.acquire(cancellation).await?;

    let ts = conn.raw().query_row(
        "select value from tracker_state where key = 'most_recent_log_time'",
        [],
        |row| row.get::<_, i64>(0),
    );

    match ts {
        Ok(ts) => Ok(Some(
            time::OffsetDateTime::from_unix_timestamp(ts).context("stored timestamp out of range")?,
        )),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context("reading the tracker high-water")),
    }
}
