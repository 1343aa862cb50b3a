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
use crate::dbconn::{RoPool, RoPooledConn, RwConn};
use anyhow::Context;
use vsleuth_common::runner::{self, Cancellation, RunnerHandle};
use vsleuth_common::{Checksum, Record, SumPair};

/// Failure modes when resolving one raw line.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// the `(time, checksum)` pair references a line we no longer (or
    /// never) stored. Expected after retention cleanups; non-fatal.
    #[error("log line not found")]
    LogLineNotFound,

    /// anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Read access to stored raw lines.
///
/// The detective resolves its log back-references through this seam, so
/// tests can substitute an in-memory fake.
#[async_trait::async_trait]
pub trait Accessor: Send + Sync {
    /// The raw line published at `time` with content checksum `sum`.
    async fn fetch_log_line(
        &self,
        cancellation: &Cancellation,
        time: time::OffsetDateTime,
        sum: Checksum,
    ) -> Result<String, FetchError>;
}

const FETCH_LOG_LINE_KEY: &str = "rawlogs_fetch_log_line";

/// [`Accessor`] over the `rawlogs` read pool.
pub struct SqlAccessor {
    pool: std::sync::Arc<RoPool>,
}

impl SqlAccessor {
    /// Register the accessor statements on every pooled handle.
    ///
    /// # Errors
    ///
    /// * a statement fails to prepare
    pub async fn new(pool: std::sync::Arc<RoPool>) -> anyhow::Result<Self> {
        pool.for_each(|conn| {
            conn.prepare(
                FETCH_LOG_LINE_KEY,
                "select content from log_lines where time = :time and checksum = :checksum",
            )?;

            Ok(())
        })
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl Accessor for SqlAccessor {
    async fn fetch_log_line(
        &self,
        cancellation: &Cancellation,
        time: time::OffsetDateTime,
        sum: Checksum,
    ) -> Result<String, FetchError> {
        let conn = self.pool.acquire(cancellation).await?;

        fetch_log_line_with_conn(&conn, time, sum)
    }
}

fn fetch_log_line_with_conn(
    conn: &RoPooledConn,
    time: time::OffsetDateTime,
    sum: Checksum,
) -> Result<String, FetchError> {
    conn.stmt(FETCH_LOG_LINE_KEY)
        .query_row(
            rusqlite::named_params! {
                ":time": time.unix_timestamp(),
                ":checksum": sum.as_i64(),
            },
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => FetchError::LogLineNotFound,
            other => FetchError::Other(anyhow::Error::new(other).context("fetching a raw log line")),
        })
}

/// The ingest high-water: time and checksum of the newest stored line.
///
/// # Errors
///
/// * pool acquisition was cancelled, or the query failed
pub async fn most_recent_log_time_and_sum(
    pool: &RoPool,
    cancellation: &Cancellation,
) -> anyhow::Result<SumPair> {
    let conn = pool.acquire(cancellation).await?;

    let row = conn.raw().query_row(
        "select time, checksum from log_lines order by time desc, id desc limit 1",
        [],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
    );

    match row {
        Ok((ts, sum)) => Ok(SumPair {
            time: Some(
                time::OffsetDateTime::from_unix_timestamp(ts)
                    .context("stored timestamp out of range")?,
            ),
            sum: Some(Checksum::from_i64(sum)),
        }),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(SumPair::zero()),
        Err(e) => Err(anyhow::Error::new(e).context("reading the raw-logs high-water")),
    }
}

/// Tunables of the raw-logs store.
pub struct Options {
    /// lines older than this are dropped by the periodic cleanup.
    pub retention: std::time::Duration,
}

const CLEANUP_PERIOD: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// The raw-logs writer and its record publisher.
pub struct RawLogsDb {
    tx: tokio::sync::mpsc::UnboundedSender<(i64, Checksum, String)>,
}

/// Publishes parsed records into the raw-logs writer.
pub struct RawLogsPublisher(tokio::sync::mpsc::UnboundedSender<(i64, Checksum, String)>);

impl vsleuth_common::Publisher for RawLogsPublisher {
    fn publish(&mut self, record: Record) {
        if self
            .0
            .send((record.time.unix_timestamp(), record.sum, record.line))
            .is_err()
        {
            tracing::warn!("the raw-logs writer is gone, dropping a line");
        }
    }
}

impl RawLogsDb {
    /// Spawn the writer task on the current runtime.
    #[must_use]
    pub fn spawn(mut rw: RwConn, options: Options) -> (Self, RunnerHandle) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(i64, Checksum, String)>();

        let handle = runner::spawn("rawlogs-writer", move |cancellation| async move {
            let mut cleanup_timer = tokio::time::interval(CLEANUP_PERIOD);
            cleanup_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            cleanup_timer.tick().await;

            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some((ts, sum, line)) => {
                            if let Err(e) = insert_line(&mut rw, ts, sum, &line) {
                                tracing::error!(error = %e, "failed to store a raw log line");
                            }
                        }
                        None => return Ok(()),
                    },
                    _ = cleanup_timer.tick() => {
                        let cutoff = time::OffsetDateTime::now_utc() - options.retention;
                        if let Err(e) = cleanup(&mut rw, cutoff.unix_timestamp()) {
                            tracing::error!(error = %e, "raw-logs retention cleanup failed");
                        }
                    }
                    () = cancellation.cancelled() => {
                        rx.close();

                        while let Ok((ts, sum, line)) = rx.try_recv() {
                            if let Err(e) = insert_line(&mut rw, ts, sum, &line) {
                                tracing::error!(error = %e, "failed to store a raw line while draining");
                            }
                        }

                        return Ok(());
                    }
                }
            }
        });

        (Self { tx }, handle)
    }

    /// A publisher feeding this writer; compose it with the tracker's.
    #[must_use]
    pub fn publisher(&self) -> RawLogsPublisher {
        RawLogsPublisher(self.tx.clone())
    }
}

fn insert_line(rw: &mut RwConn, ts: i64, sum: Checksum, line: &str) -> anyhow::Result<()> {
    rw.raw()
        .execute(
            "insert into log_lines(time, checksum, content) values (?1, ?2, ?3)
             on conflict(time, checksum) do nothing",
            rusqlite::params![ts, sum.as_i64(), line],
        )
        .context("inserting a raw log line")?;

    Ok(())
}

fn cleanup(rw: &mut RwConn, cutoff: i64) -> anyhow::Result<()> {
    let dropped = rw
        .raw()
        .execute("delete from log_lines where time < ?1", [cutoff])
        .context("deleting raw lines past retention")?;

    if dropped > 0 {
        tracing::info!(dropped, "dropped raw log lines past the retention window");
    }

    Ok(())
}
