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
use vsleuth_common::runner::{self, Cancellation, RunnerHandle};

/// Failure modes of the settings store.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// nothing stored under the requested key.
    #[error("no such key")]
    NoSuchKey,

    /// anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Read side of the settings store.
#[derive(Clone)]
pub struct Reader {
    pool: std::sync::Arc<RoPool>,
}

impl Reader {
    /// Read settings over the `master` read pool.
    #[must_use]
    pub const fn new(pool: std::sync::Arc<RoPool>) -> Self {
        Self { pool }
    }

    /// Fetch and deserialize the JSON value stored under `key`.
    ///
    /// # Errors
    ///
    /// * [`MetadataError::NoSuchKey`] when the key was never stored
    /// * deserialization or connection failures
    pub async fn retrieve_json<T: serde::de::DeserializeOwned>(
        &self,
        cancellation: &Cancellation,
        key: &str,
    ) -> Result<T, MetadataError> {
        let conn = self.pool.acquire(cancellation).await?;

        let content: String = conn
            .raw()
            .query_row("select value from meta where key = ?1", [key], |row| {
                row.get(0)
            })
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => MetadataError::NoSuchKey,
                other => {
                    MetadataError::Other(anyhow::Error::new(other).context("reading a setting"))
                }
            })?;

        serde_json::from_str(&content)
            .context(format!("setting '{key}' holds malformed JSON"))
            .map_err(MetadataError::Other)
    }
}

/// Direct, synchronous write access. Owned by the serial write runner.
pub struct Writer {
    rw: RwConn,
}

impl Writer {
    fn store_json(&mut self, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        self.rw
            .raw()
            .execute(
                "insert into meta(key, value) values (?1, ?2)
                 on conflict(key) do update set value = excluded.value",
                rusqlite::params![key, value.to_string()],
            )
            .context(format!("storing setting '{key}'"))?;

        Ok(())
    }
}

struct StoreRequest {
    key: String,
    value: serde_json::Value,
    ack: tokio::sync::oneshot::Sender<anyhow::Result<()>>,
}

/// Front of the serialised write path: cheap to clone, awaits the ack of
/// the single writer task.
#[derive(Clone)]
pub struct AsyncWriter {
    tx: tokio::sync::mpsc::UnboundedSender<StoreRequest>,
}

impl AsyncWriter {
    /// Store `value` (serialized as JSON) under `key`.
    ///
    /// # Errors
    ///
    /// * serialization failure, writer gone, or the write itself failed
    pub async fn store_json<T: serde::Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let value = serde_json::to_value(value).context("serializing a setting")?;

        let (ack, ack_rx) = tokio::sync::oneshot::channel();

        self.tx
            .send(StoreRequest {
                key: key.to_string(),
                value,
                ack,
            })
            .ok()
            .context("the settings writer is gone")?;

        ack_rx.await.context("the settings writer dropped the request")?
    }
}

/// Owns the only mutation path of the `master` database, applying writes
/// strictly in arrival order.
pub struct SerialWriteRunner {
    writer: AsyncWriter,
}

impl SerialWriteRunner {
    /// Spawn the writer task on the current runtime.
    #[must_use]
    pub fn spawn(rw: RwConn) -> (Self, RunnerHandle) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<StoreRequest>();
        let mut writer = Writer { rw };

        let handle = runner::spawn("settings-writer", move |cancellation| async move {
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(request) => {
                            let result = writer.store_json(&request.key, &request.value);
                            let _ = request.ack.send(result);
                        }
                        None => return Ok(()),
                    },
                    () = cancellation.cancelled() => {
                        rx.close();

                        while let Ok(request) = rx.try_recv() {
                            let result = writer.store_json(&request.key, &request.value);
                            let _ = request.ack.send(result);
                        }

                        return Ok(());
                    }
                }
            }
        });

        (
            Self {
                writer: AsyncWriter { tx },
            },
            handle,
        )
    }

    /// The async front of this runner.
    #[must_use]
    pub fn writer(&self) -> AsyncWriter {
        self.writer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dbconn, migrator};

    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    struct DemoSettings {
        enabled: bool,
        name: String,
    }

    #[tokio::test]
    async fn values_round_trip_through_the_serial_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.db");
        let mut pair = dbconn::open(&path, 2).unwrap();
        migrator::run(&mut pair.rw, "master").unwrap();

        let (runner, handle) = SerialWriteRunner::spawn(pair.rw);
        let writer = runner.writer();
        let reader = Reader::new(pair.ro.clone());

        let settings = DemoSettings {
            enabled: true,
            name: "alice".into(),
        };

        writer.store_json("demo", &settings).await.unwrap();

        let read: DemoSettings = reader
            .retrieve_json(&Cancellation::none(), "demo")
            .await
            .unwrap();
        assert_eq!(read, settings);

        // overwrite wins
        writer
            .store_json(
                "demo",
                &DemoSettings {
                    enabled: false,
                    name: "alice".into(),
                },
            )
            .await
            .unwrap();

        let read: DemoSettings = reader
            .retrieve_json(&Cancellation::none(), "demo")
            .await
            .unwrap();
        assert!(!read.enabled);

        handle.cancel();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn missing_keys_are_reported_as_such() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.db");
        let mut pair = dbconn::open(&path, 1).unwrap();
        migrator::run(&mut pair.rw, "master").unwrap();

        let reader = Reader::new(pair.ro.clone());

        assert!(matches!(
            reader
                .retrieve_json::<DemoSettings>(&Cancellation::none(), "absent")
                .await,
            Err(MetadataError::NoSuchKey)
        ));
    }
}
