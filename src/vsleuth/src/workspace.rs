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
use anyhow::Context;
use vsleuth_common::runner::{self, Cancellation, CombinedRunner, RunnerHandle};
use vsleuth_common::{ComposedPublisher, SumPair};
use vsleuth_config::Config;
use vsleuth_detective::{Detective, SqlDetective};
use vsleuth_ingest::{DirectoryImporter, FsDirectoryContent, ImportAnnouncer, LogPatterns};
use vsleuth_parser::timeutil::WallClock;
use vsleuth_store::{deliverydb, metadata, rawlogsdb, workspace as dbworkspace};
use vsleuth_tracking::{Filters, Tracker};

/// Announces import progress into the service log.
struct LoggingAnnouncer;

impl ImportAnnouncer for LoggingAnnouncer {
    fn start(&self, time: Option<time::OffsetDateTime>) {
        tracing::info!(?time, "started importing the log backlog");
    }

    fn step(&self, time: Option<time::OffsetDateTime>) {
        tracing::debug!(?time, "finished importing one log file");
    }

    fn end(&self, time: Option<time::OffsetDateTime>) {
        tracing::info!(?time, "finished importing the log backlog");
    }
}

/// The assembled service: storage, pipeline, query engine.
pub struct Workspace {
    /// the forensic query engine.
    pub detective: std::sync::Arc<dyn Detective>,
    /// read access to the settings store.
    pub settings_reader: metadata::Reader,
    /// the serialised settings write path.
    pub settings_writer: metadata::AsyncWriter,
    importer: Option<RunnerHandle>,
    runners: CombinedRunner,
}

fn high_water(
    rawlogs_sum: SumPair,
    tracker_time: Option<time::OffsetDateTime>,
    deliveries_time: Option<time::OffsetDateTime>,
) -> SumPair {
    // when raw logs carry a checksum, it is the authoritative marker
    if rawlogs_sum.sum.is_some() {
        return rawlogs_sum;
    }

    // otherwise (a workspace from before raw lines were stored) fall
    // back to the most recent time the other stores know about
    let most_recent = [tracker_time, deliveries_time]
        .into_iter()
        .flatten()
        .max();

    SumPair {
        time: most_recent,
        sum: None,
    }
}

impl Workspace {
    /// Open the databases and spawn the whole pipeline on the current
    /// runtime.
    ///
    /// # Errors
    ///
    /// * a database fails to open or migrate
    /// * the settings or filter configuration is malformed
    pub async fn new(config: &Config, follow: bool) -> anyhow::Result<Self> {
        let mut databases = dbworkspace::open(
            &config.workspace.directory,
            config.workspace.pool_size,
        )?;

        let instance_id = dbworkspace::instance_id(&mut databases.master)?;
        tracing::info!(instance_id, "workspace is open");

        let settings_reader = metadata::Reader::new(databases.master.ro.clone());
        let (settings_runner, settings_handle) =
            metadata::SerialWriteRunner::spawn(databases.master.rw);
        let settings_writer = settings_runner.writer();

        let filters = build_filters(&settings_reader).await?;

        let retention = config.retention();

        let rawlogs_accessor = std::sync::Arc::new(
            rawlogsdb::SqlAccessor::new(databases.rawlogs.ro.clone()).await?,
        );

        let rawlogs_sum = rawlogsdb::most_recent_log_time_and_sum(
            &databases.rawlogs.ro,
            &Cancellation::none(),
        )
        .await?;

        let tracker_time = vsleuth_tracking::most_recent_log_time(
            &databases.logtracker.ro,
            &Cancellation::none(),
        )
        .await?;

        let deliveries_time =
            deliverydb::most_recent_log_time(&databases.logs.ro, &Cancellation::none()).await?;

        let sum = high_water(rawlogs_sum, tracker_time, deliveries_time);

        match sum.time {
            Some(time) => tracing::info!(%time, "importing the log directory from the last ingested line"),
            None => tracing::info!("start importing the log directory into a new workspace"),
        }

        let (rawlogs_db, rawlogs_handle) = rawlogsdb::RawLogsDb::spawn(
            databases.rawlogs.rw,
            rawlogsdb::Options { retention },
        );

        let (deliveries, deliveries_handle) = deliverydb::DeliveryDb::spawn(
            databases.logs.rw,
            deliverydb::Options { retention },
        );

        let (tracker, tracker_handle) = Tracker::spawn(
            databases.logtracker.rw,
            Box::new(deliveries.results_publisher()),
            filters,
        );

        let logs_runner = runner::dependant_pair(tracker_handle, deliveries_handle);

        let detective: std::sync::Arc<dyn Detective> = std::sync::Arc::new(
            SqlDetective::new(databases.logs.ro.clone(), rawlogs_accessor).await?,
        );

        let importer_handle = spawn_importer(
            config,
            sum,
            follow,
            ComposedPublisher::new(vec![
                Box::new(tracker.publisher()),
                Box::new(rawlogs_db.publisher()),
            ]),
        );

        Ok(Self {
            detective,
            settings_reader,
            settings_writer,
            importer: Some(importer_handle),
            runners: CombinedRunner::new(vec![settings_handle, rawlogs_handle, logs_runner]),
        })
    }

    /// Wait for the importer to finish on its own (import-only mode).
    ///
    /// # Errors
    ///
    /// The importer's error, if it failed.
    pub async fn join_importer(&mut self) -> anyhow::Result<()> {
        match self.importer.take() {
            Some(handle) => handle.join().await,
            None => Ok(()),
        }
    }

    /// Stop every component, most upstream first, draining in-flight
    /// records into the stores.
    ///
    /// # Errors
    ///
    /// The first component error observed.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        let importer_result = match self.importer.take() {
            Some(handle) => {
                handle.cancel();
                handle.join().await
            }
            None => Ok(()),
        };

        let downstream_result = self.runners.shutdown().await;

        importer_result.and(downstream_result)
    }
}

async fn build_filters(reader: &metadata::Reader) -> anyhow::Result<Filters> {
    let settings: vsleuth_tracking::Settings = match reader
        .retrieve_json(&Cancellation::none(), vsleuth_tracking::SETTINGS_KEY)
        .await
    {
        Ok(settings) => settings,
        Err(metadata::MetadataError::NoSuchKey) => return Ok(Filters::none()),
        Err(metadata::MetadataError::Other(e)) => {
            return Err(e.context("reading the tracking settings"))
        }
    };

    Filters::build(&settings.filters).context("compiling the tracking filters")
}

fn spawn_importer(
    config: &Config,
    sum: SumPair,
    follow: bool,
    mut publisher: ComposedPublisher,
) -> RunnerHandle {
    if config.logs.rsynced {
        // replaced (rather than appended-to) current files are handled
        // by the watcher's shrink detection; worth knowing it is on
        tracing::info!("the log directory is rsync'd, expecting files to be replaced under us");
    }

    let importer = DirectoryImporter::new(
        std::sync::Arc::new(FsDirectoryContent::new(config.logs.directory.clone())),
        sum,
        LogPatterns::new(config.logs.patterns.clone()),
        std::sync::Arc::new(WallClock),
        std::sync::Arc::new(LoggingAnnouncer),
    );

    runner::spawn("dir-importer", move |cancellation| async move {
        if follow {
            importer.run(&mut publisher, cancellation).await
        } else {
            importer.import_only(&mut publisher, cancellation).await
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use vsleuth_common::Checksum;

    #[test]
    fn the_rawlogs_checksum_is_the_authoritative_high_water() {
        let rawlogs = SumPair {
            time: Some(datetime!(2021-03-08 10:11:12 UTC)),
            sum: Some(Checksum(42)),
        };

        assert_eq!(
            high_water(rawlogs, Some(datetime!(2021-03-09 00:00:00 UTC)), None),
            rawlogs
        );
    }

    #[test]
    fn without_checksums_the_most_recent_store_time_wins() {
        let sum = high_water(
            SumPair::zero(),
            Some(datetime!(2021-03-07 00:00:00 UTC)),
            Some(datetime!(2021-03-08 00:00:00 UTC)),
        );

        assert_eq!(sum.time, Some(datetime!(2021-03-08 00:00:00 UTC)));
        assert_eq!(sum.sum, None);
    }

    #[tokio::test]
    async fn a_fresh_workspace_assembles_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let logs_dir = dir.path().join("logs");
        std::fs::create_dir_all(&logs_dir).unwrap();
        std::fs::write(
            logs_dir.join("mail.log"),
            "Jan  3 06:25:07 cloud2 postfix/pickup[25779]: DD78F3E8C1: uid=0 from=<root>\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.workspace.directory = dir.path().join("workspace");
        config.logs.directory = logs_dir;

        let mut workspace = Workspace::new(&config, false).await.unwrap();

        // the import-only run finishes on its own; shutdown drains the rest
        workspace.join_importer().await.unwrap();
        workspace.shutdown().await.unwrap();
    }
}
