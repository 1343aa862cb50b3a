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
use crate::dbconn::{self, PooledPair};
use crate::migrator;
use anyhow::Context;

/// Every database of one workspace directory, migrated and opened.
///
/// Core schemas live in `logs`, `logtracker`, `master` and `rawlogs`; the
/// other files belong to out-of-scope collaborators sharing the layout.
pub struct Databases {
    /// operator accounts (collaborator-owned).
    pub auth: PooledPair,
    /// SMTP connection statistics (collaborator-owned).
    pub connections: PooledPair,
    /// insights engine state (collaborator-owned).
    pub insights: PooledPair,
    /// intel collector state (collaborator-owned).
    pub intel_collector: PooledPair,
    /// the normalised delivery store.
    pub logs: PooledPair,
    /// tracker bookkeeping.
    pub logtracker: PooledPair,
    /// settings key/value store.
    pub master: PooledPair,
    /// raw log lines for forensic back-references.
    pub rawlogs: PooledPair,
}

fn open_db(
    directory: &std::path::Path,
    name: &str,
    pool_size: usize,
) -> anyhow::Result<PooledPair> {
    let path = directory.join(format!("{name}.db"));

    let mut pair = dbconn::open(&path, pool_size)
        .context(format!("opening database '{name}' in {}", directory.display()))?;

    migrator::run(&mut pair.rw, name).context(format!("migrating database '{name}'"))?;

    Ok(pair)
}

/// Open (creating if needed) every workspace database.
///
/// # Errors
///
/// * the directory cannot be created
/// * a database fails to open or migrate
pub fn open(directory: &std::path::Path, pool_size: usize) -> anyhow::Result<Databases> {
    std::fs::create_dir_all(directory)
        .context(format!("creating workspace directory {}", directory.display()))?;

    Ok(Databases {
        auth: open_db(directory, "auth", pool_size)?,
        connections: open_db(directory, "connections", pool_size)?,
        insights: open_db(directory, "insights", pool_size)?,
        intel_collector: open_db(directory, "intel-collector", pool_size)?,
        logs: open_db(directory, "logs", pool_size)?,
        logtracker: open_db(directory, "logtracker", pool_size)?,
        master: open_db(directory, "master", pool_size)?,
        rawlogs: open_db(directory, "rawlogs", pool_size)?,
    })
}

/// Read the stable instance id from `master`, creating one on first run.
///
/// # Errors
///
/// * the read or the first-run write fails
pub fn instance_id(master: &mut PooledPair) -> anyhow::Result<String> {
    let existing: Option<String> = master
        .rw
        .raw()
        .query_row(
            "select value from meta where key = 'instance_id'",
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })
        .context("reading the instance id")?;

    if let Some(id) = existing {
        return serde_json::from_str(&id).context("instance id holds malformed JSON");
    }

    let id = uuid::Uuid::new_v4().to_string();

    master
        .rw
        .raw()
        .execute(
            "insert into meta(key, value) values ('instance_id', ?1)",
            [serde_json::to_string(&id).context("serializing the instance id")?],
        )
        .context("storing the instance id")?;

    Ok(id)
}
