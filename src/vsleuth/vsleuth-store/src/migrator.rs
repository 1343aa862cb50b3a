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
use crate::dbconn::RwConn;
use anyhow::Context;

/// One schema step. Migrations are append-only: released versions are
/// never edited, only followed.
pub struct Migration {
    /// strictly increasing within one database.
    pub version: i64,
    /// the DDL to apply.
    pub up: &'static str,
}

const LOGS_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up: r"
create table queues(
    id integer primary key,
    name text not null unique
);

create table messageids(
    id integer primary key,
    value text not null unique
);

create table messageids_replies(
    id integer primary key,
    original_id integer not null,
    reply_id integer not null,
    unique(original_id, reply_id)
);

create table remote_domains(
    id integer primary key,
    domain text not null unique
);

create table next_relays(
    id integer primary key,
    hostname text not null,
    port integer,
    unique(hostname, port)
);

create table deliveries(
    id integer primary key,
    delivery_ts integer not null,
    status integer not null,
    dsn text not null,
    direction integer not null,
    sender_local_part text not null,
    sender_domain_part_id integer not null,
    recipient_local_part text not null,
    recipient_domain_part_id integer not null,
    message_id integer not null,
    next_relay_id integer
);

create index deliveries_ts_index on deliveries(delivery_ts);

create table delivery_queue(
    id integer primary key,
    delivery_id integer not null,
    queue_id integer not null
);

create index delivery_queue_delivery_index on delivery_queue(delivery_id);
create index delivery_queue_queue_index on delivery_queue(queue_id);

create table expired_queues(
    id integer primary key,
    queue_id integer not null unique,
    expired_ts integer not null
);

create table queue_parenting(
    id integer primary key,
    parent_queue_id integer not null,
    child_queue_id integer not null,
    unique(parent_queue_id, child_queue_id)
);

create table log_lines_ref(
    id integer primary key,
    delivery_id integer not null,
    time integer not null,
    checksum integer not null
);

create index log_lines_ref_delivery_index on log_lines_ref(delivery_id);
",
}];

const RAWLOGS_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up: r"
create table log_lines(
    id integer primary key,
    time integer not null,
    checksum integer not null,
    content text not null,
    unique(time, checksum)
);

create index log_lines_time_index on log_lines(time);
",
}];

const LOGTRACKER_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up: r"
create table tracker_state(
    key text primary key,
    value integer not null
);
",
}];

const MASTER_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up: r"
create table meta(
    key text primary key,
    value text not null
);
",
}];

fn migrations_for(database: &str) -> &'static [Migration] {
    match database {
        "logs" => LOGS_MIGRATIONS,
        "rawlogs" => RAWLOGS_MIGRATIONS,
        "logtracker" => LOGTRACKER_MIGRATIONS,
        "master" => MASTER_MIGRATIONS,
        // databases owned by out-of-scope collaborators carry only the
        // migrations table until their schemas move in
        _ => &[],
    }
}

/// Bring `database` up to its latest schema.
///
/// # Errors
///
/// * a migration step fails (the step is rolled back)
pub fn run(conn: &mut RwConn, database: &str) -> anyhow::Result<()> {
    conn.raw()
        .execute_batch("create table if not exists migrations(version integer primary key, applied_at integer not null)")
        .context("creating the migrations table")?;

    let current: i64 = conn
        .raw()
        .query_row("select coalesce(max(version), 0) from migrations", [], |row| {
            row.get(0)
        })
        .context("reading the schema version")?;

    for migration in migrations_for(database) {
        if migration.version <= current {
            continue;
        }

        tracing::info!(database, version = migration.version, "applying migration");

        conn.tx(|tx| {
            tx.execute_batch(migration.up)
                .context(format!("migration {} of '{database}'", migration.version))?;

            tx.execute(
                "insert into migrations(version, applied_at) values (?1, ?2)",
                rusqlite::params![
                    migration.version,
                    time::OffsetDateTime::now_utc().unix_timestamp()
                ],
            )
            .context("recording the migration")?;

            Ok(())
        })?;
    }

    Ok(())
}
