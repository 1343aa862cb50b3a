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
use vsleuth_common::runner::Cancellation;

/// The single writable handle of one database.
///
/// There is exactly one per database file; every mutation goes through
/// the task that owns it.
pub struct RwConn(rusqlite::Connection);

impl RwConn {
    /// Run `f` inside a transaction, committing on success.
    ///
    /// # Errors
    ///
    /// * the transaction could not be opened or committed
    /// * whatever `f` fails with (the transaction is rolled back)
    pub fn tx<T>(
        &mut self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let tx = self.0.transaction().context("cannot open a transaction")?;
        let value = f(&tx)?;
        tx.commit().context("cannot commit the transaction")?;

        Ok(value)
    }

    /// Direct access for migrations and one-off statements.
    #[must_use]
    pub fn raw(&self) -> &rusqlite::Connection {
        &self.0
    }

    /// Mutable access, needed by [`rusqlite::Connection::transaction`].
    #[must_use]
    pub fn raw_mut(&mut self) -> &mut rusqlite::Connection {
        &mut self.0
    }
}

/// One pooled read-only handle carrying its keyed prepared statements.
pub struct RoPooledConn {
    /// position of this handle in the pool, for diagnostics.
    pub local_id: usize,
    conn: rusqlite::Connection,
    statements: std::collections::HashMap<&'static str, String>,
}

impl RoPooledConn {
    /// Register a statement under `key`, validating it now.
    ///
    /// # Errors
    ///
    /// * the SQL does not prepare
    ///
    /// # Panics
    ///
    /// Registering the same key twice is a programmer error.
    pub fn prepare(&mut self, key: &'static str, sql: &str) -> anyhow::Result<()> {
        assert!(
            !self.statements.contains_key(key),
            "a prepared statement for '{key}' already exists"
        );

        self.conn
            .prepare_cached(sql)
            .context(format!("preparing statement '{key}'"))?;

        self.statements.insert(key, sql.to_string());

        Ok(())
    }

    /// The statement registered under `key`. The handle owns it; callers
    /// use it and let it go back to the cache.
    ///
    /// # Panics
    ///
    /// An unknown key is a programmer error: it means the pool was built
    /// without the statement this code path relies on.
    #[must_use]
    pub fn stmt(&self, key: &'static str) -> rusqlite::CachedStatement<'_> {
        let sql = self
            .statements
            .get(key)
            .unwrap_or_else(|| panic!("sql statement with key '{key}' not registered"));

        self.conn
            .prepare_cached(sql)
            .expect("statement was validated when the pool was built")
    }

    /// Direct read access for ad-hoc queries.
    #[must_use]
    pub fn raw(&self) -> &rusqlite::Connection {
        &self.conn
    }

    /// A handle that can abort a statement running on this connection
    /// from another thread.
    #[must_use]
    pub fn interrupt_handle(&self) -> rusqlite::InterruptHandle {
        self.conn.get_interrupt_handle()
    }
}

/// A fixed-size pool of read-only handles.
///
/// Handles travel through a channel: acquiring takes one out, dropping
/// the guard puts it back.
pub struct RoPool {
    size: usize,
    tx: tokio::sync::mpsc::Sender<RoPooledConn>,
    rx: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<RoPooledConn>>,
}

/// Scoped access to one pooled handle; returns it to the pool on drop.
pub struct RoPoolGuard {
    conn: Option<RoPooledConn>,
    tx: tokio::sync::mpsc::Sender<RoPooledConn>,
}

impl std::ops::Deref for RoPoolGuard {
    type Target = RoPooledConn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("present until dropped")
    }
}

impl Drop for RoPoolGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // capacity equals the pool size, the send cannot be refused
            let _ = self.tx.try_send(conn);
        }
    }
}

impl RoPool {
    /// Number of handles in the pool.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Run `setup` once on every handle, before the pool is in use.
    /// Components register their prepared statements here.
    ///
    /// # Errors
    ///
    /// The first setup failure.
    pub async fn for_each(
        &self,
        mut setup: impl FnMut(&mut RoPooledConn) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let mut rx = self.rx.lock().await;
        let mut conns = Vec::with_capacity(self.size);

        for _ in 0..self.size {
            let conn = rx
                .try_recv()
                .context("pool handles are busy during setup")?;
            conns.push(conn);
        }

        let mut result = Ok(());

        for conn in &mut conns {
            if result.is_ok() {
                result = setup(conn);
            }
        }

        for conn in conns {
            let _ = self.tx.try_send(conn);
        }

        result
    }

    /// Take one handle out of the pool, waiting until one is free or the
    /// cancellation fires.
    ///
    /// # Errors
    ///
    /// * cancelled while waiting
    pub async fn acquire(&self, cancellation: &Cancellation) -> anyhow::Result<RoPoolGuard> {
        let mut rx = self.rx.lock().await;

        tokio::select! {
            conn = rx.recv() => {
                let conn = conn.context("the read pool is closed")?;

                Ok(RoPoolGuard {
                    conn: Some(conn),
                    tx: self.tx.clone(),
                })
            }
            () = cancellation.cancelled() => {
                anyhow::bail!("cancelled while waiting for a read connection")
            }
        }
    }
}

fn open_ro_conn(path: &std::path::Path, local_id: usize) -> anyhow::Result<RoPooledConn> {
    use rusqlite::OpenFlags;

    let conn = rusqlite::Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_PRIVATE_CACHE
            | OpenFlags::SQLITE_OPEN_URI,
    )
    .context(format!("opening '{}' read-only", path.display()))?;

    conn.pragma_update(None, "query_only", "ON")
        .context("setting query_only")?;
    conn.pragma_update(None, "synchronous", "OFF")
        .context("setting synchronous")?;

    Ok(RoPooledConn {
        local_id,
        conn,
        statements: std::collections::HashMap::new(),
    })
}

/// Open the read-only pool of one database.
///
/// # Errors
///
/// * a connection cannot be opened or configured
pub fn open_ro(path: &std::path::Path, size: usize) -> anyhow::Result<RoPool> {
    let (tx, rx) = tokio::sync::mpsc::channel(size);

    for local_id in 0..size {
        tx.try_send(open_ro_conn(path, local_id)?)
            .ok()
            .context("pool channel sized to the pool")?;
    }

    Ok(RoPool {
        size,
        tx,
        rx: tokio::sync::Mutex::new(rx),
    })
}

/// Open the single writable handle of one database, creating the file if
/// needed.
///
/// # Errors
///
/// * the file cannot be opened or configured
pub fn open_rw(path: &std::path::Path) -> anyhow::Result<RwConn> {
    use rusqlite::OpenFlags;

    let conn = rusqlite::Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_PRIVATE_CACHE
            | OpenFlags::SQLITE_OPEN_URI,
    )
    .context(format!("opening '{}' read-write", path.display()))?;

    // five seconds of busy timeout, so concurrent writers wait for each
    // other instead of failing with "database is busy"
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("setting busy timeout")?;

    let journal_mode: String = conn
        .query_row("pragma journal_mode = WAL", [], |row| row.get(0))
        .context("switching to WAL")?;
    anyhow::ensure!(
        journal_mode.eq_ignore_ascii_case("wal"),
        "unexpected journal mode '{journal_mode}'"
    );

    conn.pragma_update(None, "synchronous", "OFF")
        .context("setting synchronous")?;

    Ok(RwConn(conn))
}

/// The writer and the read pool of one database file.
pub struct PooledPair {
    /// the only mutation path.
    pub rw: RwConn,
    /// shared read access.
    pub ro: std::sync::Arc<RoPool>,
    /// the underlying file.
    pub filename: std::path::PathBuf,
}

/// Open a database with its writer and a read pool of `pool_size`.
///
/// # Errors
///
/// * see [`open_rw`] and [`open_ro`]
pub fn open(path: &std::path::Path, pool_size: usize) -> anyhow::Result<PooledPair> {
    let rw = open_rw(path)?;
    let ro = open_ro(path, pool_size)?;

    Ok(PooledPair {
        rw,
        ro: std::sync::Arc::new(ro),
        filename: path.to_path_buf(),
    })
}
