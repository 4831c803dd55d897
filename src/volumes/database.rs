//! A single per-volume database: open, migrate, recover, log.

use super::schema::{latest_schema, MEDIA_VERSIONED_SCHEMAS, MIN_INCREMENTAL_VERSION};
use crate::sqlite_persistence::{drop_everything, BASE_DB_VERSION};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, InterruptHandle, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// One open volume database. Writers serialize on the connection mutex;
/// WAL keeps readers from blocking on in-flight writers in other processes.
pub struct VolumeDatabase {
    volume: String,
    path: PathBuf,
    conn: Mutex<Connection>,
    interrupt: Arc<InterruptHandle>,
    log_limit: usize,
}

impl VolumeDatabase {
    /// Open (creating or migrating as needed) the database file for a
    /// volume. A failed open or migration is treated as schema corruption:
    /// the file is deleted and recreated from scratch, logged, never
    /// surfaced to the caller.
    pub fn open(volume: &str, path: &Path, log_limit: usize) -> Result<Self> {
        let conn = match open_and_migrate(path) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(
                    "Recreating corrupt volume database {:?} for '{}': {:#}",
                    path, volume, e
                );
                delete_database_files(path);
                open_and_migrate(path)
                    .with_context(|| format!("Failed to recreate database {:?}", path))?
            }
        };

        let interrupt = Arc::new(conn.get_interrupt_handle());
        let db = VolumeDatabase {
            volume: volume.to_string(),
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            interrupt,
            log_limit,
        };
        Ok(db)
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock the connection for a (possibly multi-statement) operation.
    /// Callers running transactions hold this guard for their whole extent.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("volume connection poisoned")
    }

    /// Handle for cooperative cancellation of an in-flight query.
    pub fn interrupt_handle(&self) -> Arc<InterruptHandle> {
        self.interrupt.clone()
    }

    /// Schema version of this database (ladder version, not raw
    /// `user_version`).
    pub fn schema_version(&self) -> Result<usize> {
        let conn = self.lock();
        let raw: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        Ok((raw as usize).saturating_sub(BASE_DB_VERSION))
    }

    /// Append to the bounded diagnostic log table, trimming to the most
    /// recent entries.
    pub fn log(&self, tag: &str, message: &str) {
        let conn = self.lock();
        let result = conn
            .execute(
                "INSERT INTO log (tag, message) VALUES (?1, ?2)",
                params![tag, message],
            )
            .and_then(|_| {
                conn.execute(
                    "DELETE FROM log WHERE id NOT IN \
                     (SELECT id FROM log ORDER BY id DESC LIMIT ?1)",
                    params![self.log_limit as i64],
                )
            });
        if let Err(e) = result {
            warn!("Failed to write log entry for '{}': {}", self.volume, e);
        }
    }
}

fn open_and_migrate(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open volume database {:?}", path))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    migrate_if_needed(&mut conn, path)?;
    latest_schema()
        .validate(&conn)
        .context("Schema validation failed after open")?;
    Ok(conn)
}

fn migrate_if_needed(conn: &mut Connection, path: &Path) -> Result<()> {
    let raw_version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

    let latest = latest_schema();

    let table_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    if table_count == 0 {
        info!("Creating media schema v{} in {:?}", latest.version, path);
        latest.create(conn)?;
        return Ok(());
    }

    let current_version = if raw_version < BASE_DB_VERSION as i64 {
        // Not one of ours (or ancient enough to predate version stamping).
        0
    } else {
        raw_version as usize - BASE_DB_VERSION
    };

    if current_version >= latest.version {
        return Ok(());
    }

    if current_version < MIN_INCREMENTAL_VERSION {
        // No incremental steps defined this far back. Discard and recreate;
        // a rescan repopulates the index.
        info!(
            "Volume database {:?} at v{} predates incremental migration, recreating",
            path, current_version
        );
        drop_everything(conn)?;
        latest.create(conn)?;
        log_unlocked(
            conn,
            "schema",
            &format!("recreated at v{} (was v{})", latest.version, current_version),
        );
        return Ok(());
    }

    let tx = conn.transaction()?;
    let mut version = current_version;
    for schema in MEDIA_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
        if let Some(migration_fn) = schema.migration {
            info!(
                "Migrating {:?} from schema v{} to v{}",
                path, version, schema.version
            );
            migration_fn(&tx)?;
            version = schema.version;
        }
    }
    tx.pragma_update(None, "user_version", BASE_DB_VERSION + version)?;
    tx.commit()?;

    log_unlocked(
        conn,
        "schema",
        &format!("migrated v{} -> v{}", current_version, version),
    );
    let _ = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_: &rusqlite::Row| {
        Ok(())
    });
    Ok(())
}

fn log_unlocked(conn: &Connection, tag: &str, message: &str) {
    if let Err(e) = conn.execute(
        "INSERT INTO log (tag, message) VALUES (?1, ?2)",
        params![tag, message],
    ) {
        warn!("Failed to write log entry: {}", e);
    }
}

/// Remove the database file together with its WAL sidecars.
pub fn delete_database_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut target = path.as_os_str().to_owned();
        target.push(suffix);
        let target = PathBuf::from(target);
        if target.exists() {
            if let Err(e) = std::fs::remove_file(&target) {
                warn!("Failed to delete {:?}: {}", target, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_latest_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = VolumeDatabase::open("external_sd", &dir.path().join("abcd-1234.db"), 500).unwrap();
        assert_eq!(db.schema_version().unwrap(), latest_schema().version);
    }

    #[test]
    fn reopen_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abcd-1234.db");
        {
            let db = VolumeDatabase::open("external_sd", &path, 500).unwrap();
            db.lock()
                .execute("INSERT INTO files (path, media_type) VALUES ('/x/a.jpg', 1)", [])
                .unwrap();
        }
        let db = VolumeDatabase::open("external_sd", &path, 500).unwrap();
        let count: i64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn corrupt_file_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abcd-1234.db");
        std::fs::write(&path, b"this is not a sqlite database, not even close").unwrap();
        let db = VolumeDatabase::open("external_sd", &path, 500).unwrap();
        assert_eq!(db.schema_version().unwrap(), latest_schema().version);
    }

    #[test]
    fn ancient_version_recreates_instead_of_migrating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abcd-1234.db");
        {
            // Simulate a pre-ladder database: some table, version 0.
            let conn = Connection::open(&path).unwrap();
            conn.execute("CREATE TABLE relic (id INTEGER PRIMARY KEY)", [])
                .unwrap();
        }
        let db = VolumeDatabase::open("external_sd", &path, 500).unwrap();
        assert_eq!(db.schema_version().unwrap(), latest_schema().version);
        let relic: i64 = db
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'relic'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(relic, 0);
    }

    #[test]
    fn interrupt_handle_is_shareable_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let db = VolumeDatabase::open("external_sd", &dir.path().join("x.db"), 10).unwrap();
        let handle = db.interrupt_handle();
        let second = db.interrupt_handle();
        std::thread::spawn(move || second.interrupt())
            .join()
            .unwrap();
        // Interrupting with nothing in flight is a no-op; the connection
        // stays usable.
        handle.interrupt();
        let count: i64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn log_table_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let db = VolumeDatabase::open("external_sd", &dir.path().join("x.db"), 10).unwrap();
        for i in 0..25 {
            db.log("test", &format!("entry {}", i));
        }
        let count: i64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 10);
        // Most recent entries survive.
        let last: String = db
            .lock()
            .query_row("SELECT message FROM log ORDER BY id DESC LIMIT 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(last, "entry 24");
    }
}
