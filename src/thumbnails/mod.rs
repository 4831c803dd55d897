//! Thumbnail rows and their backing files.
//!
//! A thumbnail row belongs to exactly one image or video row and dies with
//! it. Bitmap generation is delegated to an injected [`ThumbnailCodec`];
//! this module owns the row lifecycle and the on-disk file naming, and
//! [`worker`] owns scheduling.

pub mod worker;

pub use worker::{ThumbnailRequest, ThumbnailService, ThumbnailWorker};

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Produces a thumbnail file for a media file. Decoding and recompression
/// happen behind this seam; implementations live outside this crate.
pub trait ThumbnailCodec: Send + Sync {
    /// Generate a thumbnail of `source` at `output`, returning the
    /// resulting dimensions.
    fn generate(&self, source: &Path, output: &Path) -> Result<(u32, u32)>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRow {
    pub id: i64,
    pub path: String,
    pub source_id: i64,
    pub kind: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

/// On-disk location for a source row's thumbnail. Volume-qualified so two
/// volumes never collide in the shared thumbnail directory.
pub fn thumbnail_path(thumbnails_dir: &Path, volume: &str, source_id: i64) -> PathBuf {
    thumbnails_dir.join(format!("{}-{}.thumb", volume, source_id))
}

pub fn find_by_source(conn: &Connection, source_id: i64) -> Result<Option<ThumbnailRow>> {
    let row = conn
        .query_row(
            "SELECT id, path, source_id, kind, width, height \
             FROM thumbnails WHERE source_id = ?1",
            params![source_id],
            |row| {
                Ok(ThumbnailRow {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    source_id: row.get(2)?,
                    kind: row.get(3)?,
                    width: row.get(4)?,
                    height: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn record(
    conn: &Connection,
    source_id: i64,
    kind: i64,
    path: &str,
    width: u32,
    height: u32,
) -> Result<ThumbnailRow> {
    // One row per source; a regeneration replaces the old row.
    conn.execute(
        "DELETE FROM thumbnails WHERE source_id = ?1",
        params![source_id],
    )?;
    conn.execute(
        "INSERT INTO thumbnails (path, source_id, kind, width, height) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![path, source_id, kind, width, height],
    )?;
    Ok(ThumbnailRow {
        id: conn.last_insert_rowid(),
        path: path.to_string(),
        source_id,
        kind,
        width: Some(width as i64),
        height: Some(height as i64),
    })
}

/// Delete the thumbnail rows for `source_ids` along with their backing
/// files. File removal failures are logged and skipped; the rows go
/// regardless so the index never points at files it no longer owns.
pub fn delete_for_sources(conn: &Connection, source_ids: &[i64]) -> Result<usize> {
    let mut removed = 0;
    for source_id in source_ids {
        let paths: Vec<String> = {
            let mut stmt =
                conn.prepare("SELECT path FROM thumbnails WHERE source_id = ?1")?;
            let mapped = stmt.query_map(params![source_id], |row| row.get(0))?;
            mapped.collect::<std::result::Result<_, _>>()?
        };
        for path in paths {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove thumbnail file '{}': {}", path, e);
                }
            }
        }
        removed += conn.execute(
            "DELETE FROM thumbnails WHERE source_id = ?1",
            params![source_id],
        )?;
    }
    Ok(removed)
}

/// All thumbnail file paths currently referenced by rows. Used by the
/// maintenance sweep to spot orphaned files on disk.
pub fn referenced_paths(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT path FROM thumbnails")?;
    let mapped = stmt.query_map([], |row| row.get(0))?;
    Ok(mapped.collect::<std::result::Result<_, _>>()?)
}

/// Delete thumbnail rows whose source row no longer exists, removing their
/// backing files too.
pub fn delete_orphan_rows(conn: &Connection) -> Result<usize> {
    let orphans: Vec<i64> = {
        let mut stmt = conn.prepare(
            "SELECT source_id FROM thumbnails \
             WHERE source_id NOT IN (SELECT id FROM files)",
        )?;
        let mapped = stmt.query_map([], |row| row.get(0))?;
        mapped.collect::<std::result::Result<_, _>>()?
    };
    delete_for_sources(conn, &orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volumes::schema::latest_schema;
    use rusqlite::Connection;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        latest_schema().create(&conn).unwrap();
        conn
    }

    #[test]
    fn record_replaces_previous_row() {
        let conn = conn();
        record(&conn, 7, 1, "/t/a.thumb", 96, 96).unwrap();
        let second = record(&conn, 7, 1, "/t/b.thumb", 128, 128).unwrap();
        let found = find_by_source(&conn, 7).unwrap().unwrap();
        assert_eq!(found.id, second.id);
        assert_eq!(found.path, "/t/b.thumb");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM thumbnails", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn orphan_rows_are_swept() {
        let conn = conn();
        conn.execute(
            "INSERT INTO files (id, path, media_type) VALUES (1, '/p/a.jpg', 1)",
            [],
        )
        .unwrap();
        record(&conn, 1, 1, "/t/live.thumb", 96, 96).unwrap();
        record(&conn, 99, 1, "/t/orphan.thumb", 96, 96).unwrap();

        let removed = delete_orphan_rows(&conn).unwrap();
        assert_eq!(removed, 1);
        assert!(find_by_source(&conn, 1).unwrap().is_some());
        assert!(find_by_source(&conn, 99).unwrap().is_none());
    }

    #[test]
    fn volume_qualified_paths_do_not_collide() {
        let dir = Path::new("/thumbs");
        assert_ne!(
            thumbnail_path(dir, "internal", 5),
            thumbnail_path(dir, "external", 5)
        );
    }
}
