//! Parent/directory resolution for inserted file rows.
//!
//! Every non-root file path must have a directory row for its containing
//! folder, created lazily on first reference. The path -> id cache lives
//! behind the single directory lock that callers hold for the extent of
//! their transaction, so two concurrent inserts can never both decide to
//! create the same new directory row (and the cache cannot deadlock
//! against a surrounding multi-row transaction).

use crate::volumes::MediaType;
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Parent id of rows that sit directly in a volume root.
pub const ROOT_PARENT: i64 = 0;

/// Path -> directory-row-id cache for one volume. Guarded externally by
/// the store's directory lock.
#[derive(Debug, Default)]
pub struct DirectoryCache {
    by_path: HashMap<String, i64>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wholesale invalidation after row removals; the delete path cannot
    /// tell which directories went away.
    pub fn clear(&mut self) {
        self.by_path.clear();
    }
}

/// Resolve the parent id for `path`, lazily inserting directory rows for
/// the containing folder chain. `volume_roots` are absolute mount points;
/// a file directly under a root gets parent 0.
pub fn resolve_parent(
    conn: &Connection,
    cache: &mut DirectoryCache,
    volume_roots: &[String],
    path: &str,
) -> Result<i64> {
    let Some(folder) = containing_folder(path) else {
        return Ok(ROOT_PARENT);
    };
    if is_volume_root(volume_roots, folder) {
        return Ok(ROOT_PARENT);
    }
    directory_id(conn, cache, volume_roots, folder)
}

fn directory_id(
    conn: &Connection,
    cache: &mut DirectoryCache,
    volume_roots: &[String],
    folder: &str,
) -> Result<i64> {
    let cache_key = folder.to_lowercase();
    if let Some(&id) = cache.by_path.get(&cache_key) {
        return Ok(id);
    }

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM files WHERE path = ?1",
            params![folder],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        cache.by_path.insert(cache_key, id);
        return Ok(id);
    }

    // Lazily materialize the whole chain up to the volume root.
    let grandparent = match containing_folder(folder) {
        Some(above) if !is_volume_root(volume_roots, above) => {
            directory_id(conn, cache, volume_roots, above)?
        }
        _ => ROOT_PARENT,
    };

    let display_name = folder.rsplit('/').next().unwrap_or(folder);
    conn.execute(
        "INSERT INTO files (path, parent, media_type, display_name) VALUES (?1, ?2, ?3, ?4)",
        params![
            folder,
            grandparent,
            MediaType::Directory.as_int(),
            display_name
        ],
    )?;
    let id = conn.last_insert_rowid();
    cache.by_path.insert(cache_key, id);
    Ok(id)
}

fn containing_folder(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let index = trimmed.rfind('/')?;
    if index == 0 {
        None
    } else {
        Some(&trimmed[..index])
    }
}

fn is_volume_root(volume_roots: &[String], folder: &str) -> bool {
    volume_roots
        .iter()
        .any(|root| root.trim_end_matches('/').eq_ignore_ascii_case(folder))
}

/// Folder-derived grouping: hashed bucket id plus the literal folder name
/// for display. Derived from the lower-cased containing folder so casing
/// differences land in one bucket.
pub fn bucket_for(path: &str) -> Option<(String, String)> {
    let folder = containing_folder(path)?;
    let lowered = folder.to_lowercase();
    let digest = Sha256::digest(lowered.as_bytes());
    let mut id = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        id.push_str(&format!("{:02x}", byte));
    }
    let display = folder.rsplit('/').next().unwrap_or(folder).to_string();
    Some((id, display))
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

    fn roots() -> Vec<String> {
        vec!["/storage/emulated/0".to_string()]
    }

    #[test]
    fn file_under_root_has_parent_zero() {
        let conn = conn();
        let mut cache = DirectoryCache::new();
        let parent =
            resolve_parent(&conn, &mut cache, &roots(), "/storage/emulated/0/a.jpg").unwrap();
        assert_eq!(parent, ROOT_PARENT);
    }

    #[test]
    fn directory_rows_materialize_lazily() {
        let conn = conn();
        let mut cache = DirectoryCache::new();
        let parent = resolve_parent(
            &conn,
            &mut cache,
            &roots(),
            "/storage/emulated/0/DCIM/Camera/img.jpg",
        )
        .unwrap();
        assert!(parent > 0);

        let (path, media_type): (String, i64) = conn
            .query_row(
                "SELECT path, media_type FROM files WHERE id = ?1",
                params![parent],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(path, "/storage/emulated/0/DCIM/Camera");
        assert_eq!(media_type, MediaType::Directory.as_int());

        // The chain above it exists too, rooted at parent 0.
        let dcim_parent: i64 = conn
            .query_row(
                "SELECT parent FROM files WHERE path = '/storage/emulated/0/DCIM'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(dcim_parent, ROOT_PARENT);
    }

    #[test]
    fn second_file_reuses_directory_row() {
        let conn = conn();
        let mut cache = DirectoryCache::new();
        let first = resolve_parent(
            &conn,
            &mut cache,
            &roots(),
            "/storage/emulated/0/Music/a.mp3",
        )
        .unwrap();
        let second = resolve_parent(
            &conn,
            &mut cache,
            &roots(),
            "/storage/emulated/0/Music/b.mp3",
        )
        .unwrap();
        assert_eq!(first, second);
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM files WHERE path = '/storage/emulated/0/Music'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn cold_cache_finds_existing_row() {
        let conn = conn();
        let mut cache = DirectoryCache::new();
        let first = resolve_parent(
            &conn,
            &mut cache,
            &roots(),
            "/storage/emulated/0/Music/a.mp3",
        )
        .unwrap();
        let mut cold = DirectoryCache::new();
        let second = resolve_parent(
            &conn,
            &mut cold,
            &roots(),
            "/storage/emulated/0/Music/b.mp3",
        )
        .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn bucket_groups_case_insensitively() {
        let (bucket_a, display_a) = bucket_for("/storage/emulated/0/DCIM/Camera/a.jpg").unwrap();
        let (bucket_b, display_b) = bucket_for("/storage/emulated/0/dcim/camera/b.jpg").unwrap();
        assert_eq!(bucket_a, bucket_b);
        assert_eq!(display_a, "Camera");
        assert_eq!(display_b, "camera");
    }
}
