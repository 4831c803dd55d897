//! Hidden-path propagation.
//!
//! A `.nomedia` marker file (or a dot-directory) hides everything beneath
//! its directory: affected rows are reclassified to kind none so they stop
//! appearing in any media collection, and their thumbnails are dropped.
//! Removing the marker re-reveals the subtree by scheduling a re-scan;
//! classification is the scanner's job, not ours.

use crate::error::{Error, Result};
use crate::thumbnails;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const NOMEDIA_MARKER: &str = ".nomedia";

/// Re-scan requests raised when a subtree is re-revealed. Supplied by the
/// platform scanner, not implemented here.
pub trait MediaScanner: Send + Sync {
    fn scan_subtree(&self, volume: &str, path: &str);
}

/// A scanner sink for deployments without one; requests are logged and
/// dropped.
pub struct NoOpScanner;

impl MediaScanner for NoOpScanner {
    fn scan_subtree(&self, volume: &str, path: &str) {
        debug!("No scanner registered, dropping re-scan of {}:{}", volume, path);
    }
}

/// The directory a marker path hides, when it is one.
pub fn hidden_directory(marker_path: &str) -> Option<&str> {
    let (folder, name) = marker_path.rsplit_once('/')?;
    if name == NOMEDIA_MARKER {
        Some(folder)
    } else {
        None
    }
}

/// The subtree root a hiding path governs: the parent directory for a
/// `.nomedia` marker file, the path up to and including the first dot-named
/// segment otherwise. Dot segments are only considered below `volume_root`;
/// a mount prefix that itself contains dot-named components must not hide
/// the whole volume. `None` for paths that hide nothing.
pub fn hiding_root(path: &str, volume_root: Option<&str>) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if let Some(folder) = hidden_directory(trimmed) {
        return Some(folder.to_string());
    }
    let (prefix, relative) = match volume_root {
        Some(root) => {
            let root = root.trim_end_matches('/');
            (root, trimmed.strip_prefix(root)?.trim_start_matches('/'))
        }
        None => ("", trimmed),
    };
    let mut end = 0usize;
    for segment in relative.split('/') {
        let start = end;
        end = start + segment.len();
        if segment.len() > 1 && segment.starts_with('.') {
            let sub = &relative[..end];
            return Some(if prefix.is_empty() {
                sub.to_string()
            } else {
                format!("{}/{}", prefix, sub)
            });
        }
        end += 1;
    }
    None
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct HideOutcome {
    pub rows_hidden: usize,
    pub thumbnails_removed: usize,
}

fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Reclassify every media row under `directory` to kind none. Thumbnail
/// rows and files of affected image/video rows go first so nothing keeps
/// serving a thumbnail for content that is no longer visible.
pub fn hide_subtree(conn: &Connection, directory: &str) -> Result<HideOutcome> {
    let pattern = format!("{}/%", escape_like(directory.trim_end_matches('/')));

    let visual_ids: Vec<i64> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM files \
             WHERE path LIKE ?1 ESCAPE '\\' AND media_type IN (1, 3)",
        )?;
        let mapped = stmt.query_map(params![pattern], |row| row.get(0))?;
        mapped.collect::<std::result::Result<_, _>>()?
    };
    let thumbnails_removed =
        thumbnails::delete_for_sources(conn, &visual_ids).map_err(Error::Internal)?;

    // Directory rows keep their kind; they are structure, not content.
    let rows_hidden = conn.execute(
        "UPDATE files SET media_type = 0 \
         WHERE path LIKE ?1 ESCAPE '\\' AND media_type NOT IN (0, 5)",
        params![pattern],
    )?;

    info!(
        "Hid {} rows under '{}' ({} thumbnails removed)",
        rows_hidden, directory, thumbnails_removed
    );
    Ok(HideOutcome {
        rows_hidden,
        thumbnails_removed,
    })
}

/// Wait for a marker file to become visible on disk. Filesystem events can
/// race ahead of the file itself, so the check is retried a bounded number
/// of times before giving up with [`Error::MarkerTimeout`].
pub async fn await_marker(
    path: &Path,
    attempts: u32,
    delay: Duration,
    shutdown: &CancellationToken,
) -> Result<()> {
    for attempt in 0..attempts {
        if path.exists() {
            return Ok(());
        }
        debug!(
            "Marker {:?} not visible yet (attempt {}/{})",
            path,
            attempt + 1,
            attempts
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {
                return Err(Error::MarkerTimeout(format!(
                    "cancelled while waiting for {:?}",
                    path
                )));
            }
        }
    }
    Err(Error::MarkerTimeout(format!(
        "{:?} did not appear within {} attempts",
        path, attempts
    )))
}

/// Maintenance sweep: drop thumbnail rows whose source is gone, then
/// delete this volume's thumbnail files that no row references.
pub fn prune_thumbnails(
    conn: &Connection,
    thumbnails_dir: &Path,
    volume: &str,
) -> Result<usize> {
    let mut removed = thumbnails::delete_orphan_rows(conn).map_err(Error::Internal)?;

    let referenced = thumbnails::referenced_paths(conn).map_err(Error::Internal)?;
    let prefix = format!("{}-", volume);
    for entry in WalkDir::new(thumbnails_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.starts_with(&prefix) {
            continue;
        }
        let path = entry.path().to_string_lossy().to_string();
        if referenced.iter().any(|r| r == &path) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Could not prune thumbnail file {:?}: {}", entry.path(), e),
        }
    }
    Ok(removed)
}
