//! LRU eviction of stale external-volume databases.
//!
//! Runs on every open of an external database, before the file is opened.
//! The database about to be used is excluded from the scan up front (its
//! slot is already spoken for), so eviction can never delete the file an
//! open is racing toward.

use super::database::delete_database_files;
use super::INTERNAL_DATABASE_NAME;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Delete external databases unused for longer than `max_age`, then the
/// least-recently-modified remainder while more than `max_external - 1`
/// others exist (the one being opened occupies the last slot).
pub fn evict_stale_databases(
    db_dir: &Path,
    opening: &Path,
    max_external: usize,
    max_age: Duration,
) {
    let mut candidates = scan_candidates(db_dir, opening);

    let now = SystemTime::now();
    candidates.retain(|(path, modified)| {
        let age = now.duration_since(*modified).unwrap_or(Duration::ZERO);
        if age > max_age {
            info!(
                "Evicting volume database unused for {} days: {:?}",
                age.as_secs() / 86400,
                path
            );
            delete_database_files(path);
            false
        } else {
            true
        }
    });

    // Oldest first; pop from the front until the cap holds.
    candidates.sort_by_key(|(_, modified)| *modified);
    let slots_for_others = max_external.saturating_sub(1);
    while candidates.len() > slots_for_others {
        let (path, _) = candidates.remove(0);
        info!("Evicting least-recently-used volume database: {:?}", path);
        delete_database_files(&path);
    }
}

fn scan_candidates(db_dir: &Path, opening: &Path) -> Vec<(PathBuf, SystemTime)> {
    let entries = match std::fs::read_dir(db_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot scan database directory {:?}: {}", db_dir, e);
            return Vec::new();
        }
    };

    let mut candidates = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.ends_with(".db") || file_name == INTERNAL_DATABASE_NAME {
            continue;
        }
        if path == opening {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        candidates.push((path, modified));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, age: Duration) {
        fs::write(path, b"").unwrap();
        let mtime = SystemTime::now() - age;
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn deletes_databases_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old-card.db");
        let fresh = dir.path().join("fresh-card.db");
        touch(&old, Duration::from_secs(61 * 86400));
        touch(&fresh, Duration::from_secs(86400));

        let opening = dir.path().join("new-card.db");
        evict_stale_databases(dir.path(), &opening, 3, Duration::from_secs(60 * 86400));

        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn lru_respects_cap_and_spares_opening_file() {
        let dir = tempfile::tempdir().unwrap();
        let oldest = dir.path().join("a.db");
        let middle = dir.path().join("b.db");
        let newest = dir.path().join("c.db");
        touch(&oldest, Duration::from_secs(3 * 86400));
        touch(&middle, Duration::from_secs(2 * 86400));
        touch(&newest, Duration::from_secs(86400));
        let opening = dir.path().join("d.db");
        touch(&opening, Duration::ZERO);

        evict_stale_databases(dir.path(), &opening, 3, Duration::from_secs(60 * 86400));

        // Cap 3 including the one being opened: only two others survive.
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
        assert!(opening.exists());
    }

    #[test]
    fn internal_database_is_never_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let internal = dir.path().join(INTERNAL_DATABASE_NAME);
        touch(&internal, Duration::from_secs(365 * 86400));
        let opening = dir.path().join("card.db");

        evict_stale_databases(dir.path(), &opening, 1, Duration::from_secs(60 * 86400));

        assert!(internal.exists());
    }
}
