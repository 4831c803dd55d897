//! Artist/album dimension resolution: get-or-create-by-key with best-name
//! updates.
//!
//! Names are deduplicated by a normalized sort key (case and diacritic
//! folded, articles stripped, alphanumerics only). Albums are further
//! disambiguated by a hash so same-named albums in different contexts stay
//! distinct rows. More than one row per key indicates pre-existing
//! corruption: the resolver logs and degrades to "no match" (sentinel -1)
//! rather than failing the surrounding insert.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::warn;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

/// Sentinel id meaning "no dimension row could be resolved".
pub const NO_DIMENSION: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Artist,
    Album,
}

impl Dimension {
    fn table(self) -> &'static str {
        match self {
            Dimension::Artist => "artists",
            Dimension::Album => "albums",
        }
    }
}

/// Normalized sort key for a display name: diacritic-folded lowercase with
/// leading/trailing articles stripped and everything but alphanumerics
/// removed. `"Police, The"`, `"The Police"` and `"the police"` all key to
/// `"police"`.
pub fn name_key(name: &str) -> String {
    let folded: String = name
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();

    let stripped = strip_articles(folded.trim());
    let key: String = stripped
        .unicode_words()
        .collect::<String>()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect();
    key
}

fn strip_articles(name: &str) -> &str {
    for suffix in [", the", ", an", ", a"] {
        if name.len() > suffix.len() {
            if let Some(tail) = name.get(name.len() - suffix.len()..) {
                if tail.eq_ignore_ascii_case(suffix) {
                    return &name[..name.len() - suffix.len()];
                }
            }
        }
    }
    for prefix in ["the ", "an ", "a "] {
        if name.len() > prefix.len() {
            if let Some(head) = name.get(..prefix.len()) {
                if head.eq_ignore_ascii_case(prefix) {
                    return &name[prefix.len()..];
                }
            }
        }
    }
    name
}

/// Rewrite `"Article, The"`-style suffix form to prefix form
/// (`"The Article"`). Names already in prefix form pass through.
pub fn prefix_normalize(name: &str) -> String {
    let trimmed = name.trim();
    for (suffix, article) in [(", the", "The"), (", an", "An"), (", a", "A")] {
        if trimmed.len() > suffix.len() {
            if let Some(tail) = trimmed.get(trimmed.len() - suffix.len()..) {
                if tail.eq_ignore_ascii_case(suffix) {
                    let stem = &trimmed[..trimmed.len() - suffix.len()];
                    return format!("{} {}", article, stem);
                }
            }
        }
    }
    trimmed.to_string()
}

/// Disambiguating hash appended to an album's sort key so that same-named
/// albums in different contexts remain distinct: keyed by album-artist
/// name, else a compilation marker, else the containing folder path, in
/// that priority order.
pub fn album_disambiguator(
    album_artist: Option<&str>,
    is_compilation: bool,
    folder_path: &str,
) -> String {
    let discriminant = match album_artist {
        Some(artist) if !artist.is_empty() => artist.to_lowercase(),
        _ if is_compilation => "#compilation#".to_string(),
        _ => folder_path.to_lowercase(),
    };
    let digest = Sha256::digest(discriminant.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Full album key: name key plus context hash.
pub fn album_key(
    album_name: &str,
    album_artist: Option<&str>,
    is_compilation: bool,
    folder_path: &str,
) -> String {
    format!(
        "{}|{}",
        name_key(album_name),
        album_disambiguator(album_artist, is_compilation, folder_path)
    )
}

/// Whether `incoming` beats `stored` under the best-name rule: longer
/// wins; among equal lengths the one sorting later case-insensitively
/// wins (a proxy for carrying diacritics).
fn name_wins(incoming: &str, stored: &str) -> bool {
    use std::cmp::Ordering;
    match incoming.chars().count().cmp(&stored.chars().count()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => {
            incoming.to_lowercase().cmp(&stored.to_lowercase()) == Ordering::Greater
        }
    }
}

/// Per-volume cache short-circuiting repeat lookups within a scan.
/// Invalidated wholesale on any row removal: the delete path cannot
/// cheaply tell which keys went away.
#[derive(Debug, Default)]
pub struct DimensionCache {
    by_key: HashMap<(Dimension, String), i64>,
}

impl DimensionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
    }
}

/// Outcome of a dimension resolution, carrying whether a stored display
/// name was improved (listeners are told after commit).
pub struct Resolved {
    pub id: i64,
    pub name_updated: bool,
}

/// Resolve a dimension row by key, creating it when absent and upgrading
/// its display name when the incoming name wins.
pub fn get_or_create(
    conn: &Connection,
    dimension: Dimension,
    key: &str,
    raw_name: &str,
    cache: &mut DimensionCache,
) -> Result<Resolved> {
    if let Some(&id) = cache.by_key.get(&(dimension, key.to_string())) {
        return Ok(Resolved {
            id,
            name_updated: false,
        });
    }

    let table = dimension.table();
    let incoming = prefix_normalize(raw_name);

    let rows: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name FROM {} WHERE key = ?1 LIMIT 2",
            table
        ))?;
        let mapped = stmt.query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?;
        mapped.collect::<std::result::Result<_, _>>()?
    };

    let resolved = match rows.len() {
        0 => {
            conn.execute(
                &format!("INSERT INTO {} (key, name) VALUES (?1, ?2)", table),
                params![key, incoming],
            )?;
            Resolved {
                id: conn.last_insert_rowid(),
                name_updated: false,
            }
        }
        1 => {
            let (id, stored) = &rows[0];
            let mut name_updated = false;
            if name_wins(&incoming, stored) {
                conn.execute(
                    &format!("UPDATE {} SET name = ?1 WHERE id = ?2", table),
                    params![incoming, id],
                )?;
                name_updated = true;
            }
            Resolved {
                id: *id,
                name_updated,
            }
        }
        _ => {
            // Pre-existing corruption; tolerated, not repaired.
            warn!(
                "Ambiguous {} key '{}': multiple rows share it, resolving to none",
                table, key
            );
            return Ok(Resolved {
                id: NO_DIMENSION,
                name_updated: false,
            });
        }
    };

    cache
        .by_key
        .insert((dimension, key.to_string()), resolved.id);
    Ok(resolved)
}

/// Get-or-create for the genres dimension, keyed case-insensitively by
/// literal name (genres carry no sort key).
pub fn get_or_create_genre(conn: &Connection, name: &str) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM genres WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute("INSERT INTO genres (name) VALUES (?1)", params![name])?;
    Ok(conn.last_insert_rowid())
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
    fn name_key_folds_case_and_articles() {
        assert_eq!(name_key("The Police"), "police");
        assert_eq!(name_key("Police, The"), "police");
        assert_eq!(name_key("police"), "police");
        assert_eq!(name_key("Béla Fleck"), "belafleck");
    }

    #[test]
    fn prefix_normalize_rewrites_suffix_articles() {
        assert_eq!(prefix_normalize("Police, The"), "The Police");
        assert_eq!(prefix_normalize("Apple, An"), "An Apple");
        assert_eq!(prefix_normalize("The Police"), "The Police");
    }

    #[test]
    fn album_keys_distinguish_contexts() {
        let by_artist = album_key("Greatest Hits", Some("Queen"), false, "/music/queen");
        let by_other_artist = album_key("Greatest Hits", Some("ABBA"), false, "/music/abba");
        assert_ne!(by_artist, by_other_artist);

        let by_folder_a = album_key("Unknown", None, false, "/music/a");
        let by_folder_b = album_key("Unknown", None, false, "/music/b");
        assert_ne!(by_folder_a, by_folder_b);

        // Compilation flag beats folder.
        let compilation_a = album_key("Mix", None, true, "/music/a");
        let compilation_b = album_key("Mix", None, true, "/music/b");
        assert_eq!(compilation_a, compilation_b);
    }

    #[test]
    fn get_or_create_converges_on_best_name() {
        let conn = conn();
        let mut cache = DimensionCache::new();

        let first = get_or_create(
            &conn,
            Dimension::Artist,
            &name_key("Police, The"),
            "Police, The",
            &mut cache,
        )
        .unwrap();
        // Fresh cache for the second call so the lookup hits the table.
        let mut cache = DimensionCache::new();
        let second = get_or_create(
            &conn,
            Dimension::Artist,
            &name_key("Police"),
            "Police",
            &mut cache,
        )
        .unwrap();

        assert_eq!(first.id, second.id);
        let stored: String = conn
            .query_row("SELECT name FROM artists WHERE id = ?1", params![first.id], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(stored, "The Police");
    }

    #[test]
    fn shorter_name_never_downgrades() {
        let conn = conn();
        let mut cache = DimensionCache::new();
        get_or_create(&conn, Dimension::Artist, "police", "The Police", &mut cache).unwrap();
        let mut cache = DimensionCache::new();
        let second =
            get_or_create(&conn, Dimension::Artist, "police", "Police", &mut cache).unwrap();
        assert!(!second.name_updated);
        let stored: String = conn
            .query_row("SELECT name FROM artists WHERE key = 'police'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, "The Police");
    }

    #[test]
    fn equal_length_prefers_later_sorting_name() {
        let conn = conn();
        let mut cache = DimensionCache::new();
        get_or_create(&conn, Dimension::Artist, "bjork", "Bjork", &mut cache).unwrap();
        let mut cache = DimensionCache::new();
        let second =
            get_or_create(&conn, Dimension::Artist, "bjork", "Björk", &mut cache).unwrap();
        assert!(second.name_updated);
        let stored: String = conn
            .query_row("SELECT name FROM artists WHERE key = 'bjork'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, "Björk");
    }

    #[test]
    fn ambiguous_key_degrades_to_sentinel() {
        let conn = conn();
        conn.execute("INSERT INTO artists (key, name) VALUES ('dup', 'One')", [])
            .unwrap();
        conn.execute("INSERT INTO artists (key, name) VALUES ('dup', 'Two')", [])
            .unwrap();
        let mut cache = DimensionCache::new();
        let resolved =
            get_or_create(&conn, Dimension::Artist, "dup", "Whatever", &mut cache).unwrap();
        assert_eq!(resolved.id, NO_DIMENSION);
    }

    #[test]
    fn cache_short_circuits_lookup() {
        let conn = conn();
        let mut cache = DimensionCache::new();
        let first =
            get_or_create(&conn, Dimension::Artist, "police", "The Police", &mut cache).unwrap();
        // Drop the backing row; the cached id must still be served.
        conn.execute("DELETE FROM artists", []).unwrap();
        let second =
            get_or_create(&conn, Dimension::Artist, "police", "The Police", &mut cache).unwrap();
        assert_eq!(first.id, second.id);
        // After wholesale invalidation the resolver recreates the row.
        cache.clear();
        let third =
            get_or_create(&conn, Dimension::Artist, "police", "The Police", &mut cache).unwrap();
        assert_ne!(third.id, NO_DIMENSION);
    }
}
