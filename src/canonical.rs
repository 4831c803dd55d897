//! Canonical audio-track references.
//!
//! Row ids are not stable across rescans, so a plain `audio/media/{id}`
//! path can silently start pointing at a different track. A canonical form
//! carries the resolved title as a query parameter; resolving it back
//! prefers the identity match and falls back to a unique title lookup when
//! the id has moved.

use crate::error::{Error, Result};
use crate::router::{MatchCode, MediaUri};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

const TITLE_PARAM: &str = "title";

/// Append the track's resolved title to a single-track audio path.
/// Non-audio paths are rejected; a missing row is `NotFound`.
pub fn canonicalize(conn: &Connection, uri: &MediaUri) -> Result<String> {
    if uri.code != MatchCode::AudioMediaId {
        return Err(Error::invalid(
            "only single audio tracks have a canonical form",
        ));
    }
    let id = uri
        .id
        .ok_or_else(|| Error::invalid("audio track path carries no id"))?;
    let title: Option<String> = conn
        .query_row(
            "SELECT title FROM files WHERE id = ?1 AND media_type = 2",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let title = title.ok_or_else(|| Error::not_found(format!("audio track {}", id)))?;
    Ok(format!(
        "{}?{}={}",
        uri.to_path(),
        TITLE_PARAM,
        urlencoding::encode(&title)
    ))
}

/// Resolve a canonical reference back to a concrete row. The embedded id
/// wins while it still carries the embedded title; otherwise a unique
/// title match re-binds the reference. Ambiguity and absence are both
/// `NotFound`: a canonical reference never guesses.
pub fn uncanonicalize(
    conn: &Connection,
    canonical: &str,
    caller: &crate::router::Caller,
) -> Result<MediaUri> {
    let (path, query) = canonical
        .split_once('?')
        .ok_or_else(|| Error::invalid(format!("not a canonical reference: {}", canonical)))?;
    let title = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("title="))
        .ok_or_else(|| Error::invalid(format!("canonical reference has no title: {}", canonical)))?;
    let title = urlencoding::decode(title)
        .map_err(|e| Error::invalid(format!("malformed title encoding: {}", e)))?
        .into_owned();

    let uri = MediaUri::parse(path, caller)?;
    if uri.code != MatchCode::AudioMediaId {
        return Err(Error::invalid(
            "only single audio tracks have a canonical form",
        ));
    }
    let id = uri
        .id
        .ok_or_else(|| Error::invalid("audio track path carries no id"))?;

    let stored: Option<String> = conn
        .query_row(
            "SELECT title FROM files WHERE id = ?1 AND media_type = 2",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    if stored.as_deref() == Some(title.as_str()) {
        return Ok(uri);
    }

    debug!(
        "Canonical id {} no longer matches title '{}', re-binding by title",
        id, title
    );
    let matches: Vec<i64> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM files WHERE title = ?1 AND media_type = 2 LIMIT 2",
        )?;
        let mapped = stmt.query_map(params![title], |row| row.get(0))?;
        mapped.collect::<std::result::Result<_, _>>()?
    };
    match matches.as_slice() {
        [rebound] => Ok(MediaUri {
            id: Some(*rebound),
            ..uri
        }),
        [] => Err(Error::not_found(format!("no audio track titled '{}'", title))),
        _ => Err(Error::not_found(format!(
            "title '{}' is ambiguous, canonical reference cannot re-bind",
            title
        ))),
    }
}
