//! Insert/update normalization pipeline.
//!
//! Mutations pass through here before the raw row write: path synthesis,
//! artist/album dimension resolution, parent/directory resolution, and
//! derivation of bucket, display name, MIME, media kind, taken time and
//! title. The caller (store) holds the directory lock for the extent of
//! its transaction while invoking this module.

pub mod dimensions;
pub mod directories;
pub mod titles;

pub use dimensions::{DimensionCache, NO_DIMENSION};
pub use directories::DirectoryCache;
pub use titles::{NoOpTitleResolver, TitleResolver};

use crate::error::{Error, Result};
use crate::router::MatchCode;
use crate::values::ContentValues;
use crate::volumes::MediaType;
use dimensions::Dimension;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};

/// Environment handed to a normalization run. Caches are per-volume and
/// guarded by the store's directory lock for the whole transaction.
pub struct NormalizeContext<'a> {
    pub resolver: &'a dyn TitleResolver,
    pub locale: &'a str,
    pub volume_roots: &'a [String],
    pub caller_package: &'a str,
    pub dimension_cache: &'a mut DimensionCache,
    pub directory_cache: &'a mut DirectoryCache,
}

/// Side outputs of normalization the store acts on after the row write.
#[derive(Debug, Default)]
pub struct Normalized {
    /// Genre name stripped from an audio row; membership is recorded once
    /// the row id exists.
    pub genre: Option<String>,
    /// A dimension display name was upgraded; listeners are notified
    /// after commit.
    pub dimension_name_updated: bool,
}

/// Media kind a match code forces on rows written through it, if any.
pub fn implied_media_type(code: MatchCode) -> Option<MediaType> {
    use MatchCode::*;
    match code {
        ImagesMedia | ImagesMediaId => Some(MediaType::Image),
        AudioMedia | AudioMediaId => Some(MediaType::Audio),
        VideoMedia | VideoMediaId => Some(MediaType::Video),
        AudioPlaylists | AudioPlaylistsId => Some(MediaType::Playlist),
        _ => None,
    }
}

/// Normalize values for a files-table insert. Mutates `values` in place
/// into its final storable form.
pub fn normalize_insert(
    conn: &Connection,
    context: &mut NormalizeContext<'_>,
    code: MatchCode,
    values: &mut ContentValues,
) -> Result<Normalized> {
    let mut outcome = Normalized::default();

    // 1. Path: reject directory-looking paths, synthesize when absent.
    let path = match values.get_str("path") {
        Some(path) if path.ends_with('/') => {
            return Err(Error::invalid(format!(
                "path must not end in a separator: {}",
                path
            )));
        }
        Some(path) => path.to_string(),
        None => {
            let synthesized = synthesize_path(context, code, values)?;
            values.put("path", synthesized.clone());
            synthesized
        }
    };

    // 2. Display name from the final path segment when absent.
    if values.get_str("display_name").is_none() {
        let display = path.rsplit('/').next().unwrap_or(&path).to_string();
        values.put("display_name", display);
    }

    // 3. MIME from extension when absent; media kind from MIME unless the
    //    caller or the collection forces one.
    if values.get_str("mime_type").is_none() {
        if let Some(mime) = mime_from_path(&path) {
            values.put("mime_type", mime);
        }
    }
    let media_type = match implied_media_type(code) {
        Some(forced) => forced,
        None => match values.get_i64("media_type").and_then(MediaType::from_int) {
            Some(explicit) => explicit,
            None => values
                .get_str("mime_type")
                .map(MediaType::from_mime)
                .unwrap_or(MediaType::None),
        },
    };
    values.put("media_type", media_type.as_int());

    // 4. Taken time backfilled from modification time.
    if values.get_i64("date_taken").is_none() {
        if let Some(modified) = values.get_i64("date_modified") {
            values.put("date_taken", modified);
        }
    }

    // 5. Title: backfill from the filename stem, then resolve localizable
    //    references.
    if values.get_str("title").is_none() {
        let stem = file_stem(&path);
        values.put("title", stem);
    }
    if let Some(raw_title) = values.get_str("title").map(|s| s.to_string()) {
        let (title, reference) = titles::resolve_title(context.resolver, context.locale, &raw_title);
        values.put("title", title);
        match reference {
            Some(reference) => values.put("title_resource", reference),
            None => values.put_null("title_resource"),
        };
    }

    // 6. Audio dimension resolution: names out, foreign keys in.
    if media_type == MediaType::Audio {
        resolve_audio_dimensions(conn, context, values, &path, &mut outcome)?;
    } else {
        values.remove("artist");
        values.remove("album");
        values.remove("album_artist");
        values.remove("is_compilation");
        values.remove("genre");
    }

    // 7. Parent and bucket from the containing folder.
    if values.get_i64("parent").is_none() {
        let parent = directories::resolve_parent(
            conn,
            context.directory_cache,
            context.volume_roots,
            &path,
        )
        .map_err(Error::Internal)?;
        values.put("parent", parent);
    }
    if let Some((bucket_id, bucket_display)) = directories::bucket_for(&path) {
        values.put("bucket_id", bucket_id);
        values.put("bucket_display_name", bucket_display);
    }

    // 8. Ownership.
    if values.get_str("owner_package").is_none() {
        values.put("owner_package", context.caller_package.to_string());
    }

    Ok(outcome)
}

/// Normalize values for an update of existing rows. Lighter than the
/// insert path: only fields the caller actually touches are re-derived.
/// `row_id` addresses the targeted row when the path is a single-row form;
/// it anchors folder-derived keys when the update carries no path.
pub fn normalize_update(
    conn: &Connection,
    context: &mut NormalizeContext<'_>,
    code: MatchCode,
    row_id: Option<i64>,
    values: &mut ContentValues,
) -> Result<Normalized> {
    let mut outcome = Normalized::default();

    if let Some(path) = values.get_str("path").map(|s| s.to_string()) {
        if path.ends_with('/') {
            return Err(Error::invalid(format!(
                "path must not end in a separator: {}",
                path
            )));
        }
        // A moved file gets its location-derived fields recomputed.
        let display = path.rsplit('/').next().unwrap_or(&path).to_string();
        values.put("display_name", display);
        if let Some((bucket_id, bucket_display)) = directories::bucket_for(&path) {
            values.put("bucket_id", bucket_id);
            values.put("bucket_display_name", bucket_display);
        }
        let parent = directories::resolve_parent(
            conn,
            context.directory_cache,
            context.volume_roots,
            &path,
        )
        .map_err(Error::Internal)?;
        values.put("parent", parent);
    }

    if let Some(raw_title) = values.get_str("title").map(|s| s.to_string()) {
        let (title, reference) = titles::resolve_title(context.resolver, context.locale, &raw_title);
        values.put("title", title);
        match reference {
            Some(reference) => values.put("title_resource", reference),
            None => values.put_null("title_resource"),
        };
    }

    let touches_dimensions =
        values.contains("artist") || values.contains("album") || values.contains("genre");
    if touches_dimensions && implied_media_type(code) == Some(MediaType::Audio) {
        // The album key hashes the containing folder; without a path in the
        // update the stored one must anchor it, or the key would diverge
        // from the insert-time key and split the album.
        let folder_source = match values.get_str("path") {
            Some(path) => path.to_string(),
            None => stored_path(conn, row_id)?.unwrap_or_default(),
        };
        resolve_audio_dimensions(conn, context, values, &folder_source, &mut outcome)?;
    } else {
        values.remove("artist");
        values.remove("album");
        values.remove("album_artist");
        values.remove("is_compilation");
        values.remove("genre");
    }

    Ok(outcome)
}

fn resolve_audio_dimensions(
    conn: &Connection,
    context: &mut NormalizeContext<'_>,
    values: &mut ContentValues,
    path: &str,
    outcome: &mut Normalized,
) -> Result<()> {
    let artist = take_text(values, "artist");
    let album = take_text(values, "album");
    let album_artist = take_text(values, "album_artist");
    let is_compilation = values
        .remove("is_compilation")
        .map(|v| matches!(v, SqlValue::Integer(i) if i != 0))
        .unwrap_or(false);
    outcome.genre = take_text(values, "genre");

    if let Some(artist) = artist {
        let resolved = dimensions::get_or_create(
            conn,
            Dimension::Artist,
            &dimensions::name_key(&artist),
            &artist,
            context.dimension_cache,
        )
        .map_err(Error::Internal)?;
        if resolved.id != NO_DIMENSION {
            values.put("artist_id", resolved.id);
        }
        outcome.dimension_name_updated |= resolved.name_updated;
    }

    if let Some(album) = album {
        let folder = path.rsplit_once('/').map(|(f, _)| f).unwrap_or("");
        let key = dimensions::album_key(&album, album_artist.as_deref(), is_compilation, folder);
        let resolved = dimensions::get_or_create(
            conn,
            Dimension::Album,
            &key,
            &album,
            context.dimension_cache,
        )
        .map_err(Error::Internal)?;
        if resolved.id != NO_DIMENSION {
            values.put("album_id", resolved.id);
        }
        outcome.dimension_name_updated |= resolved.name_updated;
    }

    Ok(())
}

fn stored_path(conn: &Connection, row_id: Option<i64>) -> Result<Option<String>> {
    let Some(id) = row_id else {
        return Ok(None);
    };
    conn.query_row(
        "SELECT path FROM files WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )
    .optional()
    .map_err(Error::Sqlite)
}

fn take_text(values: &mut ContentValues, column: &str) -> Option<String> {
    match values.remove(column) {
        Some(SqlValue::Text(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

/// Synthesize a path from a timestamp-based name under the kind's default
/// folder. Directory creation on disk is deferred to file-open time.
fn synthesize_path(
    context: &NormalizeContext<'_>,
    code: MatchCode,
    values: &ContentValues,
) -> Result<String> {
    let root = context
        .volume_roots
        .first()
        .ok_or_else(|| Error::invalid("cannot synthesize a path without a volume root"))?;
    let kind = implied_media_type(code)
        .or_else(|| values.get_str("mime_type").map(MediaType::from_mime))
        .unwrap_or(MediaType::None);
    let folder = match kind {
        MediaType::Image => "Pictures",
        MediaType::Audio => "Music",
        MediaType::Video => "Movies",
        MediaType::Playlist => "Playlists",
        _ => "Download",
    };
    let extension = values
        .get_str("mime_type")
        .and_then(extension_for_mime)
        .unwrap_or("bin");
    let stamp = chrono::Utc::now().timestamp_millis();
    Ok(format!(
        "{}/{}/{}.{}",
        root.trim_end_matches('/'),
        folder,
        stamp,
        extension
    ))
}

fn file_stem(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

fn mime_from_path(path: &str) -> Option<&'static str> {
    let extension = path.rsplit('.').next()?.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" => "audio/ogg",
        "flac" => "audio/flac",
        "wav" => "audio/x-wav",
        "m4a" => "audio/mp4",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "3gp" => "video/3gpp",
        "m3u" | "m3u8" => "audio/x-mpegurl",
        _ => return None,
    };
    Some(mime)
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let extension = match mime.to_ascii_lowercase().as_str() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/heic" => "heic",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/flac" => "flac",
        "audio/x-wav" => "wav",
        "audio/mp4" => "m4a",
        "video/mp4" => "mp4",
        "video/x-matroska" => "mkv",
        "video/webm" => "webm",
        "video/3gpp" => "3gp",
        "audio/x-mpegurl" => "m3u",
        _ => return None,
    };
    Some(extension)
}
