//! Per-match query descriptors: backing table or read view, mandatory
//! security predicate, and the fixed projection map for public collections.

use super::{projection::validate_projection, selection::recover_abusive_group_by};
use super::{Access, Caller, MatchCode, MediaUri};
use crate::error::{Error, Result};
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::types::Value as SqlValue;

/// Caller-supplied query arguments, in the platform's
/// projection/selection/args/order shape.
#[derive(Debug, Default, Clone)]
pub struct QueryRequest {
    pub projection: Option<Vec<String>>,
    pub selection: Option<String>,
    pub selection_args: Vec<SqlValue>,
    pub group_by: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

/// A fully built, parameterized SELECT ready to run against the resolved
/// volume database.
#[derive(Debug)]
pub struct PreparedQuery {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

const FILE_COLUMNS: &[&str] = &[
    "id",
    "path",
    "parent",
    "media_type",
    "mime_type",
    "display_name",
    "title",
    "size",
    "date_added",
    "date_modified",
    "date_taken",
    "owner_package",
    "bucket_id",
    "bucket_display_name",
    "width",
    "height",
];

const AUDIO_COLUMNS: &[&str] = &[
    "id",
    "path",
    "parent",
    "mime_type",
    "display_name",
    "title",
    "size",
    "date_added",
    "date_modified",
    "owner_package",
    "artist_id",
    "album_id",
    "artist",
    "album",
    "duration_ms",
    "track",
    "bucket_id",
    "bucket_display_name",
];

const ARTIST_COLUMNS: &[&str] = &["id", "key", "name", "number_of_albums", "number_of_tracks"];
const ALBUM_COLUMNS: &[&str] = &["id", "key", "name", "number_of_songs", "artist_id"];
const GENRE_COLUMNS: &[&str] = &["id", "name"];
const GENRE_MEMBER_COLUMNS: &[&str] = &["id", "genre_id", "audio_id"];
const PLAYLIST_MEMBER_COLUMNS: &[&str] = &["id", "playlist_id", "audio_id", "play_order"];
const THUMBNAIL_COLUMNS: &[&str] = &["id", "path", "source_id", "kind", "width", "height"];

struct Shape {
    table: &'static str,
    /// Mandatory predicate scoping the table to this collection.
    base_predicate: Option<&'static str>,
    /// Column the parent id segment (`/#/...`) filters on, if any.
    parent_id_column: Option<&'static str>,
    /// Fixed projection map; `None` on hidden shapes (internal callers see
    /// the raw table).
    allowed: Option<&'static [&'static str]>,
    /// Whether rows carry an owner column the ownership predicate can bind.
    has_owner: bool,
}

fn shape_for(code: MatchCode) -> Result<Shape> {
    use MatchCode::*;
    let shape = match code {
        ImagesMedia | ImagesMediaId => Shape {
            table: "files",
            base_predicate: Some("media_type = 1"),
            parent_id_column: None,
            allowed: Some(FILE_COLUMNS),
            has_owner: true,
        },
        AudioMedia | AudioMediaId => Shape {
            table: "audio",
            base_predicate: None,
            parent_id_column: None,
            allowed: Some(AUDIO_COLUMNS),
            has_owner: true,
        },
        AudioArtists | AudioArtistsId => Shape {
            table: "artist_info",
            base_predicate: None,
            parent_id_column: None,
            allowed: Some(ARTIST_COLUMNS),
            has_owner: false,
        },
        AudioArtistsIdAlbums => Shape {
            table: "album_info",
            base_predicate: None,
            parent_id_column: Some("artist_id"),
            allowed: Some(ALBUM_COLUMNS),
            has_owner: false,
        },
        AudioAlbums | AudioAlbumsId => Shape {
            table: "album_info",
            base_predicate: None,
            parent_id_column: None,
            allowed: Some(ALBUM_COLUMNS),
            has_owner: false,
        },
        AudioGenres | AudioGenresId => Shape {
            table: "genres",
            base_predicate: None,
            parent_id_column: None,
            allowed: Some(GENRE_COLUMNS),
            has_owner: false,
        },
        AudioGenresIdMembers => Shape {
            table: "genre_members",
            base_predicate: None,
            parent_id_column: Some("genre_id"),
            allowed: Some(GENRE_MEMBER_COLUMNS),
            has_owner: false,
        },
        AudioPlaylists | AudioPlaylistsId => Shape {
            table: "files",
            base_predicate: Some("media_type = 4"),
            parent_id_column: None,
            allowed: Some(FILE_COLUMNS),
            has_owner: true,
        },
        AudioPlaylistsIdMembers | AudioPlaylistsIdMembersId => Shape {
            table: "playlist_members",
            base_predicate: None,
            parent_id_column: Some("playlist_id"),
            allowed: Some(PLAYLIST_MEMBER_COLUMNS),
            has_owner: false,
        },
        VideoMedia | VideoMediaId => Shape {
            table: "files",
            base_predicate: Some("media_type = 3"),
            parent_id_column: None,
            allowed: Some(FILE_COLUMNS),
            has_owner: true,
        },
        VideoThumbnails | VideoThumbnailsId => Shape {
            table: "thumbnails",
            base_predicate: Some("kind = 3"),
            parent_id_column: None,
            allowed: Some(THUMBNAIL_COLUMNS),
            has_owner: false,
        },
        ImagesThumbnails | ImagesThumbnailsId => Shape {
            table: "thumbnails",
            base_predicate: Some("kind = 1"),
            parent_id_column: None,
            allowed: Some(THUMBNAIL_COLUMNS),
            has_owner: false,
        },
        Files | FilesId => Shape {
            table: "files",
            base_predicate: None,
            parent_id_column: None,
            allowed: Some(FILE_COLUMNS),
            has_owner: true,
        },
        MtpObjects | MtpObjectsId => Shape {
            table: "files",
            base_predicate: None,
            parent_id_column: None,
            allowed: None,
            has_owner: true,
        },
        AttachVolume | DetachVolume | Version | MediaScanner => {
            return Err(Error::invalid(format!(
                "resource {:?} is not queryable",
                code
            )))
        }
    };
    Ok(shape)
}

/// Where a mutating operation lands. Writes never go through read views:
/// audio writes hit `files` with the kind predicate the view encodes.
pub struct WriteScope {
    pub table: &'static str,
    pub base_predicate: Option<&'static str>,
    pub parent_id_column: Option<&'static str>,
    pub has_owner: bool,
}

pub fn write_scope(code: MatchCode) -> Result<WriteScope> {
    use MatchCode::*;
    let scope = match code {
        ImagesMedia | ImagesMediaId => WriteScope {
            table: "files",
            base_predicate: Some("media_type = 1"),
            parent_id_column: None,
            has_owner: true,
        },
        AudioMedia | AudioMediaId => WriteScope {
            table: "files",
            base_predicate: Some("media_type = 2"),
            parent_id_column: None,
            has_owner: true,
        },
        VideoMedia | VideoMediaId => WriteScope {
            table: "files",
            base_predicate: Some("media_type = 3"),
            parent_id_column: None,
            has_owner: true,
        },
        AudioPlaylists | AudioPlaylistsId => WriteScope {
            table: "files",
            base_predicate: Some("media_type = 4"),
            parent_id_column: None,
            has_owner: true,
        },
        Files | FilesId | MtpObjects | MtpObjectsId => WriteScope {
            table: "files",
            base_predicate: None,
            parent_id_column: None,
            has_owner: true,
        },
        AudioPlaylistsIdMembers | AudioPlaylistsIdMembersId => WriteScope {
            table: "playlist_members",
            base_predicate: None,
            parent_id_column: Some("playlist_id"),
            has_owner: false,
        },
        AudioGenresIdMembers => WriteScope {
            table: "genre_members",
            base_predicate: None,
            parent_id_column: Some("genre_id"),
            has_owner: false,
        },
        AudioGenres | AudioGenresId => WriteScope {
            table: "genres",
            base_predicate: None,
            parent_id_column: None,
            has_owner: false,
        },
        ImagesThumbnails | ImagesThumbnailsId => WriteScope {
            table: "thumbnails",
            base_predicate: Some("kind = 1"),
            parent_id_column: None,
            has_owner: false,
        },
        VideoThumbnails | VideoThumbnailsId => WriteScope {
            table: "thumbnails",
            base_predicate: Some("kind = 3"),
            parent_id_column: None,
            has_owner: false,
        },
        _ => {
            return Err(Error::invalid(format!(
                "resource {:?} is not writable",
                code
            )))
        }
    };
    Ok(scope)
}

pub fn table_for_write(code: MatchCode) -> Result<&'static str> {
    write_scope(code).map(|scope| scope.table)
}

lazy_static! {
    /// Column list with optional ASC/DESC and LIMIT-free shape only.
    static ref SAFE_ORDER_BY: Regex = Regex::new(
        r"(?i)^[_a-z][_a-z0-9]*(?:\s+(?:ASC|DESC))?(?:\s*,\s*[_a-z][_a-z0-9]*(?:\s+(?:ASC|DESC))?)*$"
    )
    .expect("order-by pattern is valid");
}

/// Build the security-filtered SELECT for a matched resource path.
///
/// The ownership predicate, when required, is appended as a standalone
/// parameterized term ANDed onto whatever the caller supplied; caller text
/// can never substitute or disable it.
pub fn build_query(uri: &MediaUri, caller: &Caller, request: &QueryRequest) -> Result<PreparedQuery> {
    let shape = shape_for(uri.code)?;

    let projection = match shape.allowed {
        Some(allowed) => validate_projection(request.projection.as_deref(), allowed)?,
        None => request
            .projection
            .clone()
            .unwrap_or_else(|| vec!["*".to_string()]),
    };

    let (selection, group_by) =
        recover_abusive_group_by(request.selection.as_deref(), request.group_by.as_deref())?;

    let mut predicates: Vec<String> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();

    if let Some(base) = shape.base_predicate {
        predicates.push(base.to_string());
    }
    if let Some(parent_column) = shape.parent_id_column {
        let parent_id = uri
            .id
            .ok_or_else(|| Error::invalid("member resource path without parent id"))?;
        predicates.push(format!("{} = ?", parent_column));
        args.push(SqlValue::Integer(parent_id));
    }
    if uri.code.is_single_row() {
        // For member shapes the row id is the second path id.
        let row_id = if shape.parent_id_column.is_some() {
            uri.id2
        } else {
            uri.id
        }
        .ok_or_else(|| Error::invalid("single-row resource path without id"))?;
        predicates.push("id = ?".to_string());
        args.push(SqlValue::Integer(row_id));
    }
    if caller.access == Access::GrantedIfOwner && shape.has_owner {
        predicates.push("owner_package = ?".to_string());
        args.push(SqlValue::Text(caller.package.clone()));
    }
    if let Some(selection) = selection {
        predicates.push(format!("({})", selection));
        args.extend(request.selection_args.iter().cloned());
    }

    let mut sql = format!("SELECT {} FROM {}", projection.join(", "), shape.table);
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    if let Some(group_by) = group_by {
        sql.push_str(" GROUP BY ");
        sql.push_str(&group_by);
    }
    if let Some(order_by) = &request.order_by {
        if !SAFE_ORDER_BY.is_match(order_by.trim()) {
            return Err(Error::invalid(format!("order-by not allowed: {}", order_by)));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(order_by.trim());
    }
    if let Some(limit) = request.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    Ok(PreparedQuery { sql, args })
}
