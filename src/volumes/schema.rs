//! Schema for a per-volume media database.
//!
//! One `files` table holds every filesystem object (media or not); media
//! kind decides which of the kind-specific columns are meaningful. Artist
//! and album dimension tables are referenced by foreign key from audio
//! rows. The `log` table is a bounded in-database diagnostic trail.
//!
//! The versioned ladder migrates long-lived installations in place;
//! anything older than [`MIN_INCREMENTAL_VERSION`] is recreated from
//! scratch (incremental steps are not defined that far back).

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema, View,
    DEFAULT_TIMESTAMP,
};
use anyhow::Result;
use rusqlite::Connection;

/// Media kind stored in `files.media_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    None,
    Image,
    Audio,
    Video,
    Playlist,
    Directory,
}

impl MediaType {
    pub fn as_int(self) -> i64 {
        match self {
            MediaType::None => 0,
            MediaType::Image => 1,
            MediaType::Audio => 2,
            MediaType::Video => 3,
            MediaType::Playlist => 4,
            MediaType::Directory => 5,
        }
    }

    pub fn from_int(value: i64) -> Option<Self> {
        match value {
            0 => Some(MediaType::None),
            1 => Some(MediaType::Image),
            2 => Some(MediaType::Audio),
            3 => Some(MediaType::Video),
            4 => Some(MediaType::Playlist),
            5 => Some(MediaType::Directory),
            _ => None,
        }
    }

    /// Infer the media kind from a MIME type, the way rows are classified
    /// when the caller does not force a kind explicitly.
    pub fn from_mime(mime: &str) -> Self {
        let lower = mime.to_ascii_lowercase();
        if lower.starts_with("image/") {
            MediaType::Image
        } else if lower.starts_with("audio/") {
            MediaType::Audio
        } else if lower.starts_with("video/") {
            MediaType::Video
        } else if lower == "application/vnd.ms-playlist"
            || lower == "audio/x-mpegurl"
            || lower == "application/x-mpegurl"
        {
            MediaType::Playlist
        } else {
            MediaType::None
        }
    }
}

const FILES_TABLE: Table = Table {
    name: "files",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("path", &SqlType::Text, collate_nocase = true),
        sqlite_column!(
            "parent",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "media_type",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("mime_type", &SqlType::Text),
        sqlite_column!("display_name", &SqlType::Text),
        sqlite_column!("title", &SqlType::Text),
        sqlite_column!("title_resource", &SqlType::Text),
        sqlite_column!("size", &SqlType::Integer),
        sqlite_column!(
            "date_added",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!("date_modified", &SqlType::Integer),
        sqlite_column!("date_taken", &SqlType::Integer),
        sqlite_column!("owner_package", &SqlType::Text),
        sqlite_column!("artist_id", &SqlType::Integer),
        sqlite_column!("album_id", &SqlType::Integer),
        sqlite_column!("duration_ms", &SqlType::Integer),
        sqlite_column!("track", &SqlType::Integer),
        sqlite_column!("width", &SqlType::Integer),
        sqlite_column!("height", &SqlType::Integer),
        sqlite_column!("bucket_id", &SqlType::Text),
        sqlite_column!("bucket_display_name", &SqlType::Text),
    ],
    indices: &[
        ("idx_files_parent", "parent"),
        ("idx_files_media_type", "media_type"),
        ("idx_files_bucket", "bucket_id"),
        ("idx_files_artist", "artist_id"),
        ("idx_files_album", "album_id"),
        ("idx_files_title", "title"),
    ],
    unique_constraints: &[&["path"]],
};

// Dimension keys carry a plain index, not a UNIQUE constraint: pre-existing
// databases are known to contain duplicate keys and the resolver degrades
// to "no match" instead of refusing to open them.
const ARTISTS_TABLE: Table = Table {
    name: "artists",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("key", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_artists_key", "key")],
    unique_constraints: &[],
};

const ALBUMS_TABLE: Table = Table {
    name: "albums",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("key", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_albums_key", "key")],
    unique_constraints: &[],
};

/// Thumbnail kind values match `MediaType`: 1 = image source, 3 = video.
const THUMBNAILS_TABLE: Table = Table {
    name: "thumbnails",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("path", &SqlType::Text),
        sqlite_column!("source_id", &SqlType::Integer, non_null = true),
        sqlite_column!("kind", &SqlType::Integer, non_null = true),
        sqlite_column!("width", &SqlType::Integer),
        sqlite_column!("height", &SqlType::Integer),
    ],
    indices: &[("idx_thumbnails_source", "source_id")],
    unique_constraints: &[],
};

const PLAYLIST_MEMBERS_FK: ForeignKey = ForeignKey {
    foreign_table: "files",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

const PLAYLIST_MEMBERS_TABLE: Table = Table {
    name: "playlist_members",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "playlist_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&PLAYLIST_MEMBERS_FK)
        ),
        sqlite_column!("audio_id", &SqlType::Integer, non_null = true),
        sqlite_column!("play_order", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_playlist_members_playlist", "playlist_id")],
    unique_constraints: &[],
};

const GENRES_TABLE: Table = Table {
    name: "genres",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true, collate_nocase = true),
    ],
    indices: &[],
    unique_constraints: &[&["name"]],
};

const GENRE_MEMBERS_FK: ForeignKey = ForeignKey {
    foreign_table: "genres",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

const GENRE_MEMBERS_TABLE: Table = Table {
    name: "genre_members",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "genre_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&GENRE_MEMBERS_FK)
        ),
        sqlite_column!("audio_id", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_genre_members_genre", "genre_id")],
    unique_constraints: &[],
};

const LOG_TABLE: Table = Table {
    name: "log",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "time",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!("tag", &SqlType::Text, non_null = true),
        sqlite_column!("message", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

const ARTIST_INFO_VIEW: View = View {
    name: "artist_info",
    select_sql: "SELECT artists.id AS id, artists.key AS key, artists.name AS name, \
                 COUNT(DISTINCT files.album_id) AS number_of_albums, \
                 COUNT(files.id) AS number_of_tracks \
                 FROM artists LEFT JOIN files \
                 ON files.artist_id = artists.id AND files.media_type = 2 \
                 GROUP BY artists.id",
};

const ALBUM_INFO_VIEW: View = View {
    name: "album_info",
    select_sql: "SELECT albums.id AS id, albums.key AS key, albums.name AS name, \
                 COUNT(files.id) AS number_of_songs, \
                 MIN(files.artist_id) AS artist_id \
                 FROM albums LEFT JOIN files \
                 ON files.album_id = albums.id AND files.media_type = 2 \
                 GROUP BY albums.id",
};

const AUDIO_VIEW: View = View {
    name: "audio",
    select_sql: "SELECT files.*, artists.name AS artist, albums.name AS album \
                 FROM files \
                 LEFT JOIN artists ON files.artist_id = artists.id \
                 LEFT JOIN albums ON files.album_id = albums.id \
                 WHERE files.media_type = 2",
};

fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "ALTER TABLE files ADD COLUMN bucket_id TEXT;\
         ALTER TABLE files ADD COLUMN bucket_display_name TEXT;\
         CREATE INDEX idx_files_bucket ON files(bucket_id);",
    )?;
    Ok(())
}

fn migrate_v2_to_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "ALTER TABLE files ADD COLUMN title_resource TEXT;\
         DROP VIEW IF EXISTS artist_info;\
         DROP VIEW IF EXISTS album_info;\
         DROP VIEW IF EXISTS audio;",
    )?;
    for view in [&ARTIST_INFO_VIEW, &ALBUM_INFO_VIEW, &AUDIO_VIEW] {
        conn.execute(
            &format!("CREATE VIEW {} AS {};", view.name, view.select_sql),
            [],
        )?;
    }
    Ok(())
}

/// Versions below this are recreated from scratch instead of migrated;
/// the data loss is accepted, a rescan repopulates the index.
pub const MIN_INCREMENTAL_VERSION: usize = 1;

pub const MEDIA_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[],
        views: &[],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[],
        views: &[],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[],
        views: &[],
        migration: Some(migrate_v1_to_v2),
    },
    VersionedSchema {
        version: 3,
        tables: &[
            FILES_TABLE,
            ARTISTS_TABLE,
            ALBUMS_TABLE,
            THUMBNAILS_TABLE,
            PLAYLIST_MEMBERS_TABLE,
            GENRES_TABLE,
            GENRE_MEMBERS_TABLE,
            LOG_TABLE,
        ],
        views: &[ARTIST_INFO_VIEW, ALBUM_INFO_VIEW, AUDIO_VIEW],
        migration: Some(migrate_v2_to_v3),
    },
];

pub fn latest_schema() -> &'static VersionedSchema {
    MEDIA_VERSIONED_SCHEMAS
        .last()
        .expect("schema ladder is never empty")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn latest_schema_creates_cleanly() {
        let conn = Connection::open_in_memory().unwrap();
        latest_schema().create(&conn).unwrap();
        latest_schema().validate(&conn).unwrap();
    }

    #[test]
    fn media_type_mime_inference() {
        assert_eq!(MediaType::from_mime("image/jpeg"), MediaType::Image);
        assert_eq!(MediaType::from_mime("AUDIO/mpeg"), MediaType::Audio);
        assert_eq!(MediaType::from_mime("video/mp4"), MediaType::Video);
        assert_eq!(MediaType::from_mime("audio/x-mpegurl"), MediaType::Playlist);
        assert_eq!(MediaType::from_mime("text/plain"), MediaType::None);
    }

    #[test]
    fn audio_view_joins_dimensions() {
        let conn = Connection::open_in_memory().unwrap();
        latest_schema().create(&conn).unwrap();
        conn.execute("INSERT INTO artists (key, name) VALUES ('police', 'The Police')", [])
            .unwrap();
        conn.execute("INSERT INTO albums (key, name) VALUES ('ghost', 'Ghost in the Machine')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO files (path, media_type, artist_id, album_id, title) \
             VALUES ('/music/a.mp3', 2, 1, 1, 'Spirits')",
            [],
        )
        .unwrap();
        let (artist, album): (String, String) = conn
            .query_row("SELECT artist, album FROM audio WHERE title = 'Spirits'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(artist, "The Police");
        assert_eq!(album, "Ghost in the Machine");
    }
}
