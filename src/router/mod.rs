//! URI routing: abstract resource path -> (volume, match code) plus the
//! permission-scoped query shape for that match.
//!
//! Two ordered matchers back the router: the PUBLIC surface (stable,
//! externally documented collection shapes) and the HIDDEN surface
//! (device-transfer object references, raw volume operations, scanner and
//! version pseudo-resources). Hidden matches are refused unless the caller
//! belongs to the platform media stack or targets a legacy API level that
//! historically relied on them.

mod projection;
mod query;
mod selection;

pub use projection::validate_projection;
pub use query::{build_query, table_for_write, write_scope, PreparedQuery, QueryRequest, WriteScope};
pub use selection::{maybe_balance, recover_abusive_group_by};

use crate::error::{Error, Result};

/// Callers targeting this API level or below retain access to the hidden
/// surface for compatibility. A policy knob, not a security boundary.
pub const LAST_API_LEVEL_WITH_HIDDEN_ACCESS: u32 = 28;

/// Well-known internal callers that make up the platform media stack.
const MEDIA_STACK_CALLERS: &[&str] = &[
    "com.platform.media",
    "com.platform.media.module",
    "com.platform.mtp",
    "com.platform.downloads",
];

/// Identity and permission outcome of the calling application, as handed
/// to us by the platform's permission primitives.
#[derive(Debug, Clone)]
pub struct Caller {
    pub package: String,
    pub is_system_media_stack: bool,
    pub target_api_level: u32,
    pub access: Access,
}

/// Outcome of the platform permission check for this caller. `Denied`
/// never reaches the store; the platform throws before calling in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Full collection access.
    Granted,
    /// Row-level filter: only rows recorded as owned by this caller.
    GrantedIfOwner,
}

impl Caller {
    pub fn may_use_hidden_surface(&self) -> bool {
        self.is_system_media_stack
            || MEDIA_STACK_CALLERS.contains(&self.package.as_str())
            || self.target_api_level <= LAST_API_LEVEL_WITH_HIDDEN_ACCESS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchCode {
    ImagesMedia,
    ImagesMediaId,
    ImagesThumbnails,
    ImagesThumbnailsId,
    AudioMedia,
    AudioMediaId,
    AudioArtists,
    AudioArtistsId,
    AudioArtistsIdAlbums,
    AudioAlbums,
    AudioAlbumsId,
    AudioGenres,
    AudioGenresId,
    AudioGenresIdMembers,
    AudioPlaylists,
    AudioPlaylistsId,
    AudioPlaylistsIdMembers,
    AudioPlaylistsIdMembersId,
    VideoMedia,
    VideoMediaId,
    VideoThumbnails,
    VideoThumbnailsId,
    Files,
    FilesId,
    // Hidden surface.
    MtpObjects,
    MtpObjectsId,
    AttachVolume,
    DetachVolume,
    Version,
    MediaScanner,
}

impl MatchCode {
    pub fn is_hidden(self) -> bool {
        matches!(
            self,
            MatchCode::MtpObjects
                | MatchCode::MtpObjectsId
                | MatchCode::AttachVolume
                | MatchCode::DetachVolume
                | MatchCode::Version
                | MatchCode::MediaScanner
        )
    }

    /// Match codes addressing exactly one row.
    pub fn is_single_row(self) -> bool {
        matches!(
            self,
            MatchCode::ImagesMediaId
                | MatchCode::ImagesThumbnailsId
                | MatchCode::AudioMediaId
                | MatchCode::AudioArtistsId
                | MatchCode::AudioAlbumsId
                | MatchCode::AudioGenresId
                | MatchCode::AudioPlaylistsId
                | MatchCode::AudioPlaylistsIdMembersId
                | MatchCode::VideoMediaId
                | MatchCode::VideoThumbnailsId
                | MatchCode::FilesId
                | MatchCode::MtpObjectsId
        )
    }
}

/// `#` stands for a numeric id segment.
const PUBLIC_MATCHES: &[(&str, MatchCode)] = &[
    ("images/media", MatchCode::ImagesMedia),
    ("images/media/#", MatchCode::ImagesMediaId),
    ("images/thumbnails", MatchCode::ImagesThumbnails),
    ("images/thumbnails/#", MatchCode::ImagesThumbnailsId),
    ("audio/media", MatchCode::AudioMedia),
    ("audio/media/#", MatchCode::AudioMediaId),
    ("audio/artists", MatchCode::AudioArtists),
    ("audio/artists/#", MatchCode::AudioArtistsId),
    ("audio/artists/#/albums", MatchCode::AudioArtistsIdAlbums),
    ("audio/albums", MatchCode::AudioAlbums),
    ("audio/albums/#", MatchCode::AudioAlbumsId),
    ("audio/genres", MatchCode::AudioGenres),
    ("audio/genres/#", MatchCode::AudioGenresId),
    ("audio/genres/#/members", MatchCode::AudioGenresIdMembers),
    ("audio/playlists", MatchCode::AudioPlaylists),
    ("audio/playlists/#", MatchCode::AudioPlaylistsId),
    ("audio/playlists/#/members", MatchCode::AudioPlaylistsIdMembers),
    (
        "audio/playlists/#/members/#",
        MatchCode::AudioPlaylistsIdMembersId,
    ),
    ("video/media", MatchCode::VideoMedia),
    ("video/media/#", MatchCode::VideoMediaId),
    ("video/thumbnails", MatchCode::VideoThumbnails),
    ("video/thumbnails/#", MatchCode::VideoThumbnailsId),
    ("files", MatchCode::Files),
    ("files/#", MatchCode::FilesId),
];

const HIDDEN_MATCHES: &[(&str, MatchCode)] = &[
    ("object", MatchCode::MtpObjects),
    ("object/#", MatchCode::MtpObjectsId),
    ("attach_volume", MatchCode::AttachVolume),
    ("detach_volume", MatchCode::DetachVolume),
    ("version", MatchCode::Version),
    ("media_scanner", MatchCode::MediaScanner),
];

/// A parsed resource path: `{volume}/{collection}[/{id}[/{sub}[/{id2}]]]`.
#[derive(Debug, Clone)]
pub struct MediaUri {
    pub volume: String,
    pub code: MatchCode,
    pub id: Option<i64>,
    pub id2: Option<i64>,
}

impl MediaUri {
    /// Parse and match a resource path, enforcing the hidden-surface
    /// policy against the caller.
    pub fn parse(path: &str, caller: &Caller) -> Result<MediaUri> {
        let path = path.trim_matches('/');
        let mut segments = path.split('/');
        let volume = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::invalid(format!("malformed resource path: {}", path)))?;
        let rest: Vec<&str> = segments.collect();
        if rest.is_empty() {
            return Err(Error::invalid(format!(
                "resource path has no collection: {}",
                path
            )));
        }

        let (code, ids) = match_segments(&rest)
            .ok_or_else(|| Error::not_found(format!("no match for resource path: {}", path)))?;

        if code.is_hidden() && !caller.may_use_hidden_surface() {
            return Err(Error::denied(format!(
                "caller '{}' may not use hidden resource {}",
                caller.package, path
            )));
        }

        Ok(MediaUri {
            volume: volume.to_string(),
            code,
            id: ids.first().copied(),
            id2: ids.get(1).copied(),
        })
    }

    /// Render back to the abstract path form.
    pub fn to_path(&self) -> String {
        let pattern = PUBLIC_MATCHES
            .iter()
            .chain(HIDDEN_MATCHES.iter())
            .find(|(_, c)| *c == self.code)
            .map(|(p, _)| *p)
            .unwrap_or_default();
        let mut ids = [self.id, self.id2].into_iter().flatten();
        let rendered: Vec<String> = pattern
            .split('/')
            .map(|segment| {
                if segment == "#" {
                    ids.next().map(|id| id.to_string()).unwrap_or_default()
                } else {
                    segment.to_string()
                }
            })
            .collect();
        format!("{}/{}", self.volume, rendered.join("/"))
    }
}

fn match_segments(segments: &[&str]) -> Option<(MatchCode, Vec<i64>)> {
    for (pattern, code) in PUBLIC_MATCHES.iter().chain(HIDDEN_MATCHES.iter()) {
        let parts: Vec<&str> = pattern.split('/').collect();
        if parts.len() != segments.len() {
            continue;
        }
        let mut ids = Vec::new();
        let mut matched = true;
        for (part, segment) in parts.iter().zip(segments.iter()) {
            if *part == "#" {
                match segment.parse::<i64>() {
                    Ok(id) => ids.push(id),
                    Err(_) => {
                        matched = false;
                        break;
                    }
                }
            } else if part != segment {
                matched = false;
                break;
            }
        }
        if matched {
            return Some((*code, ids));
        }
    }
    None
}
