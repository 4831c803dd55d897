//! Volume-scoped media content index.
//!
//! Every attached storage volume is backed by its own embedded SQLite
//! database holding one row per filesystem object, with artist/album
//! dimension tables for audio and a thumbnail sidecar table for images
//! and videos. Abstract resource paths (`{volume}/{collection}[/{id}]`)
//! are routed to permission-scoped queries; inserts pass through a
//! normalization pipeline that derives location, title and dimension
//! fields before the row is written.
//!
//! The entry point is [`store::MediaStore`], constructed once from an
//! [`config::AppConfig`] and the platform collaborator traits.

pub mod canonical;
pub mod config;
pub mod error;
pub mod hidden;
pub mod pipeline;
pub mod router;
pub mod sqlite_persistence;
pub mod store;
pub mod thumbnails;
pub mod values;
pub mod volumes;

pub use config::{AppConfig, CliConfig, FileConfig};
pub use error::{Error, Result};
pub use hidden::MediaScanner;
pub use pipeline::TitleResolver;
pub use router::{Access, Caller, MatchCode, MediaUri, QueryRequest};
pub use store::{
    BatchKind, BatchOperation, Change, ChangeKind, ChangeListener, MediaStore,
};
pub use thumbnails::ThumbnailCodec;
pub use values::ContentValues;
pub use volumes::{VolumeMounts, EXTERNAL_VOLUME, INTERNAL_VOLUME};
