//! Thumbnail generation worker.
//!
//! A single task drains two queues: urgent requests (a caller is blocked on
//! the result) and background regeneration. Urgent work always preempts
//! background work between items. Callers await a oneshot reply; the only
//! timeout is cancellation of the whole worker.

use super::{thumbnail_path, ThumbnailCodec, ThumbnailRow};
use crate::error::{Error, Result};
use crate::volumes::VolumeRegistry;
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A request for one source row's thumbnail.
#[derive(Debug)]
pub struct ThumbnailRequest {
    pub volume: String,
    pub source_id: i64,
    reply: Option<oneshot::Sender<Result<ThumbnailRow>>>,
}

/// Submission handle shared by the store. Cheap to clone.
#[derive(Clone)]
pub struct ThumbnailService {
    urgent_tx: mpsc::UnboundedSender<ThumbnailRequest>,
    background_tx: mpsc::UnboundedSender<ThumbnailRequest>,
}

impl ThumbnailService {
    /// Request a thumbnail and wait for it. Used on the read path when a
    /// thumbnail row is missing.
    pub async fn request(&self, volume: &str, source_id: i64) -> Result<ThumbnailRow> {
        let (tx, rx) = oneshot::channel();
        let request = ThumbnailRequest {
            volume: volume.to_string(),
            source_id,
            reply: Some(tx),
        };
        self.urgent_tx
            .send(request)
            .map_err(|_| Error::invalid("thumbnail worker is stopped"))?;
        rx.await
            .map_err(|_| Error::invalid("thumbnail worker dropped the request"))?
    }

    /// Queue a regeneration nobody is waiting on.
    pub fn schedule_background(&self, volume: &str, source_id: i64) {
        let request = ThumbnailRequest {
            volume: volume.to_string(),
            source_id,
            reply: None,
        };
        if self.background_tx.send(request).is_err() {
            debug!("Dropping background thumbnail request, worker is stopped");
        }
    }
}

pub struct ThumbnailWorker {
    registry: Arc<VolumeRegistry>,
    codec: Arc<dyn ThumbnailCodec>,
    thumbnails_dir: PathBuf,
    urgent_rx: mpsc::UnboundedReceiver<ThumbnailRequest>,
    background_rx: mpsc::UnboundedReceiver<ThumbnailRequest>,
}

impl ThumbnailWorker {
    /// Build the worker and its submission handle. The caller spawns
    /// [`ThumbnailWorker::run`] on its runtime.
    pub fn new(
        registry: Arc<VolumeRegistry>,
        codec: Arc<dyn ThumbnailCodec>,
        thumbnails_dir: PathBuf,
    ) -> (ThumbnailService, ThumbnailWorker) {
        let (urgent_tx, urgent_rx) = mpsc::unbounded_channel();
        let (background_tx, background_rx) = mpsc::unbounded_channel();
        let service = ThumbnailService {
            urgent_tx,
            background_tx,
        };
        let worker = ThumbnailWorker {
            registry,
            codec,
            thumbnails_dir,
            urgent_rx,
            background_rx,
        };
        (service, worker)
    }

    /// Main processing loop, call from a spawned task. Urgent requests are
    /// drained before any background item is picked up.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Thumbnail worker starting");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Thumbnail worker shutting down");
                    break;
                }
                Some(request) = self.urgent_rx.recv() => {
                    self.process(request);
                }
                Some(request) = self.background_rx.recv() => {
                    self.process(request);
                }
                else => break,
            }
        }
        info!("Thumbnail worker stopped");
    }

    fn process(&self, mut request: ThumbnailRequest) {
        let result = self.fulfill(&request);
        if let Err(e) = &result {
            warn!(
                "Thumbnail for {}/{} failed: {}",
                request.volume, request.source_id, e
            );
        }
        if let Some(reply) = request.reply.take() {
            // A caller that gave up waiting is not an error.
            let _ = reply.send(result);
        }
    }

    fn fulfill(&self, request: &ThumbnailRequest) -> Result<ThumbnailRow> {
        let db = self.registry.resolve(&request.volume)?;
        let conn = db.lock();

        if let Some(existing) =
            super::find_by_source(&conn, request.source_id).map_err(Error::Internal)?
        {
            if Path::new(&existing.path).exists() {
                return Ok(existing);
            }
            // Row without a file; fall through and regenerate.
        }

        let source: Option<(String, i64)> = conn
            .query_row(
                "SELECT path, media_type FROM files WHERE id = ?1",
                params![request.source_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (source_path, kind) = source.ok_or_else(|| {
            Error::not_found(format!("media row {} on '{}'", request.source_id, request.volume))
        })?;

        let output = thumbnail_path(&self.thumbnails_dir, &request.volume, request.source_id);
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Internal(anyhow::Error::new(e)))?;
        }
        let (width, height) = self
            .codec
            .generate(Path::new(&source_path), &output)
            .map_err(Error::Internal)?;

        let row = super::record(
            &conn,
            request.source_id,
            kind,
            &output.to_string_lossy(),
            width,
            height,
        )
        .map_err(Error::Internal)?;
        debug!(
            "Generated thumbnail for {}/{} at {:?}",
            request.volume, request.source_id, output
        );
        Ok(row)
    }
}
