//! The media store facade.
//!
//! One service object owns the volume registry, the normalization caches,
//! the thumbnail worker handle and the registered change listeners. All
//! operations take an explicit [`Caller`]; nothing here is ambient.
//!
//! Locking order, everywhere: normalization caches first, then the volume
//! connection. Multi-volume batches take connections in volume-name order
//! so two concurrent batches cannot deadlock.

mod notifications;

pub use notifications::{Change, ChangeKind, ChangeListener};

use crate::canonical;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::hidden::{self, HideOutcome, MediaScanner};
use crate::pipeline::{self, DimensionCache, DirectoryCache, NormalizeContext, TitleResolver};
use crate::router::{
    build_query, write_scope, Access, Caller, MatchCode, MediaUri, PreparedQuery, QueryRequest,
    WriteScope,
};
use crate::thumbnails::{ThumbnailCodec, ThumbnailRow, ThumbnailService, ThumbnailWorker};
use crate::values::ContentValues;
use crate::volumes::{VolumeDatabase, VolumeMounts, VolumeRegistry, INTERNAL_VOLUME};
use notifications::PendingChanges;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Default)]
struct VolumeCaches {
    dimensions: DimensionCache,
    directories: DirectoryCache,
}

/// A single mutation inside a batch. Batches spanning volumes commit all
/// or nothing.
pub struct BatchOperation {
    pub path: String,
    pub kind: BatchKind,
}

pub enum BatchKind {
    Insert(ContentValues),
    Update {
        values: ContentValues,
        request: QueryRequest,
    },
    Delete {
        request: QueryRequest,
    },
}

pub struct MediaStore {
    config: AppConfig,
    registry: Arc<VolumeRegistry>,
    mounts: Arc<dyn VolumeMounts>,
    resolver: Arc<dyn TitleResolver>,
    scanner: Arc<dyn MediaScanner>,
    thumbnails: ThumbnailService,
    listeners: Mutex<Vec<Arc<dyn ChangeListener>>>,
    caches: Mutex<HashMap<String, VolumeCaches>>,
    scanning_volume: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

impl MediaStore {
    /// Build the store and spawn its thumbnail worker. Must be called from
    /// within a tokio runtime; the internal volume is attached eagerly.
    pub fn new(
        config: AppConfig,
        mounts: Arc<dyn VolumeMounts>,
        resolver: Arc<dyn TitleResolver>,
        scanner: Arc<dyn MediaScanner>,
        codec: Arc<dyn ThumbnailCodec>,
        shutdown: CancellationToken,
    ) -> Result<MediaStore> {
        let registry = Arc::new(VolumeRegistry::new(config.clone(), mounts.clone()));
        registry.attach(INTERNAL_VOLUME)?;

        let (thumbnails, worker) = ThumbnailWorker::new(
            registry.clone(),
            codec,
            config.thumbnails_dir.clone(),
        );
        tokio::spawn(worker.run(shutdown.clone()));

        Ok(MediaStore {
            config,
            registry,
            mounts,
            resolver,
            scanner,
            thumbnails,
            listeners: Mutex::new(Vec::new()),
            caches: Mutex::new(HashMap::new()),
            scanning_volume: Mutex::new(None),
            shutdown,
        })
    }

    pub fn register_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(listener);
    }

    // ----- volume operations (hidden surface) -----

    pub fn attach_volume(&self, caller: &Caller, volume: &str) -> Result<()> {
        self.require_media_stack(caller)?;
        self.registry.attach(volume)?;
        Ok(())
    }

    pub fn detach_volume(&self, caller: &Caller, volume: &str) -> Result<()> {
        self.require_media_stack(caller)?;
        self.registry.detach(volume)?;
        self.caches
            .lock()
            .expect("cache lock poisoned")
            .remove(volume);
        Ok(())
    }

    /// Schema version of the resolved volume database.
    pub fn version(&self, caller: &Caller, volume: &str) -> Result<usize> {
        self.require_media_stack(caller)?;
        let db = self.registry.resolve(volume)?;
        db.schema_version().map_err(Error::Internal)
    }

    pub fn set_scanning_volume(&self, caller: &Caller, volume: Option<&str>) -> Result<()> {
        self.require_media_stack(caller)?;
        *self
            .scanning_volume
            .lock()
            .expect("scanner state lock poisoned") = volume.map(|v| v.to_string());
        Ok(())
    }

    // ----- query -----

    /// Run a read against the matched collection. Cancelling the token
    /// interrupts the running statement.
    pub async fn query(
        &self,
        caller: &Caller,
        path: &str,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentValues>> {
        let uri = MediaUri::parse(path, caller)?;

        match uri.code {
            MatchCode::Version => {
                let version = self.version(caller, &uri.volume)?;
                let mut row = ContentValues::new();
                row.put("version", version as i64);
                return Ok(vec![row]);
            }
            MatchCode::MediaScanner => {
                let mut row = ContentValues::new();
                match self
                    .scanning_volume
                    .lock()
                    .expect("scanner state lock poisoned")
                    .clone()
                {
                    Some(volume) => row.put("volume", volume),
                    None => row.put_null("volume"),
                };
                return Ok(vec![row]);
            }
            _ => {}
        }

        let prepared = build_query(&uri, caller, request)?;
        let db = self.registry.resolve(&uri.volume)?;

        let interrupt = db.interrupt_handle();
        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                cancel.cancelled().await;
                interrupt.interrupt();
            }
        });
        let result = run_select(&db, &prepared);
        watcher.abort();

        if cancel.is_cancelled() {
            return Err(Error::invalid("query cancelled"));
        }
        result
    }

    /// Thumbnail for an image or video row, generating it on the worker if
    /// no usable row exists.
    pub async fn thumbnail(
        &self,
        caller: &Caller,
        path: &str,
    ) -> Result<ThumbnailRow> {
        let uri = MediaUri::parse(path, caller)?;
        let source_id = match (uri.code, uri.id) {
            (MatchCode::ImagesMediaId | MatchCode::VideoMediaId, Some(id)) => id,
            _ => {
                return Err(Error::invalid(
                    "thumbnails exist for single image and video rows only",
                ))
            }
        };
        self.thumbnails.request(&uri.volume, source_id).await
    }

    // ----- mutations -----

    /// Insert one row, returning the path of the new resource.
    pub fn insert(
        &self,
        caller: &Caller,
        path: &str,
        values: ContentValues,
    ) -> Result<MediaUri> {
        let uri = MediaUri::parse(path, caller)?;
        let db = self.registry.resolve(&uri.volume)?;
        let mut caches = self.caches.lock().expect("cache lock poisoned");
        let volume_caches = caches.entry(uri.volume.clone()).or_default();
        let mut pending = PendingChanges::new();

        let id = {
            let conn = db.lock();
            conn.execute_batch("BEGIN IMMEDIATE")?;
            match self.insert_locked(&conn, volume_caches, caller, &uri, values, &mut pending) {
                Ok(id) => {
                    conn.execute_batch("COMMIT")?;
                    id
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
        };
        drop(caches);

        self.flush(pending);
        Ok(inserted_uri(&uri, id))
    }

    /// Insert many rows into one collection inside a single transaction.
    /// Any failure rolls back every row.
    pub fn bulk_insert(
        &self,
        caller: &Caller,
        path: &str,
        rows: Vec<ContentValues>,
    ) -> Result<usize> {
        let uri = MediaUri::parse(path, caller)?;
        let db = self.registry.resolve(&uri.volume)?;
        let mut caches = self.caches.lock().expect("cache lock poisoned");
        let volume_caches = caches.entry(uri.volume.clone()).or_default();
        let mut pending = PendingChanges::new();
        let total = rows.len();

        {
            let conn = db.lock();
            conn.execute_batch("BEGIN IMMEDIATE")?;
            for values in rows {
                if let Err(e) =
                    self.insert_locked(&conn, volume_caches, caller, &uri, values, &mut pending)
                {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
            conn.execute_batch("COMMIT")?;
        }
        drop(caches);

        self.flush(pending);
        Ok(total)
    }

    pub fn update(
        &self,
        caller: &Caller,
        path: &str,
        values: ContentValues,
        request: &QueryRequest,
    ) -> Result<usize> {
        let uri = MediaUri::parse(path, caller)?;
        let db = self.registry.resolve(&uri.volume)?;
        let mut caches = self.caches.lock().expect("cache lock poisoned");
        let volume_caches = caches.entry(uri.volume.clone()).or_default();
        let mut pending = PendingChanges::new();

        let affected = {
            let conn = db.lock();
            conn.execute_batch("BEGIN IMMEDIATE")?;
            match self.update_locked(&conn, volume_caches, caller, &uri, values, request, &mut pending)
            {
                Ok(n) => {
                    conn.execute_batch("COMMIT")?;
                    n
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
        };
        drop(caches);

        self.flush(pending);
        Ok(affected)
    }

    pub fn delete(
        &self,
        caller: &Caller,
        path: &str,
        request: &QueryRequest,
    ) -> Result<usize> {
        let uri = MediaUri::parse(path, caller)?;
        let db = self.registry.resolve(&uri.volume)?;
        let mut caches = self.caches.lock().expect("cache lock poisoned");
        let volume_caches = caches.entry(uri.volume.clone()).or_default();
        let mut pending = PendingChanges::new();

        let affected = {
            let conn = db.lock();
            conn.execute_batch("BEGIN IMMEDIATE")?;
            match self.delete_locked(&conn, volume_caches, caller, &uri, request, &mut pending) {
                Ok(n) => {
                    conn.execute_batch("COMMIT")?;
                    n
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
        };
        drop(caches);

        self.flush(pending);
        Ok(affected)
    }

    /// Apply a batch of mutations across any number of volumes. One
    /// transaction per affected volume, committed only if every operation
    /// on every volume succeeded.
    pub fn apply_batch(
        &self,
        caller: &Caller,
        operations: Vec<BatchOperation>,
    ) -> Result<Vec<usize>> {
        let parsed: Vec<(MediaUri, BatchKind)> = operations
            .into_iter()
            .map(|op| Ok((MediaUri::parse(&op.path, caller)?, op.kind)))
            .collect::<Result<_>>()?;

        let mut volume_names: Vec<String> =
            parsed.iter().map(|(uri, _)| uri.volume.clone()).collect();
        volume_names.sort();
        volume_names.dedup();

        let databases: Vec<Arc<VolumeDatabase>> = volume_names
            .iter()
            .map(|v| self.registry.resolve(v))
            .collect::<Result<_>>()?;

        let mut caches = self.caches.lock().expect("cache lock poisoned");
        for volume in &volume_names {
            caches.entry(volume.clone()).or_default();
        }
        let mut pending = PendingChanges::new();

        // Name-ordered acquisition; every guard held until the joint
        // commit or rollback.
        let guards: Vec<_> = databases.iter().map(|db| db.lock()).collect();
        for conn in &guards {
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }

        let mut results = Vec::with_capacity(parsed.len());
        let mut failure: Option<Error> = None;
        for (uri, kind) in parsed {
            let index = volume_names
                .iter()
                .position(|v| *v == uri.volume)
                .expect("volume collected above");
            let conn = &guards[index];
            let volume_caches = caches
                .get_mut(&uri.volume)
                .expect("caches seeded above");
            let outcome = match kind {
                BatchKind::Insert(values) => self
                    .insert_locked(conn, volume_caches, caller, &uri, values, &mut pending)
                    .map(|_| 1),
                BatchKind::Update { values, request } => self.update_locked(
                    conn,
                    volume_caches,
                    caller,
                    &uri,
                    values,
                    &request,
                    &mut pending,
                ),
                BatchKind::Delete { request } => {
                    self.delete_locked(conn, volume_caches, caller, &uri, &request, &mut pending)
                }
            };
            match outcome {
                Ok(n) => results.push(n),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            for conn in &guards {
                let _ = conn.execute_batch("ROLLBACK");
            }
            return Err(e);
        }
        for conn in &guards {
            conn.execute_batch("COMMIT")?;
        }
        drop(guards);
        drop(caches);

        self.flush(pending);
        Ok(results)
    }

    // ----- maintenance calls -----

    /// Named maintenance entry points: `unhide` (argument: directory whose
    /// marker was removed) and `relocalize` (no argument).
    pub fn call(&self, caller: &Caller, method: &str, argument: Option<&str>) -> Result<()> {
        match method {
            "unhide" => {
                let directory = argument
                    .ok_or_else(|| Error::invalid("unhide requires a directory argument"))?;
                self.unhide(caller, directory)
            }
            "relocalize" => self.relocalize(),
            other => Err(Error::invalid(format!("unknown call method: {}", other))),
        }
    }

    /// A hiding path was reported on `volume`: a `.nomedia` marker file or
    /// a dot-named directory. Wait for it to become visible, then hide the
    /// governed subtree.
    pub async fn process_marker(
        &self,
        volume: &str,
        marker_path: &str,
    ) -> Result<HideOutcome> {
        hidden::await_marker(
            Path::new(marker_path),
            self.config.marker_retry_attempts,
            Duration::from_millis(self.config.marker_retry_delay_ms),
            &self.shutdown,
        )
        .await?;
        let root = self.mounts.root_path(volume);
        let directory = hidden::hiding_root(marker_path, root.as_deref())
            .ok_or_else(|| Error::invalid(format!("not a hiding path: {}", marker_path)))?;

        let db = self.registry.resolve(volume)?;
        let mut pending = PendingChanges::new();
        let outcome = {
            let conn = db.lock();
            conn.execute_batch("BEGIN IMMEDIATE")?;
            match hidden::hide_subtree(&conn, &directory) {
                Ok(outcome) => {
                    conn.execute_batch("COMMIT")?;
                    outcome
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
        };
        pending.push(
            volume,
            format!("{}/files", volume),
            ChangeKind::Update,
        );
        self.flush(pending);
        Ok(outcome)
    }

    /// Sweep one volume's thumbnail rows and files.
    pub fn prune_thumbnails(&self, volume: &str) -> Result<usize> {
        let db = self.registry.resolve(volume)?;
        let conn = db.lock();
        hidden::prune_thumbnails(&conn, &self.config.thumbnails_dir, volume)
    }

    // ----- canonical references -----

    pub fn canonicalize(&self, caller: &Caller, path: &str) -> Result<String> {
        let uri = MediaUri::parse(path, caller)?;
        let db = self.registry.resolve(&uri.volume)?;
        let conn = db.lock();
        canonical::canonicalize(&conn, &uri)
    }

    pub fn uncanonicalize(&self, caller: &Caller, canonical: &str) -> Result<String> {
        let path_part = canonical.split('?').next().unwrap_or(canonical);
        let volume = path_part
            .trim_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::invalid(format!("malformed reference: {}", canonical)))?;
        let db = self.registry.resolve(volume)?;
        let conn = db.lock();
        let uri = canonical::uncanonicalize(&conn, canonical, caller)?;
        Ok(uri.to_path())
    }

    // ----- internals -----

    fn require_media_stack(&self, caller: &Caller) -> Result<()> {
        if caller.may_use_hidden_surface() {
            Ok(())
        } else {
            Err(Error::denied(format!(
                "caller '{}' may not perform volume operations",
                caller.package
            )))
        }
    }

    fn flush(&self, pending: PendingChanges) {
        if pending.is_empty() {
            return;
        }
        let listeners = self
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .clone();
        pending.flush(&listeners);
    }

    fn volume_roots(&self, volume: &str) -> Vec<String> {
        self.mounts.root_path(volume).into_iter().collect()
    }

    fn unhide(&self, _caller: &Caller, directory: &str) -> Result<()> {
        let marker = Path::new(directory).join(hidden::NOMEDIA_MARKER);
        if marker.exists() {
            return Err(Error::IllegalOperation(format!(
                "directory is still hidden by {:?}",
                marker
            )));
        }
        let volume = self
            .volume_for_path(directory)
            .unwrap_or_else(|| INTERNAL_VOLUME.to_string());
        info!("Re-revealing '{}' on volume '{}'", directory, volume);
        self.scanner.scan_subtree(&volume, directory);
        Ok(())
    }

    fn volume_for_path(&self, path: &str) -> Option<String> {
        for db in self.registry.attached() {
            if let Some(root) = self.mounts.root_path(db.volume()) {
                let root = root.trim_end_matches('/');
                if path == root || path.starts_with(&format!("{}/", root)) {
                    return Some(db.volume().to_string());
                }
            }
        }
        None
    }

    /// Re-resolve every stored localizable title against the current
    /// locale, across all attached volumes.
    fn relocalize(&self) -> Result<()> {
        let mut pending = PendingChanges::new();
        for db in self.registry.attached() {
            let conn = db.lock();
            let rows: Vec<(i64, String)> = {
                let mut stmt = conn.prepare(
                    "SELECT id, title_resource FROM files WHERE title_resource IS NOT NULL",
                )?;
                let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                mapped.collect::<std::result::Result<_, _>>()?
            };
            if rows.is_empty() {
                continue;
            }
            conn.execute_batch("BEGIN IMMEDIATE")?;
            for (id, reference) in &rows {
                let (title, _) =
                    pipeline::titles::resolve_title(&*self.resolver, &self.config.locale, reference);
                conn.execute(
                    "UPDATE files SET title = ?1 WHERE id = ?2",
                    params![title, id],
                )?;
            }
            conn.execute_batch("COMMIT")?;
            info!(
                "Re-localized {} titles on volume '{}'",
                rows.len(),
                db.volume()
            );
            pending.push(
                db.volume(),
                format!("{}/files", db.volume()),
                ChangeKind::Update,
            );
        }
        self.flush(pending);
        Ok(())
    }

    fn insert_locked(
        &self,
        conn: &Connection,
        caches: &mut VolumeCaches,
        caller: &Caller,
        uri: &MediaUri,
        mut values: ContentValues,
        pending: &mut PendingChanges,
    ) -> Result<i64> {
        let scope = write_scope(uri.code)?;
        if values.is_empty() {
            return Err(Error::invalid("insert requires at least one value"));
        }

        let id = match scope.table {
            "files" => {
                let roots = self.volume_roots(&uri.volume);
                let mut context = NormalizeContext {
                    resolver: &*self.resolver,
                    locale: &self.config.locale,
                    volume_roots: &roots,
                    caller_package: &caller.package,
                    dimension_cache: &mut caches.dimensions,
                    directory_cache: &mut caches.directories,
                };
                let outcome =
                    pipeline::normalize_insert(conn, &mut context, uri.code, &mut values)?;
                let row_path = values
                    .get_str("path")
                    .map(|s| s.to_string())
                    .ok_or_else(|| Error::invalid("media row requires a path"))?;
                let id = insert_row(conn, "files", &values)?;

                if let Some(genre) = &outcome.genre {
                    let genre_id = pipeline::dimensions::get_or_create_genre(conn, genre)
                        .map_err(Error::Internal)?;
                    conn.execute(
                        "INSERT INTO genre_members (genre_id, audio_id) VALUES (?1, ?2)",
                        params![genre_id, id],
                    )?;
                }
                if outcome.dimension_name_updated {
                    pending.push(
                        &uri.volume,
                        format!("{}/audio/media", uri.volume),
                        ChangeKind::Update,
                    );
                }
                // Inserting the marker itself, or a row inside a dot-named
                // directory, hides everything under the governed root.
                let volume_root = self.mounts.root_path(&uri.volume);
                if let Some(directory) =
                    hidden::hiding_root(&row_path, volume_root.as_deref())
                {
                    let outcome = hidden::hide_subtree(conn, &directory)?;
                    if outcome.rows_hidden > 0 {
                        pending.push(
                            &uri.volume,
                            format!("{}/files", uri.volume),
                            ChangeKind::Update,
                        );
                    }
                }
                id
            }
            "playlist_members" => {
                let playlist_id = uri
                    .id
                    .ok_or_else(|| Error::invalid("playlist member insert without playlist id"))?;
                if values.get_i64("audio_id").is_none() {
                    return Err(Error::invalid("playlist member requires audio_id"));
                }
                values.put("playlist_id", playlist_id);
                if !values.contains("play_order") {
                    let next: i64 = conn.query_row(
                        "SELECT COALESCE(MAX(play_order) + 1, 0) \
                         FROM playlist_members WHERE playlist_id = ?1",
                        params![playlist_id],
                        |row| row.get(0),
                    )?;
                    values.put("play_order", next);
                }
                insert_row(conn, "playlist_members", &values)?
            }
            "genre_members" => {
                let genre_id = uri
                    .id
                    .ok_or_else(|| Error::invalid("genre member insert without genre id"))?;
                if values.get_i64("audio_id").is_none() {
                    return Err(Error::invalid("genre member requires audio_id"));
                }
                values.put("genre_id", genre_id);
                insert_row(conn, "genre_members", &values)?
            }
            "genres" => {
                if values.get_str("name").is_none() {
                    return Err(Error::invalid("genre requires a name"));
                }
                insert_row(conn, "genres", &values)?
            }
            table => insert_row(conn, table, &values)?,
        };

        let new_uri = inserted_uri(uri, id);
        pending.push(&uri.volume, new_uri.to_path(), ChangeKind::Insert);
        debug!("Inserted {} (row {})", new_uri.to_path(), id);
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn update_locked(
        &self,
        conn: &Connection,
        caches: &mut VolumeCaches,
        caller: &Caller,
        uri: &MediaUri,
        mut values: ContentValues,
        request: &QueryRequest,
        pending: &mut PendingChanges,
    ) -> Result<usize> {
        let scope = write_scope(uri.code)?;
        if scope.table == "files" {
            let roots = self.volume_roots(&uri.volume);
            let mut context = NormalizeContext {
                resolver: &*self.resolver,
                locale: &self.config.locale,
                volume_roots: &roots,
                caller_package: &caller.package,
                dimension_cache: &mut caches.dimensions,
                directory_cache: &mut caches.directories,
            };
            let row_id = if uri.code.is_single_row() { uri.id } else { None };
            let outcome =
                pipeline::normalize_update(conn, &mut context, uri.code, row_id, &mut values)?;
            if outcome.dimension_name_updated {
                pending.push(
                    &uri.volume,
                    format!("{}/audio/media", uri.volume),
                    ChangeKind::Update,
                );
            }
        }
        if values.is_empty() {
            return Err(Error::invalid("update requires at least one value"));
        }

        let (where_clause, where_args) = write_predicates(uri, caller, &scope, request)?;
        let assignments: Vec<String> = values
            .columns()
            .map(|column| format!("{} = ?", column))
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            scope.table,
            assignments.join(", ")
        );
        if !where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause);
        }
        let args: Vec<SqlValue> = values
            .iter()
            .map(|(_, v)| v.clone())
            .chain(where_args)
            .collect();
        let affected = conn.execute(&sql, params_from_iter(args.iter()))?;

        if affected > 0 {
            pending.push(&uri.volume, uri.to_path(), ChangeKind::Update);
        }
        Ok(affected)
    }

    fn delete_locked(
        &self,
        conn: &Connection,
        caches: &mut VolumeCaches,
        caller: &Caller,
        uri: &MediaUri,
        request: &QueryRequest,
        pending: &mut PendingChanges,
    ) -> Result<usize> {
        let scope = write_scope(uri.code)?;
        let (where_clause, where_args) = write_predicates(uri, caller, &scope, request)?;

        if scope.table == "files" {
            // Thumbnails of doomed image/video rows go first, files and all.
            let mut sql =
                "SELECT id FROM files WHERE media_type IN (1, 3)".to_string();
            if !where_clause.is_empty() {
                sql.push_str(&format!(" AND ({})", where_clause));
            }
            let visual_ids: Vec<i64> = {
                let mut stmt = conn.prepare(&sql)?;
                let mapped =
                    stmt.query_map(params_from_iter(where_args.iter()), |row| row.get(0))?;
                mapped.collect::<std::result::Result<_, _>>()?
            };
            crate::thumbnails::delete_for_sources(conn, &visual_ids)
                .map_err(Error::Internal)?;
        }

        let mut sql = format!("DELETE FROM {}", scope.table);
        if !where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause);
        }
        let affected = conn.execute(&sql, params_from_iter(where_args.iter()))?;

        if affected > 0 {
            if scope.table == "files" {
                // Removed rows may invalidate any cached dimension or
                // directory id; the caches cannot tell which.
                caches.dimensions.clear();
                caches.directories.clear();
            }
            pending.push(&uri.volume, uri.to_path(), ChangeKind::Delete);
        }
        Ok(affected)
    }
}

/// Single-row form of a collection code, for addressing a fresh insert.
fn inserted_uri(uri: &MediaUri, id: i64) -> MediaUri {
    use MatchCode::*;
    let (code, id, id2) = match uri.code {
        ImagesMedia => (ImagesMediaId, Some(id), None),
        AudioMedia => (AudioMediaId, Some(id), None),
        VideoMedia => (VideoMediaId, Some(id), None),
        AudioPlaylists => (AudioPlaylistsId, Some(id), None),
        AudioGenres => (AudioGenresId, Some(id), None),
        Files => (FilesId, Some(id), None),
        MtpObjects => (MtpObjectsId, Some(id), None),
        AudioPlaylistsIdMembers => (AudioPlaylistsIdMembersId, uri.id, Some(id)),
        ImagesThumbnails => (ImagesThumbnailsId, Some(id), None),
        VideoThumbnails => (VideoThumbnailsId, Some(id), None),
        other => (other, uri.id, uri.id2),
    };
    MediaUri {
        volume: uri.volume.clone(),
        code,
        id,
        id2,
    }
}

/// WHERE clause for a write: collection scope, path ids, ownership, then
/// the caller's own (balanced) selection. A group-by smuggled into a write
/// selection is rejected outright.
fn write_predicates(
    uri: &MediaUri,
    caller: &Caller,
    scope: &WriteScope,
    request: &QueryRequest,
) -> Result<(String, Vec<SqlValue>)> {
    let (selection, group_by) = crate::router::recover_abusive_group_by(
        request.selection.as_deref(),
        request.group_by.as_deref(),
    )?;
    if group_by.is_some() {
        return Err(Error::invalid("writes do not accept a group-by"));
    }

    let mut predicates: Vec<String> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();

    if let Some(base) = scope.base_predicate {
        predicates.push(base.to_string());
    }
    if let Some(parent_column) = scope.parent_id_column {
        let parent_id = uri
            .id
            .ok_or_else(|| Error::invalid("member resource path without parent id"))?;
        predicates.push(format!("{} = ?", parent_column));
        args.push(SqlValue::Integer(parent_id));
    }
    if uri.code.is_single_row() {
        let row_id = if scope.parent_id_column.is_some() {
            uri.id2
        } else {
            uri.id
        }
        .ok_or_else(|| Error::invalid("single-row resource path without id"))?;
        predicates.push("id = ?".to_string());
        args.push(SqlValue::Integer(row_id));
    }
    if caller.access == Access::GrantedIfOwner && scope.has_owner {
        predicates.push("owner_package = ?".to_string());
        args.push(SqlValue::Text(caller.package.clone()));
    }
    if let Some(selection) = selection {
        predicates.push(format!("({})", selection));
        args.extend(request.selection_args.iter().cloned());
    }

    Ok((predicates.join(" AND "), args))
}

fn insert_row(conn: &Connection, table: &str, values: &ContentValues) -> Result<i64> {
    let columns: Vec<&str> = values.columns().collect();
    let placeholders: Vec<&str> = std::iter::repeat("?").take(columns.len()).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders.join(", ")
    );
    let args: Vec<&SqlValue> = values.iter().map(|(_, v)| v).collect();
    conn.execute(&sql, params_from_iter(args))?;
    Ok(conn.last_insert_rowid())
}

fn run_select(db: &VolumeDatabase, prepared: &PreparedQuery) -> Result<Vec<ContentValues>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&prepared.sql)?;
    let columns: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    let rows = stmt.query_map(params_from_iter(prepared.args.iter()), |row| {
        let mut record = ContentValues::new();
        for (index, column) in columns.iter().enumerate() {
            record.put(column.clone(), row.get::<_, SqlValue>(index)?);
        }
        Ok(record)
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::NoOpTitleResolver;
    use crate::thumbnails::ThumbnailCodec;
    use anyhow::Result as AnyResult;
    use std::sync::Mutex as StdMutex;

    struct FakeMounts;

    impl VolumeMounts for FakeMounts {
        fn is_mounted(&self, volume: &str) -> bool {
            volume == "external"
        }
        fn storage_id(&self, volume: &str) -> Option<String> {
            (volume == "external").then(|| "abcd-1234".to_string())
        }
        fn root_path(&self, volume: &str) -> Option<String> {
            match volume {
                INTERNAL_VOLUME => Some("/system/media".to_string()),
                "external" => Some("/storage/abcd-1234".to_string()),
                _ => None,
            }
        }
    }

    struct RecordingScanner {
        requests: StdMutex<Vec<(String, String)>>,
    }

    impl MediaScanner for RecordingScanner {
        fn scan_subtree(&self, volume: &str, path: &str) {
            self.requests
                .lock()
                .unwrap()
                .push((volume.to_string(), path.to_string()));
        }
    }

    struct StubCodec;

    impl ThumbnailCodec for StubCodec {
        fn generate(&self, _source: &Path, output: &Path) -> AnyResult<(u32, u32)> {
            std::fs::write(output, b"thumb")?;
            Ok((96, 96))
        }
    }

    struct RecordingListener {
        seen: StdMutex<Vec<(String, ChangeKind)>>,
    }

    impl ChangeListener for RecordingListener {
        fn on_change(&self, change: &Change) {
            self.seen
                .lock()
                .unwrap()
                .push((change.path.clone(), change.kind));
        }
    }

    fn store(dir: &Path) -> MediaStore {
        let config = AppConfig::resolve(
            &crate::config::CliConfig {
                db_dir: Some(dir.to_path_buf()),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        MediaStore::new(
            config,
            Arc::new(FakeMounts),
            Arc::new(NoOpTitleResolver),
            Arc::new(RecordingScanner {
                requests: StdMutex::new(Vec::new()),
            }),
            Arc::new(StubCodec),
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn granted(package: &str) -> Caller {
        Caller {
            package: package.to_string(),
            is_system_media_stack: false,
            target_api_level: 33,
            access: Access::Granted,
        }
    }

    fn owner_only(package: &str) -> Caller {
        Caller {
            access: Access::GrantedIfOwner,
            ..granted(package)
        }
    }

    #[tokio::test]
    async fn insert_then_query_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let caller = granted("com.example.gallery");

        let mut values = ContentValues::new();
        values.put("path", "/system/media/Pictures/sunset.jpg");
        let uri = store
            .insert(&caller, "internal/images/media", values)
            .unwrap();
        assert_eq!(uri.code, MatchCode::ImagesMediaId);

        let rows = store
            .query(
                &caller,
                "internal/images/media",
                &QueryRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("display_name"), Some("sunset.jpg"));
    }

    #[tokio::test]
    async fn owner_scoped_caller_sees_only_own_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let alice = granted("com.alice");
        let bob = owner_only("com.bob");

        let mut values = ContentValues::new();
        values.put("path", "/system/media/Pictures/alice.jpg");
        store
            .insert(&alice, "internal/images/media", values)
            .unwrap();
        let mut values = ContentValues::new();
        values.put("path", "/system/media/Pictures/bob.jpg");
        store.insert(&bob, "internal/images/media", values).unwrap();

        let rows = store
            .query(
                &bob,
                "internal/images/media",
                &QueryRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("owner_package"), Some("com.bob"));
    }

    #[tokio::test]
    async fn delete_drops_rows_and_notifies_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let caller = granted("com.example.gallery");

        let listener = Arc::new(RecordingListener {
            seen: StdMutex::new(Vec::new()),
        });
        store.register_listener(listener.clone());

        let mut values = ContentValues::new();
        values.put("path", "/system/media/Pictures/a.jpg");
        let uri = store
            .insert(&caller, "internal/images/media", values)
            .unwrap();

        let affected = store
            .delete(&caller, &uri.to_path(), &QueryRequest::default())
            .unwrap();
        assert_eq!(affected, 1);

        let seen = listener.seen.lock().unwrap();
        assert!(seen
            .iter()
            .any(|(path, kind)| *kind == ChangeKind::Delete && path == &uri.to_path()));
    }

    #[tokio::test]
    async fn bulk_insert_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let caller = granted("com.example.gallery");

        let mut good = ContentValues::new();
        good.put("path", "/system/media/Pictures/ok.jpg");
        let mut bad = ContentValues::new();
        bad.put("path", "/system/media/Pictures/trailing/");

        let result = store.bulk_insert(
            &caller,
            "internal/images/media",
            vec![good, bad],
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let rows = store
            .query(
                &caller,
                "internal/images/media",
                &QueryRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn nomedia_insert_hides_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let caller = granted("com.example.scanner");

        let mut values = ContentValues::new();
        values.put("path", "/system/media/Secret/a.jpg");
        store
            .insert(&caller, "internal/images/media", values)
            .unwrap();

        let mut marker = ContentValues::new();
        marker.put("path", "/system/media/Secret/.nomedia");
        store.insert(&caller, "internal/files", marker).unwrap();

        let rows = store
            .query(
                &caller,
                "internal/images/media",
                &QueryRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn version_resource_requires_media_stack() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let outsider = granted("com.example.app");
        assert!(matches!(
            store.version(&outsider, INTERNAL_VOLUME),
            Err(Error::PermissionDenied(_))
        ));

        let stack = Caller {
            is_system_media_stack: true,
            ..granted("com.platform.media")
        };
        assert!(store.version(&stack, INTERNAL_VOLUME).unwrap() > 0);
    }

    #[tokio::test]
    async fn playlist_members_get_sequential_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let caller = granted("com.example.player");

        let mut playlist = ContentValues::new();
        playlist.put("path", "/system/media/Playlists/mix.m3u");
        let playlist_uri = store
            .insert(&caller, "internal/audio/playlists", playlist)
            .unwrap();
        let playlist_id = playlist_uri.id.unwrap();

        let mut track_ids = Vec::new();
        for n in 0..2 {
            let mut track = ContentValues::new();
            track.put("path", format!("/system/media/Music/{}.mp3", n));
            let uri = store.insert(&caller, "internal/audio/media", track).unwrap();
            track_ids.push(uri.id.unwrap());
        }

        let members_path = format!("internal/audio/playlists/{}/members", playlist_id);
        for audio_id in track_ids {
            let mut member = ContentValues::new();
            member.put("audio_id", audio_id);
            store.insert(&caller, &members_path, member).unwrap();
        }

        let rows = store
            .query(
                &caller,
                &members_path,
                &QueryRequest {
                    order_by: Some("play_order".to_string()),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_i64("play_order"), Some(0));
        assert_eq!(rows[1].get_i64("play_order"), Some(1));
    }
}
