//! Volume registry: one embedded database per logical storage volume.
//!
//! The internal volume is singular and permanent; each external/removable
//! volume maps to one database file named by the stable identifier of the
//! underlying medium. External databases are garbage collected by LRU when
//! unused or over the slot cap.

mod database;
mod eviction;
pub mod schema;

pub use database::VolumeDatabase;
pub use schema::MediaType;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use eviction::evict_stale_databases;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

pub const INTERNAL_VOLUME: &str = "internal";
pub const EXTERNAL_VOLUME: &str = "external";
pub const INTERNAL_DATABASE_NAME: &str = "internal.db";

/// Mounted-volume environment: which volumes are currently mounted and the
/// stable storage identifier of each medium. Supplied by the platform, not
/// implemented here.
pub trait VolumeMounts: Send + Sync {
    fn is_mounted(&self, volume: &str) -> bool;
    /// Stable identifier of the medium backing `volume` (e.g. a FAT serial),
    /// or `None` while it cannot be determined.
    fn storage_id(&self, volume: &str) -> Option<String>;
    /// Absolute filesystem mount point of `volume`, when mounted.
    fn root_path(&self, volume: &str) -> Option<String>;
}

/// Process-wide registry of open volume databases. Constructed once at
/// service start and passed by reference; there is no ambient singleton.
pub struct VolumeRegistry {
    config: AppConfig,
    mounts: Arc<dyn VolumeMounts>,
    open: Mutex<HashMap<String, Arc<VolumeDatabase>>>,
}

impl VolumeRegistry {
    pub fn new(config: AppConfig, mounts: Arc<dyn VolumeMounts>) -> Self {
        VolumeRegistry {
            config,
            mounts,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a volume, resolving or creating its backing database.
    /// Idempotent: re-attaching an open volume is a no-op.
    pub fn attach(&self, volume: &str) -> Result<Arc<VolumeDatabase>> {
        {
            let open = self.open.lock().expect("registry lock poisoned");
            if let Some(db) = open.get(volume) {
                return Ok(db.clone());
            }
        }

        let path = if volume == INTERNAL_VOLUME {
            self.config.db_dir.join(INTERNAL_DATABASE_NAME)
        } else {
            if !self.mounts.is_mounted(volume) {
                return Err(Error::VolumeUnavailable(format!(
                    "volume '{}' is not mounted",
                    volume
                )));
            }
            let storage_id = self.mounts.storage_id(volume).ok_or_else(|| {
                Error::VolumeUnavailable(format!(
                    "storage id of volume '{}' cannot be determined",
                    volume
                ))
            })?;
            let path = self.config.db_dir.join(format!("{}.db", storage_id));
            evict_stale_databases(
                &self.config.db_dir,
                &path,
                self.config.max_external_databases,
                Duration::from_secs(self.config.obsolete_database_age_days * 86400),
            );
            path
        };

        let db = Arc::new(
            VolumeDatabase::open(volume, &path, self.config.log_table_limit)
                .map_err(Error::Internal)?,
        );
        info!("Attached volume '{}' backed by {:?}", volume, path);

        let mut open = self.open.lock().expect("registry lock poisoned");
        // Two concurrent attaches can race to this point; keep the first.
        Ok(open.entry(volume.to_string()).or_insert(db).clone())
    }

    /// Detach an external volume, closing and unregistering its database.
    /// The internal volume can never be detached.
    pub fn detach(&self, volume: &str) -> Result<()> {
        if volume == INTERNAL_VOLUME {
            return Err(Error::IllegalOperation(
                "cannot detach the internal volume".to_string(),
            ));
        }
        let db = {
            let mut open = self.open.lock().expect("registry lock poisoned");
            open.remove(volume)
                .ok_or_else(|| Error::not_found(format!("volume '{}'", volume)))?
        };

        // Freshen the file mtime so LRU eviction sees this database as
        // recently used even though it is now closed.
        if let Ok(file) = std::fs::OpenOptions::new().write(true).open(db.path()) {
            if let Err(e) = file.set_modified(SystemTime::now()) {
                warn!("Failed to touch {:?} on detach: {}", db.path(), e);
            }
        }
        info!("Detached volume '{}'", volume);
        Ok(())
    }

    /// Resolve an attached volume by name.
    pub fn resolve(&self, volume: &str) -> Result<Arc<VolumeDatabase>> {
        let open = self.open.lock().expect("registry lock poisoned");
        open.get(volume)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("volume '{}' is not attached", volume)))
    }

    /// Snapshot of attached volumes, internal first.
    pub fn attached(&self) -> Vec<Arc<VolumeDatabase>> {
        let open = self.open.lock().expect("registry lock poisoned");
        let mut dbs: Vec<_> = open.values().cloned().collect();
        dbs.sort_by_key(|db| (db.volume() != INTERNAL_VOLUME, db.volume().to_string()));
        dbs
    }
}
