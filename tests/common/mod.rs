//! Shared harness for integration tests: a full store over temp
//! directories with recording fakes for the platform collaborators.

use mediastore::{
    AppConfig, CliConfig, MediaScanner, MediaStore, ThumbnailCodec, TitleResolver, VolumeMounts,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Mounted-volume fake backed by real directories under the test's temp
/// root, so marker files and thumbnails hit an actual filesystem.
pub struct TestMounts {
    roots: HashMap<String, PathBuf>,
}

impl VolumeMounts for TestMounts {
    fn is_mounted(&self, volume: &str) -> bool {
        self.roots.contains_key(volume)
    }
    fn storage_id(&self, volume: &str) -> Option<String> {
        (volume == "external").then(|| "abcd-1234".to_string())
    }
    fn root_path(&self, volume: &str) -> Option<String> {
        self.roots
            .get(volume)
            .map(|p| p.to_string_lossy().into_owned())
    }
}

pub struct RecordingScanner {
    pub requests: Mutex<Vec<(String, String)>>,
}

impl MediaScanner for RecordingScanner {
    fn scan_subtree(&self, volume: &str, path: &str) {
        self.requests
            .lock()
            .unwrap()
            .push((volume.to_string(), path.to_string()));
    }
}

pub struct StubCodec;

impl ThumbnailCodec for StubCodec {
    fn generate(&self, _source: &Path, output: &Path) -> anyhow::Result<(u32, u32)> {
        std::fs::write(output, b"thumbnail-bytes")?;
        Ok((96, 96))
    }
}

pub struct MapResolver {
    pub entries: HashMap<String, String>,
}

impl TitleResolver for MapResolver {
    fn resolve(&self, resource: &str, _locale: &str) -> anyhow::Result<String> {
        self.entries
            .get(resource)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no entry for '{}'", resource))
    }
}

pub struct TestEnv {
    pub store: MediaStore,
    pub scanner: Arc<RecordingScanner>,
    pub shutdown: CancellationToken,
    pub internal_root: PathBuf,
    pub external_root: PathBuf,
    pub thumbnails_dir: PathBuf,
    // Held for the lifetime of the test; dropping it deletes everything.
    _dir: TempDir,
}

impl TestEnv {
    pub fn new() -> TestEnv {
        Self::with_resolver(Arc::new(MapResolver {
            entries: HashMap::new(),
        }))
    }

    pub fn with_resolver(resolver: Arc<dyn TitleResolver>) -> TestEnv {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("databases");
        let internal_root = dir.path().join("media_internal");
        let external_root = dir.path().join("media_external");
        for path in [&db_dir, &internal_root, &external_root] {
            std::fs::create_dir_all(path).unwrap();
        }

        let config = AppConfig::resolve(
            &CliConfig {
                db_dir: Some(db_dir),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        let thumbnails_dir = config.thumbnails_dir.clone();

        let mut roots = HashMap::new();
        roots.insert("internal".to_string(), internal_root.clone());
        roots.insert("external".to_string(), external_root.clone());

        let scanner = Arc::new(RecordingScanner {
            requests: Mutex::new(Vec::new()),
        });
        let shutdown = CancellationToken::new();
        let store = MediaStore::new(
            config,
            Arc::new(TestMounts { roots }),
            resolver,
            scanner.clone(),
            Arc::new(StubCodec),
            shutdown.clone(),
        )
        .unwrap();

        TestEnv {
            store,
            scanner,
            shutdown,
            internal_root,
            external_root,
            thumbnails_dir,
            _dir: dir,
        }
    }

    /// Path of a file under the internal volume root, as stored in rows.
    pub fn internal_path(&self, relative: &str) -> String {
        self.internal_root.join(relative).to_string_lossy().into_owned()
    }
}

pub fn granted(package: &str) -> mediastore::Caller {
    mediastore::Caller {
        package: package.to_string(),
        is_system_media_stack: false,
        target_api_level: 33,
        access: mediastore::Access::Granted,
    }
}

pub fn media_stack() -> mediastore::Caller {
    mediastore::Caller {
        package: "com.platform.media".to_string(),
        is_system_media_stack: true,
        target_api_level: 33,
        access: mediastore::Access::Granted,
    }
}
