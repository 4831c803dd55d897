use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override programmatic defaults)
    pub db_dir: Option<String>,
    pub thumbnails_dir: Option<String>,
    pub locale: Option<String>,

    // Volume database housekeeping
    pub max_external_databases: Option<usize>,
    pub obsolete_database_age_days: Option<u64>,

    // Hidden-marker filesystem race handling
    pub marker_retry_attempts: Option<u32>,
    pub marker_retry_delay_ms: Option<u64>,

    // Diagnostic log table
    pub log_table_limit: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
