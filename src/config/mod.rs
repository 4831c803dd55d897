mod file_config;

pub use file_config::FileConfig;

use anyhow::{bail, Result};
use std::path::PathBuf;

/// Programmatic arguments that can be used for config resolution.
/// Values from a TOML file config override these where present.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub thumbnails_dir: Option<PathBuf>,
    pub locale: Option<String>,
    pub max_external_databases: Option<usize>,
    pub obsolete_database_age_days: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding one database file per attached volume.
    pub db_dir: PathBuf,
    /// Directory where generated thumbnail files are written.
    pub thumbnails_dir: PathBuf,
    /// BCP-47 tag used for localized-title resolution.
    pub locale: String,

    /// External volume databases kept around before LRU eviction kicks in.
    pub max_external_databases: usize,
    /// External databases untouched for longer than this are deleted.
    pub obsolete_database_age_days: u64,

    pub marker_retry_attempts: u32,
    pub marker_retry_delay_ms: u64,

    /// Most-recent entries retained in each volume's diagnostic log table.
    pub log_table_limit: usize,
}

pub const DEFAULT_MAX_EXTERNAL_DATABASES: usize = 3;
pub const DEFAULT_OBSOLETE_DATABASE_AGE_DAYS: u64 = 60;
pub const DEFAULT_MARKER_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_MARKER_RETRY_DELAY_MS: u64 = 200;
pub const DEFAULT_LOG_TABLE_LIMIT: usize = 500;

impl AppConfig {
    /// Resolve configuration from programmatic arguments and optional TOML
    /// file config. TOML values override programmatic values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| anyhow::anyhow!("db_dir must be specified"))?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let thumbnails_dir = file
            .thumbnails_dir
            .map(PathBuf::from)
            .or_else(|| cli.thumbnails_dir.clone())
            .unwrap_or_else(|| db_dir.join("thumbnails"));

        let locale = file
            .locale
            .or_else(|| cli.locale.clone())
            .unwrap_or_else(|| "en-US".to_string());

        let max_external_databases = file
            .max_external_databases
            .or(cli.max_external_databases)
            .unwrap_or(DEFAULT_MAX_EXTERNAL_DATABASES);
        if max_external_databases == 0 {
            bail!("max_external_databases must be at least 1");
        }

        let obsolete_database_age_days = file
            .obsolete_database_age_days
            .or(cli.obsolete_database_age_days)
            .unwrap_or(DEFAULT_OBSOLETE_DATABASE_AGE_DAYS);

        Ok(AppConfig {
            db_dir,
            thumbnails_dir,
            locale,
            max_external_databases,
            obsolete_database_age_days,
            marker_retry_attempts: file
                .marker_retry_attempts
                .unwrap_or(DEFAULT_MARKER_RETRY_ATTEMPTS),
            marker_retry_delay_ms: file
                .marker_retry_delay_ms
                .unwrap_or(DEFAULT_MARKER_RETRY_DELAY_MS),
            log_table_limit: file.log_table_limit.unwrap_or(DEFAULT_LOG_TABLE_LIMIT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_requires_db_dir() {
        let cli = CliConfig::default();
        assert!(AppConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn resolve_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cli = CliConfig {
            db_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.max_external_databases, 3);
        assert_eq!(config.obsolete_database_age_days, 60);
        assert_eq!(config.locale, "en-US");
        assert_eq!(config.thumbnails_dir, dir.path().join("thumbnails"));
    }

    #[test]
    fn file_config_overrides_cli() {
        let dir = tempfile::tempdir().unwrap();
        let cli = CliConfig {
            db_dir: Some(dir.path().to_path_buf()),
            locale: Some("en-US".to_string()),
            ..Default::default()
        };
        let file: FileConfig = toml::from_str(
            r#"
            locale = "de-DE"
            max_external_databases = 5
            "#,
        )
        .unwrap();
        let config = AppConfig::resolve(&cli, Some(file)).unwrap();
        assert_eq!(config.locale, "de-DE");
        assert_eq!(config.max_external_databases, 5);
    }
}
