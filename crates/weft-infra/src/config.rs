//! Engine configuration loader for weft.
//!
//! Reads `weft.toml` from the data directory (`~/.weft/` in production) and
//! deserializes it into [`EngineConfig`]. Falls back to defaults when the file
//! is missing or malformed.

use std::path::Path;

use weft_types::config::EngineConfig;

use crate::sqlite::SqliteOrchestrationStore;

/// Compile rounds run at least one creator at a time.
const MIN_COMPILER_CONCURRENCY: usize = 1;

/// Errors raised while opening the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("failed to create data directory {path}: {source}")]
    DataDir {
        path: String,
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Load engine configuration from `{data_dir}/weft.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config with `compiler_max_concurrency`
///   raised to at least 1.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("weft.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No weft.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(mut config) => {
            config.compiler_max_concurrency = config.compiler_max_concurrency.max(MIN_COMPILER_CONCURRENCY);
            config
        }
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

/// Resolve the database URL.
///
/// Priority:
/// 1. `database_url` from `weft.toml`
/// 2. `sqlite://{data_dir}/weft.db`
pub fn resolve_database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| format!("sqlite://{}/weft.db", data_dir.display()))
}

/// Create the data directory if needed and open the SQLite store the
/// configuration points at.
pub async fn open_store(
    config: &EngineConfig,
    data_dir: &Path,
) -> Result<SqliteOrchestrationStore, InfraError> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .map_err(|source| InfraError::DataDir {
            path: data_dir.display().to_string(),
            source,
        })?;

    let url = resolve_database_url(config, data_dir);
    let store = SqliteOrchestrationStore::open(&url).await?;
    tracing::info!(database_url = %url, "orchestration store opened");
    Ok(store)
}
