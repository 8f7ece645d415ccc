//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.geneflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed. Unset work/output locations are filled in
//! under the data directory.

use std::path::Path;

use geneflow_types::config::EngineConfig;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns the defaults.
/// - If the file exists but fails to parse, logs a warning and returns the defaults.
/// - `work_uri` and `output_uri` default to `{data_dir}/work` and `{data_dir}/output`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let mut config = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => match toml::from_str::<EngineConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    "Failed to parse {}: {err}, using defaults",
                    config_path.display()
                );
                EngineConfig::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    };

    if config.work_uri.is_none() {
        config.work_uri = Some(data_dir.join("work").display().to_string());
    }
    if config.output_uri.is_none() {
        config.output_uri = Some(data_dir.join("output").display().to_string());
    }
    config
}
