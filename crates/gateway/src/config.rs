//! Config loading for the gateway binary.
//!
//! Resolution order: explicit `--config` path, then `$TANDEM_CONFIG`,
//! then `./tandem.toml` if present, then built-in defaults.

use std::path::Path;

use ta_domain::config::Config;

pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = explicit {
        return read_file(path);
    }
    if let Ok(env_path) = std::env::var("TANDEM_CONFIG") {
        return read_file(Path::new(&env_path));
    }
    let default_path = Path::new("tandem.toml");
    if default_path.exists() {
        return read_file(default_path);
    }
    tracing::info!("no config file found, using defaults");
    Ok(Config::default())
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "config loaded");
    Ok(config)
}
