use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result},
    directories::ProjectDirs,
    tracing::debug,
};

use crate::schema::EncoreConfig;

pub const CONFIG_FILE_NAME: &str = "encore.toml";

pub const ENV_CLIENT_ID: &str = "ENCORE_CLIENT_ID";
pub const ENV_REDIRECT_URI: &str = "ENCORE_REDIRECT_URI";
pub const ENV_STORAGE_PATH: &str = "ENCORE_STORAGE_PATH";

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "encore")
}

/// `<config dir>/encore.toml` for the current user, if a home directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Load configuration, then apply environment overrides.
///
/// An explicit `path` must exist. Without one, the default location is used
/// when present and built-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<EncoreConfig> {
    let mut config = match path {
        Some(path) => parse_file(path)?,
        None => match default_config_path() {
            Some(path) if path.is_file() => parse_file(&path)?,
            _ => {
                debug!("no config file found, using defaults");
                EncoreConfig::default()
            },
        },
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

pub fn parse_file(path: &Path) -> Result<EncoreConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Overlay `ENCORE_*` variables. Empty values are ignored.
pub fn apply_env_overrides(config: &mut EncoreConfig, lookup: impl Fn(&str) -> Option<String>) {
    let var = |key: &str| lookup(key).filter(|value| !value.is_empty());

    if let Some(client_id) = var(ENV_CLIENT_ID) {
        config.spotify.client_id = Some(client_id);
    }
    if let Some(redirect_uri) = var(ENV_REDIRECT_URI) {
        config.spotify.redirect_uri = Some(redirect_uri);
    }
    if let Some(path) = var(ENV_STORAGE_PATH) {
        config.storage.path = Some(PathBuf::from(path));
    }
}
