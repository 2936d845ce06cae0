pub mod loader;
pub mod schema;

pub use {
    loader::{apply_env_overrides, default_config_path, load_config, parse_file},
    schema::{ClientSettings, ConfigError, EncoreConfig, SpotifyConfig, StorageConfig},
};
