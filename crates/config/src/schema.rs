use std::path::PathBuf;

use {
    serde::{Deserialize, Serialize},
    url::Url,
};

/// Root of `encore.toml`. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoreConfig {
    pub spotify: SpotifyConfig,
    pub storage: StorageConfig,
}

/// Spotify application registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub client_id: Option<String>,
    /// Must match a redirect URI registered for the application.
    pub redirect_uri: Option<String>,
    /// Overrides the accounts-service authorization endpoint.
    pub authorize_url: Option<String>,
    /// Overrides the accounts-service token endpoint.
    pub token_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Token store location. Defaults to `<data dir>/storage.json`.
    pub path: Option<PathBuf>,
}

/// Client identity validated for use in an authorization flow.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub client_id: String,
    /// Exactly as configured; the accounts service compares it byte for byte.
    pub redirect_uri: String,
    pub redirect_url: Url,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing `spotify.{field}` (set it in encore.toml or {env})")]
    Missing {
        field: &'static str,
        env: &'static str,
    },
    #[error("invalid redirect URI {uri:?}")]
    InvalidRedirectUri {
        uri: String,
        #[source]
        source: url::ParseError,
    },
    #[error("could not determine a data directory for the token store")]
    NoDataDir,
}

impl SpotifyConfig {
    pub fn require_client(&self) -> Result<ClientSettings, ConfigError> {
        let client_id = self
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::Missing {
                field: "client_id",
                env: crate::loader::ENV_CLIENT_ID,
            })?;
        let redirect_uri = self
            .redirect_uri
            .clone()
            .filter(|uri| !uri.is_empty())
            .ok_or(ConfigError::Missing {
                field: "redirect_uri",
                env: crate::loader::ENV_REDIRECT_URI,
            })?;
        let redirect_url =
            Url::parse(&redirect_uri).map_err(|source| ConfigError::InvalidRedirectUri {
                uri: redirect_uri.clone(),
                source,
            })?;

        Ok(ClientSettings {
            client_id,
            redirect_uri,
            redirect_url,
        })
    }
}

impl StorageConfig {
    pub fn resolved_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        crate::loader::project_dirs()
            .map(|dirs| dirs.data_dir().join("storage.json"))
            .ok_or(ConfigError::NoDataDir)
    }
}
