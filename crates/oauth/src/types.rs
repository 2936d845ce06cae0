use {secrecy::SecretString, serde::Deserialize};

pub const SPOTIFY_AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";
pub const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Permissions requested on every authorization, in request order.
/// `user-follow-modify` is listed twice; the accounts service tolerates it.
pub const SPOTIFY_SCOPES: &[&str] = &[
    "streaming",
    "user-read-private",
    "user-read-email",
    "user-read-recently-played",
    "user-read-currently-playing",
    "user-read-playback-state",
    "user-modify-playback-state",
    "user-library-modify",
    "user-follow-modify",
    "playlist-read-private",
    "playlist-modify-public",
    "playlist-modify-private",
    "playlist-read-collaborative",
    "user-library-read",
    "user-read-playback-position",
    "user-top-read",
    "user-follow-modify",
    "user-follow-read",
    "ugc-image-upload",
];

/// OAuth 2.0 provider configuration.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

impl OAuthConfig {
    /// Spotify accounts-service endpoints with the fixed scope set.
    pub fn spotify(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            auth_url: SPOTIFY_AUTHORIZE_URL.to_string(),
            token_url: SPOTIFY_TOKEN_URL.to_string(),
            redirect_uri: redirect_uri.into(),
            scopes: SPOTIFY_SCOPES.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

/// PKCE challenge pair. Only the verifier is ever persisted.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

/// Body returned for the `authorization_code` grant.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: SecretString,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds.
    pub expires_in: u64,
    pub refresh_token: SecretString,
}

/// Body returned for the `refresh_token` grant.
///
/// A rotated refresh token is only honoured under the camelCase `refreshToken` key.
/// The accounts service sends it as `refresh_token`, which is captured separately so
/// the mismatch can be reported without being acted upon.
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub access_token: SecretString,
    /// Lifetime in seconds.
    pub expires_in: u64,
    #[serde(default, rename = "refreshToken")]
    pub rotated_refresh_token: Option<SecretString>,
    #[serde(default, rename = "refresh_token")]
    pub unused_refresh_token: Option<SecretString>,
}
