pub mod callback_server;
pub mod error;
pub mod flow;
pub mod pkce;
pub mod storage;
pub mod types;

pub use callback_server::CallbackServer;
pub use error::TokenRequestError;
pub use flow::{AuthorizationRequest, Navigator, OAuthFlow, authorization_code};
pub use storage::{ExpiringEntry, ExpiringStore, FileStore, KeyValueStore, MemoryStore};
pub use types::{OAuthConfig, PkceChallenge, SPOTIFY_SCOPES};
