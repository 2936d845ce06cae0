//! Authorization-code + PKCE flow against the Spotify accounts service.
//!
//! The flow is split across a navigation boundary: [`OAuthFlow::begin`] persists the
//! verifier and builds the authorization URL, and [`OAuthFlow::request_token`] later
//! trades the returned code plus that same verifier for tokens. The stored verifier
//! is the only state carried between the two phases.

use std::sync::Arc;

use {
    anyhow::{Context, Result},
    secrecy::{ExposeSecret, SecretString},
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    error::TokenRequestError,
    pkce::generate_verifier,
    storage::{
        ACCESS_TOKEN_KEY, CODE_VERIFIER_KEY, ExpiringStore, KeyValueStore, REFRESH_TOKEN_KEY,
    },
    types::{OAuthConfig, PkceChallenge, RefreshResponse, TokenResponse},
};

/// The token endpoint reports `expires_in` in seconds; the cache TTL is that value
/// times 3600 in the storage layer's millisecond unit.
const EXPIRES_IN_TO_TTL: u64 = 60 * 60;

fn cache_ttl(expires_in: u64) -> u64 {
    expires_in.saturating_mul(EXPIRES_IN_TO_TTL)
}

/// Performs a full-page navigation to the authorization endpoint.
pub trait Navigator: Send + Sync {
    fn navigate(&self, url: &Url) -> Result<()>;
}

/// A prepared authorization redirect.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: Url,
    pub pkce: PkceChallenge,
}

pub struct OAuthFlow {
    config: OAuthConfig,
    store: Arc<dyn KeyValueStore>,
    client: reqwest::Client,
}

impl OAuthFlow {
    pub fn new(config: OAuthConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            config,
            store,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Ensure a verifier is stored and build the authorization URL for it.
    ///
    /// An already stored verifier is reused, so repeated logins before a
    /// completed exchange all share one verifier.
    pub fn begin(&self) -> Result<AuthorizationRequest> {
        let verifier = match self.store.get(CODE_VERIFIER_KEY)? {
            Some(existing) if !existing.is_empty() => {
                debug!("reusing stored code verifier");
                existing
            },
            _ => {
                let fresh = generate_verifier();
                self.store.set(CODE_VERIFIER_KEY, &fresh)?;
                debug!("stored new code verifier");
                fresh
            },
        };

        let pkce = PkceChallenge::from_verifier(verifier);
        let mut url = Url::parse(&self.config.auth_url)
            .with_context(|| format!("invalid authorization URL: {}", self.config.auth_url))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("response_type", "code")
            .append_pair("code_challenge_method", "S256")
            .append_pair("code_challenge", &pkce.challenge);

        Ok(AuthorizationRequest { url, pkce })
    }

    /// Persist the verifier, then navigate to the authorization endpoint.
    pub fn log_in(&self, navigator: &dyn Navigator) -> Result<()> {
        let request = self.begin()?;
        info!(endpoint = %self.config.auth_url, "redirecting to authorization endpoint");
        navigator.navigate(&request.url)
    }

    /// Exchange an authorization code for tokens and cache them.
    pub async fn request_token(&self, code: &str) -> Result<SecretString> {
        let verifier = self.store.get(CODE_VERIFIER_KEY)?.unwrap_or_else(|| {
            warn!("no stored code verifier; the token endpoint will reject this exchange");
            String::new()
        });

        let params = [
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("code_verifier", verifier.as_str()),
            ("grant_type", "authorization_code"),
        ];

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .context("failed to send token exchange request")?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    debug!(%e, "failed to read token error body");
                    format!("<unreadable body: {e}>")
                },
            };
            return Err(TokenRequestError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .context("failed to parse token response")?;

        self.store.set_with_expiry(
            ACCESS_TOKEN_KEY,
            tokens.access_token.expose_secret(),
            cache_ttl(tokens.expires_in),
        )?;
        self.store
            .set(REFRESH_TOKEN_KEY, tokens.refresh_token.expose_secret())?;

        info!(
            expires_in = tokens.expires_in,
            token_type = tokens.token_type.as_deref().unwrap_or("unknown"),
            "exchanged authorization code for tokens"
        );
        Ok(tokens.access_token)
    }

    /// Cached access token, or the result of completing a pending login.
    ///
    /// `current_url` is the URL the user agent landed on after authorization. When
    /// nothing is cached and it carries no `code`, the result is `None` and the
    /// caller should offer a login.
    pub async fn get_token(&self, current_url: Option<&Url>) -> Result<Option<SecretString>> {
        if let Some(token) = self.store.get_with_expiry(ACCESS_TOKEN_KEY)? {
            debug!("using cached access token");
            return Ok(Some(SecretString::new(token)));
        }

        let Some(code) = current_url.and_then(authorization_code) else {
            debug!("no cached access token and no authorization code");
            return Ok(None);
        };

        self.request_token(&code).await.map(Some)
    }

    /// Trade the stored refresh token for a new access token.
    ///
    /// The response status is not checked; a body without `access_token` and
    /// `expires_in` fails to parse and that error is returned.
    pub async fn get_refresh_token(&self) -> Result<SecretString> {
        let refresh_token = self.store.get(REFRESH_TOKEN_KEY)?.unwrap_or_else(|| {
            warn!("no stored refresh token; the token endpoint will reject this refresh");
            String::new()
        });

        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .context("failed to send token refresh request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read token refresh response")?;
        let refreshed: RefreshResponse = serde_json::from_str(&body)
            .with_context(|| format!("failed to parse token refresh response (HTTP {status})"))?;

        self.store.set_with_expiry(
            ACCESS_TOKEN_KEY,
            refreshed.access_token.expose_secret(),
            cache_ttl(refreshed.expires_in),
        )?;

        if let Some(rotated) = &refreshed.rotated_refresh_token {
            self.store.set(REFRESH_TOKEN_KEY, rotated.expose_secret())?;
            debug!("stored rotated refresh token");
        } else if refreshed.unused_refresh_token.is_some() {
            // Only `refreshToken` is honoured. Confirm the provider's schema before
            // switching this to `refresh_token`.
            warn!("refresh response carried `refresh_token`; keeping the previously stored one");
        }

        info!(expires_in = refreshed.expires_in, "refreshed access token");
        Ok(refreshed.access_token)
    }
}

/// First non-empty `code` query parameter of `url`.
pub fn authorization_code(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .filter(|code| !code.is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use mockito::Matcher;

    use {
        super::*,
        crate::storage::{ExpiringEntry, MemoryStore, now_ms},
    };

    const REDIRECT_URI: &str = "http://127.0.0.1:8888/callback";

    fn flow_for(server: &mockito::ServerGuard) -> (OAuthFlow, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = OAuthConfig {
            token_url: format!("{}/api/token", server.url()),
            ..OAuthConfig::spotify("client-123", REDIRECT_URI)
        };
        (OAuthFlow::new(config, store.clone()), store)
    }

    fn landed(query: &str) -> Url {
        Url::parse(&format!("{REDIRECT_URI}?{query}")).unwrap()
    }

    /// Records the verifier visible in storage at the moment of navigation.
    struct RecordingNavigator {
        store: Arc<MemoryStore>,
        visits: Mutex<Vec<(Url, Option<String>)>>,
    }

    impl Navigator for RecordingNavigator {
        fn navigate(&self, url: &Url) -> Result<()> {
            let verifier = self.store.get(CODE_VERIFIER_KEY)?;
            self.visits.lock().unwrap().push((url.clone(), verifier));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_begin_builds_authorization_url() {
        let server = mockito::Server::new_async().await;
        let (flow, store) = flow_for(&server);

        let request = flow.begin().unwrap();
        let stored = store.get(CODE_VERIFIER_KEY).unwrap().unwrap();
        assert_eq!(stored, request.pkce.verifier);
        assert_eq!(stored.len(), 64);

        let url = &request.url;
        assert_eq!(url.host_str(), Some("accounts.spotify.com"));
        assert_eq!(url.path(), "/authorize");

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, [
            "client_id",
            "redirect_uri",
            "scope",
            "response_type",
            "code_challenge_method",
            "code_challenge",
        ]);
        assert_eq!(pairs[0].1, "client-123");
        assert_eq!(pairs[1].1, REDIRECT_URI);
        assert!(pairs[2].1.starts_with("streaming user-read-private "));
        assert_eq!(pairs[2].1.matches("user-follow-modify").count(), 2);
        assert_eq!(pairs[3].1, "code");
        assert_eq!(pairs[4].1, "S256");
        assert_eq!(pairs[5].1, PkceChallenge::from_verifier(stored).challenge);
    }

    #[tokio::test]
    async fn test_begin_reuses_stored_verifier() {
        let server = mockito::Server::new_async().await;
        let (flow, store) = flow_for(&server);
        store.set(CODE_VERIFIER_KEY, "abc123").unwrap();

        let first = flow.begin().unwrap();
        let second = flow.begin().unwrap();
        assert_eq!(first.pkce.verifier, "abc123");
        assert_eq!(second.pkce.verifier, "abc123");
        assert_eq!(
            first.pkce.challenge,
            "bKE9UspwyIPg8LsQHkJaiehiTeUdstI5JZOvaoQRgJA"
        );
        assert_eq!(first.url, second.url);
    }

    #[tokio::test]
    async fn test_begin_replaces_empty_verifier() {
        let server = mockito::Server::new_async().await;
        let (flow, store) = flow_for(&server);
        store.set(CODE_VERIFIER_KEY, "").unwrap();

        let request = flow.begin().unwrap();
        assert_eq!(request.pkce.verifier.len(), 64);
        assert_eq!(
            store.get(CODE_VERIFIER_KEY).unwrap().as_deref(),
            Some(request.pkce.verifier.as_str())
        );
    }

    #[tokio::test]
    async fn test_log_in_persists_verifier_before_navigating() {
        let server = mockito::Server::new_async().await;
        let (flow, store) = flow_for(&server);
        let navigator = RecordingNavigator {
            store: store.clone(),
            visits: Mutex::new(Vec::new()),
        };

        flow.log_in(&navigator).unwrap();
        flow.log_in(&navigator).unwrap();

        let visits = navigator.visits.lock().unwrap();
        assert_eq!(visits.len(), 2);
        let verifier = visits[0].1.clone().unwrap();
        assert_eq!(visits[1].1.as_deref(), Some(verifier.as_str()));
        assert_eq!(visits[0].0, visits[1].0);
    }

    #[tokio::test]
    async fn test_get_token_cache_hit_makes_no_request() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/api/token")
            .expect(0)
            .create_async()
            .await;
        let (flow, store) = flow_for(&server);
        store
            .set_with_expiry(ACCESS_TOKEN_KEY, "cached", 60_000)
            .unwrap();

        let token = flow.get_token(Some(&landed("code=unused"))).await.unwrap();
        assert_eq!(token.unwrap().expose_secret(), "cached");
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_token_without_cache_or_code_is_none() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/api/token")
            .expect(0)
            .create_async()
            .await;
        let (flow, _store) = flow_for(&server);

        assert!(flow.get_token(None).await.unwrap().is_none());
        assert!(
            flow.get_token(Some(&landed("state=xyz")))
                .await
                .unwrap()
                .is_none()
        );
        assert!(flow.get_token(Some(&landed("code="))).await.unwrap().is_none());
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_token_exchanges_code_and_caches() {
        let mut server = mockito::Server::new_async().await;
        let (flow, store) = flow_for(&server);
        store.set(CODE_VERIFIER_KEY, "stored-verifier").unwrap();

        let token_mock = server
            .mock("POST", "/api/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("code".into(), "auth-code".into()),
                Matcher::UrlEncoded("client_id".into(), "client-123".into()),
                Matcher::UrlEncoded("redirect_uri".into(), REDIRECT_URI.into()),
                Matcher::UrlEncoded("code_verifier".into(), "stored-verifier".into()),
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"AT1","expires_in":10,"refresh_token":"RT1"}"#)
            .expect(1)
            .create_async()
            .await;

        let before = now_ms();
        let token = flow
            .get_token(Some(&landed("code=auth-code")))
            .await
            .unwrap()
            .unwrap();
        let after = now_ms();

        assert_eq!(token.expose_secret(), "AT1");
        token_mock.assert_async().await;

        let ExpiringEntry { value, expiry } =
            store.expiring_entry(ACCESS_TOKEN_KEY).unwrap().unwrap();
        assert_eq!(value, "AT1");
        let ttl = 10 * 3600;
        assert!(expiry >= before + ttl && expiry <= after + ttl);
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("RT1"));

        // Second call is served from cache.
        let again = flow.get_token(None).await.unwrap().unwrap();
        assert_eq!(again.expose_secret(), "AT1");
    }

    #[tokio::test]
    async fn test_expired_cache_falls_through_to_exchange() {
        let mut server = mockito::Server::new_async().await;
        let (flow, store) = flow_for(&server);
        store.set(CODE_VERIFIER_KEY, "stored-verifier").unwrap();
        let stale = ExpiringEntry {
            value: "old".into(),
            expiry: now_ms().saturating_sub(1_000),
        };
        store
            .set(ACCESS_TOKEN_KEY, &serde_json::to_string(&stale).unwrap())
            .unwrap();

        let token_mock = server
            .mock("POST", "/api/token")
            .with_status(200)
            .with_body(
                r#"{"access_token":"fresh","token_type":"Bearer","expires_in":3600,"refresh_token":"RT"}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let token = flow
            .get_token(Some(&landed("code=c")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token.expose_secret(), "fresh");
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_request_token_without_verifier_sends_empty_value() {
        let mut server = mockito::Server::new_async().await;
        let (flow, store) = flow_for(&server);

        let token_mock = server
            .mock("POST", "/api/token")
            .match_body(Matcher::UrlEncoded("code_verifier".into(), String::new()))
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"code_verifier was incorrect"}"#)
            .create_async()
            .await;

        let err = flow.request_token("auth-code").await.unwrap_err();
        token_mock.assert_async().await;
        match err.downcast_ref::<TokenRequestError>() {
            Some(TokenRequestError::Status { status, body }) => {
                assert_eq!(*status, 400);
                assert!(body.contains("invalid_grant"));
            },
            None => panic!("unexpected error: {err:#}"),
        }
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_request_token_keeps_unreadable_error_body() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Declares a longer body than it sends, then hangs up.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let endpoint = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !String::from_utf8_lossy(&request).contains("grant_type=authorization_code") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 100\r\n\r\npartial")
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });

        let store = Arc::new(MemoryStore::new());
        store.set(CODE_VERIFIER_KEY, "v").unwrap();
        let config = OAuthConfig {
            token_url: format!("http://{addr}/api/token"),
            ..OAuthConfig::spotify("client-123", REDIRECT_URI)
        };
        let flow = OAuthFlow::new(config, store);

        let err = flow.request_token("auth-code").await.unwrap_err();
        endpoint.await.unwrap();
        match err.downcast_ref::<TokenRequestError>() {
            Some(TokenRequestError::Status { status, body }) => {
                assert_eq!(*status, 500);
                assert!(body.starts_with("<unreadable body:"), "{body}");
            },
            None => panic!("unexpected error: {err:#}"),
        }
    }

    #[tokio::test]
    async fn test_request_token_rejects_malformed_body() {
        let mut server = mockito::Server::new_async().await;
        let (flow, store) = flow_for(&server);
        store.set(CODE_VERIFIER_KEY, "v").unwrap();

        let _token_mock = server
            .mock("POST", "/api/token")
            .with_status(200)
            .with_body("<html>oops</html>")
            .create_async()
            .await;

        let err = flow.request_token("auth-code").await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse token response"));
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_ignores_snake_case_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let (flow, store) = flow_for(&server);
        store.set(REFRESH_TOKEN_KEY, "RT1").unwrap();

        let refresh_mock = server
            .mock("POST", "/api/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("client_id".into(), "client-123".into()),
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "RT1".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"access_token":"AT2","token_type":"Bearer","expires_in":3600,"refresh_token":"RT2"}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let before = now_ms();
        let token = flow.get_refresh_token().await.unwrap();
        let after = now_ms();
        refresh_mock.assert_async().await;

        assert_eq!(token.expose_secret(), "AT2");
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("RT1"));

        let entry = store.expiring_entry(ACCESS_TOKEN_KEY).unwrap().unwrap();
        assert_eq!(entry.value, "AT2");
        let ttl = 3600 * 3600;
        assert!(entry.expiry >= before + ttl && entry.expiry <= after + ttl);
    }

    #[tokio::test]
    async fn test_refresh_stores_camel_case_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let (flow, store) = flow_for(&server);
        store.set(REFRESH_TOKEN_KEY, "RT1").unwrap();

        let _refresh_mock = server
            .mock("POST", "/api/token")
            .with_status(200)
            .with_body(r#"{"access_token":"AT3","expires_in":3600,"refreshToken":"RT3"}"#)
            .create_async()
            .await;

        let token = flow.get_refresh_token().await.unwrap();
        assert_eq!(token.expose_secret(), "AT3");
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("RT3"));
    }

    #[tokio::test]
    async fn test_refresh_error_body_fails_to_parse() {
        let mut server = mockito::Server::new_async().await;
        let (flow, store) = flow_for(&server);
        store
            .set_with_expiry(ACCESS_TOKEN_KEY, "still-here", 60_000)
            .unwrap();

        let refresh_mock = server
            .mock("POST", "/api/token")
            .match_body(Matcher::UrlEncoded("refresh_token".into(), String::new()))
            .with_status(400)
            .with_body(r#"{"error":"invalid_request","error_description":"refresh_token must be supplied"}"#)
            .create_async()
            .await;

        let err = flow.get_refresh_token().await.unwrap_err();
        refresh_mock.assert_async().await;
        assert!(format!("{err:#}").contains("HTTP 400"));
        assert_eq!(
            store.get_with_expiry(ACCESS_TOKEN_KEY).unwrap().as_deref(),
            Some("still-here")
        );
    }

    #[test]
    fn test_authorization_code_takes_first_non_empty() {
        assert_eq!(
            authorization_code(&landed("code=a&code=b")).as_deref(),
            Some("a")
        );
        assert_eq!(
            authorization_code(&landed("state=s&code=x%2By")).as_deref(),
            Some("x+y")
        );
        assert_eq!(authorization_code(&landed("error=access_denied")), None);
        assert_eq!(authorization_code(&landed("code=")), None);
    }
}
