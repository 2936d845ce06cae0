use std::sync::Arc;

use {
    anyhow::{Result, bail},
    clap::Subcommand,
    encore_config::EncoreConfig,
    encore_oauth::{
        CallbackServer, ExpiringEntry, FileStore, KeyValueStore, Navigator, OAuthConfig,
        OAuthFlow,
        storage::{ACCESS_TOKEN_KEY, CODE_VERIFIER_KEY, REFRESH_TOKEN_KEY, now_ms},
    },
    secrecy::ExposeSecret,
    tracing::info,
    url::Url,
};

#[derive(Subcommand)]
pub enum AuthAction {
    /// Log in to Spotify through the browser and cache the tokens.
    Login,
    /// Print a valid access token.
    Token {
        /// URL the browser landed on after authorizing; completes a pending login.
        #[arg(long)]
        redirect_url: Option<Url>,
    },
    /// Trade the stored refresh token for a new access token.
    Refresh,
    /// Show what is cached locally.
    Status,
    /// Forget cached tokens and any pending verifier. Does not revoke anything.
    Logout,
}

pub async fn handle_auth(action: AuthAction, config: &EncoreConfig) -> Result<()> {
    let path = config.storage.resolved_path()?;
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(path));

    match action {
        AuthAction::Login => login(config, store).await,
        AuthAction::Token { redirect_url } => token(config, store, redirect_url).await,
        AuthAction::Refresh => refresh(config, store).await,
        AuthAction::Status => status(store.as_ref()),
        AuthAction::Logout => logout(store.as_ref()),
    }
}

/// Opens the system browser, falling back to printing the URL.
struct SystemBrowser;

impl Navigator for SystemBrowser {
    fn navigate(&self, url: &Url) -> Result<()> {
        println!("Opening browser for authentication...");
        if open::that(url.as_str()).is_err() {
            println!("Could not open browser. Please visit:\n{url}");
        }
        Ok(())
    }
}

fn oauth_config(config: &EncoreConfig) -> Result<OAuthConfig> {
    let client = config.spotify.require_client()?;
    let mut oauth = OAuthConfig::spotify(client.client_id, client.redirect_uri);
    if let Some(url) = &config.spotify.authorize_url {
        oauth.auth_url = url.clone();
    }
    if let Some(url) = &config.spotify.token_url {
        oauth.token_url = url.clone();
    }
    Ok(oauth)
}

async fn login(config: &EncoreConfig, store: Arc<dyn KeyValueStore>) -> Result<()> {
    let redirect_uri = config.spotify.require_client()?.redirect_url;
    let oauth = oauth_config(config)?;
    let flow = OAuthFlow::new(oauth, store);

    if flow.get_token(None).await?.is_some() {
        println!("Already logged in. Use `encore auth logout` to start over.");
        return Ok(());
    }

    // Listen before navigating so the redirect cannot arrive first.
    let server = CallbackServer::bind(&redirect_uri).await?;
    flow.log_in(&SystemBrowser)?;

    println!("Waiting for redirect on {redirect_uri} ...");
    let landed = server.wait().await?;

    match flow.get_token(Some(&landed)).await? {
        Some(_) => {
            info!("login complete");
            println!("Successfully logged in to Spotify");
            Ok(())
        },
        None => {
            let reason = landed
                .query_pairs()
                .find(|(key, _)| key == "error")
                .map(|(_, value)| value.into_owned())
                .unwrap_or_else(|| "no authorization code".to_string());
            bail!("authorization failed: {reason}")
        },
    }
}

async fn token(
    config: &EncoreConfig,
    store: Arc<dyn KeyValueStore>,
    redirect_url: Option<Url>,
) -> Result<()> {
    let flow = OAuthFlow::new(oauth_config(config)?, store);
    match flow.get_token(redirect_url.as_ref()).await? {
        Some(token) => println!("{}", token.expose_secret()),
        None => bail!("not logged in; run `encore auth login`"),
    }
    Ok(())
}

async fn refresh(config: &EncoreConfig, store: Arc<dyn KeyValueStore>) -> Result<()> {
    let flow = OAuthFlow::new(oauth_config(config)?, store);
    let token = flow.get_refresh_token().await?;
    println!("{}", token.expose_secret());
    Ok(())
}

fn status(store: &dyn KeyValueStore) -> Result<()> {
    let access = describe_access(store, now_ms())?;
    let refresh = if store.get(REFRESH_TOKEN_KEY)?.is_some() {
        "stored"
    } else {
        "none"
    };
    let pending = if store.get(CODE_VERIFIER_KEY)?.is_some() {
        "yes"
    } else {
        "no"
    };

    println!("access token:   {access}");
    println!("refresh token:  {refresh}");
    println!("login verifier: {pending}");
    Ok(())
}

/// Reads the cached access token without evicting anything.
fn describe_access(store: &dyn KeyValueStore, now_ms: u64) -> Result<String> {
    let Some(raw) = store.get(ACCESS_TOKEN_KEY)? else {
        return Ok("none".to_string());
    };
    Ok(match ExpiringEntry::parse(&raw) {
        Ok(entry) => describe_expiry(entry.expiry, now_ms),
        Err(_) => "unreadable".to_string(),
    })
}

fn logout(store: &dyn KeyValueStore) -> Result<()> {
    forget(store)?;
    println!("Forgot cached Spotify credentials");
    Ok(())
}

fn forget(store: &dyn KeyValueStore) -> Result<()> {
    for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, CODE_VERIFIER_KEY] {
        store.remove(key)?;
    }
    Ok(())
}

fn describe_expiry(expiry_ms: u64, now_ms: u64) -> String {
    if expiry_ms <= now_ms {
        return "expired".to_string();
    }
    let remaining = (expiry_ms - now_ms) / 1000;
    let hours = remaining / 3600;
    let mins = (remaining % 3600) / 60;
    format!("valid ({hours}h {mins}m remaining)")
}
