//! Loopback listener that plays the part of the redirect page.
//!
//! Binds the redirect URI's host and port, answers the first request on its path
//! and hands back the full URL the user agent landed on.

use std::{net::SocketAddr, sync::Arc};

use {
    anyhow::{Context, Result},
    axum::{
        Router,
        extract::{RawQuery, State},
        response::Html,
        routing::get,
    },
    tokio::{
        net::TcpListener,
        sync::{Mutex, oneshot},
    },
    tracing::{debug, info},
    url::Url,
};

const LANDING_PAGE: &str = "<!DOCTYPE html>\
<html><head><title>Encore</title></head>\
<body><p>Authorization received. You can close this window.</p></body></html>";

type RedirectSlot = Arc<Mutex<Option<oneshot::Sender<Option<String>>>>>;

pub struct CallbackServer {
    listener: TcpListener,
    redirect_uri: Url,
}

impl CallbackServer {
    /// Bind the host and port named by `redirect_uri`.
    pub async fn bind(redirect_uri: &Url) -> Result<Self> {
        let host = redirect_uri
            .host_str()
            .with_context(|| format!("redirect URI has no host: {redirect_uri}"))?;
        let port = redirect_uri
            .port_or_known_default()
            .with_context(|| format!("redirect URI has no port: {redirect_uri}"))?;

        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("failed to bind callback listener on {host}:{port}"))?;

        Ok(Self {
            listener,
            redirect_uri: redirect_uri.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the first request on the redirect path, then shut down.
    ///
    /// The returned URL is the configured redirect URI carrying the query string
    /// of that request, whatever it contained.
    pub async fn wait(self) -> Result<Url> {
        let Self {
            listener,
            redirect_uri,
        } = self;

        let (redirect_tx, redirect_rx) = oneshot::channel();
        let slot: RedirectSlot = Arc::new(Mutex::new(Some(redirect_tx)));
        let app = Router::new()
            .route(redirect_uri.path(), get(handle_redirect))
            .with_state(slot);

        info!(
            addr = ?listener.local_addr().ok(),
            path = redirect_uri.path(),
            "waiting for authorization redirect"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let received = redirect_rx.await;
        let _ = shutdown_tx.send(());
        server.await.context("callback server task failed")??;
        let query = received.context("callback server stopped before a redirect arrived")?;

        let mut landed = redirect_uri;
        landed.set_query(query.as_deref());
        debug!("authorization redirect received");
        Ok(landed)
    }
}

async fn handle_redirect(
    State(slot): State<RedirectSlot>,
    RawQuery(query): RawQuery,
) -> Html<&'static str> {
    if let Some(sender) = slot.lock().await.take() {
        let _ = sender.send(query);
    }
    Html(LANDING_PAGE)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::flow::authorization_code};

    #[tokio::test]
    async fn test_captures_redirect_query() {
        let redirect = Url::parse("http://127.0.0.1:0/callback").unwrap();
        let server = CallbackServer::bind(&redirect).await.unwrap();
        let addr = server.local_addr().unwrap();
        let waiter = tokio::spawn(server.wait());

        let resp = reqwest::get(format!("http://{addr}/callback?code=abc&state=s"))
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert!(resp.text().await.unwrap().contains("close this window"));

        let landed = waiter.await.unwrap().unwrap();
        assert_eq!(landed.path(), "/callback");
        assert_eq!(authorization_code(&landed).as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_redirect_without_code_still_returns() {
        let redirect = Url::parse("http://127.0.0.1:0/cb").unwrap();
        let server = CallbackServer::bind(&redirect).await.unwrap();
        let addr = server.local_addr().unwrap();
        let waiter = tokio::spawn(server.wait());

        let missing = reqwest::get(format!("http://{addr}/other")).await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        reqwest::get(format!("http://{addr}/cb?error=access_denied"))
            .await
            .unwrap();

        let landed = waiter.await.unwrap().unwrap();
        assert_eq!(landed.query(), Some("error=access_denied"));
        assert_eq!(authorization_code(&landed), None);
    }
}
