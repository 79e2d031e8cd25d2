//! Gateway lifecycle: checks the IDP is reachable, starts the OpenAPI
//! poller, wires the introspection client into the middleware chain, and
//! runs the ingress HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::middleware::{cors, logging, oauth2, path, proxy};
use crate::openapi;
use crate::path_index::PathIndex;
use crate::state::AppState;
use crate::tokeninfo::TokeninfoClient;

const POLL_INTERVAL: Duration = Duration::from_secs(60);

type StartupError = Box<dyn std::error::Error + Send + Sync>;

/// A running gateway instance.
pub struct Gateway {
    config: Arc<Config>,
    cancel: CancellationToken,
    index_tx: watch::Sender<Option<Arc<PathIndex>>>,
    tokeninfo: Arc<TokeninfoClient>,
    finished: Notify,
}

impl Gateway {
    pub fn new(config: Config) -> Self {
        let (index_tx, _) = watch::channel(None);
        let tokeninfo = Arc::new(TokeninfoClient::new(&config.oauth2idp.tokeninfo_url));
        Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
            index_tx,
            tokeninfo,
            finished: Notify::new(),
        }
    }

    /// Run the gateway until it is shut down or fails to start.
    pub async fn run(&self) -> Result<(), StartupError> {
        let result = self.run_inner().await;
        self.finished.notify_one();
        result
    }

    async fn run_inner(&self) -> Result<(), StartupError> {
        self.config.validate()?;

        // Refuse to start when the IDP is unreachable.
        ping_url(&self.config.oauth2idp.tokeninfo_url).await?;
        info!(url = %self.config.oauth2idp.tokeninfo_url, "ping idp successful");

        // Poll the OpenAPI definition in the background; each new version is
        // swapped into the index slot wholesale.
        let client =
            openapi::Client::new(&self.config.openapi.url, self.cancel.child_token());
        let index_tx = self.index_tx.clone();
        tokio::spawn(async move {
            client
                .poll(POLL_INTERVAL, |index| {
                    info!("switching to new OpenAPI definition");
                    index_tx.send_replace(Some(Arc::new(index)));
                })
                .await;
        });

        self.tokeninfo.enable_gc(true).await;

        let state = AppState::new(
            self.config.clone(),
            self.index_tx.subscribe(),
            self.tokeninfo.clone(),
        )?;
        let app = router(state);

        let addr: SocketAddr = crate::config::parse_bind(&self.config.ingress.bind)?;
        info!(%addr, "starting gateway");

        if self.config.ingress.tls.enabled() {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                &self.config.ingress.tls.cert,
                &self.config.ingress.tls.key,
            )
            .await?;
            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
            });
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await?;
        } else {
            let listener = TcpListener::bind(addr).await?;
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(self.cancel.clone().cancelled_owned())
            .await?;
        }

        info!("gateway stopped");
        Ok(())
    }

    /// Stop the poller, the cache sweeper, and the HTTP server.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tokeninfo.enable_gc(false).await;
    }

    /// Like [`Gateway::shutdown`], but waits no more than the given time for
    /// connections to close.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) {
        let waiter = self.finished.notified();
        self.shutdown().await;
        let _ = tokio::time::timeout(timeout, waiter).await;
    }
}

/// The ingress request-processing chain: logging, then path rewriting, then
/// CORS, then authorization, ending in the reverse proxy. This order lets
/// the access log see the final status and the authorizer see the rewritten
/// path.
pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(proxy::forward)
        .layer(
            tower::ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(from_fn_with_state(state.clone(), logging::access_log))
                .layer(from_fn_with_state(state.clone(), path::rewrite))
                .layer(from_fn_with_state(state.clone(), cors::cors))
                .layer(from_fn_with_state(state.clone(), oauth2::authorize)),
        )
        .with_state(state)
}

/// Check that a URL is reachable. 400 and 401 count as reachable: the IDP
/// recognized the request and complained about the absent token.
async fn ping_url(url: &str) -> Result<(), StartupError> {
    let response = reqwest::get(url).await?;
    let status = response.status();
    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
        Ok(())
    } else {
        Err(format!("GET {url} failed with {status}").into())
    }
}
