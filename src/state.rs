use std::io::Write;
use std::sync::{Arc, Mutex};

use axum::response::Response;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{ErrorTemplate, GatewayError};
use crate::middleware::proxy::RoundRobin;
use crate::path_index::PathIndex;
use crate::tokeninfo::TokeninfoClient;

/// The authenticated OAuth2 client, deposited into the request's extensions
/// by the authorizer and echoed onto the response for the access logger.
#[derive(Debug, Clone)]
pub struct ClientId(pub String);

/// The currently published path index. `None` until the first successful
/// OpenAPI poll.
pub type IndexReceiver = watch::Receiver<Option<Arc<PathIndex>>>;

/// Shared state for the request-processing chain.
///
/// The index receiver snapshots the published index without blocking the
/// publisher: readers clone the inner `Arc` out of a brief borrow and query
/// the snapshot lock-free.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub template: Arc<ErrorTemplate>,
    pub index: IndexReceiver,
    pub tokeninfo: Arc<TokeninfoClient>,
    pub balancer: Arc<RoundRobin>,
    pub http: reqwest::Client,
    pub access_log: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        index: IndexReceiver,
        tokeninfo: Arc<TokeninfoClient>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        if config.ingress.error_response.is_empty() {
            tracing::warn!("config: errorResponse is not set");
        }
        let template = if config.ingress.error_response.is_empty() {
            ErrorTemplate::parse("{{.Message}}")?
        } else {
            ErrorTemplate::parse(&config.ingress.error_response)?
        };

        let balancer = RoundRobin::new(&config.ingress.middleware.proxy.targets)?;

        Ok(Self {
            config,
            template: Arc::new(template),
            index,
            tokeninfo,
            balancer: Arc::new(balancer),
            http: create_http_client()?,
            access_log: Arc::new(Mutex::new(Box::new(std::io::stdout()))),
        })
    }

    /// Redirect the access log, used by tests.
    pub fn with_access_log(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.access_log = Arc::new(Mutex::new(writer));
        self
    }

    /// Render a gateway error through the configured template.
    pub fn error_response(&self, err: &GatewayError) -> Response {
        self.template.respond(err.status(), err.message())
    }

    fn snapshot(&self) -> Option<Arc<PathIndex>> {
        self.index.borrow().clone()
    }

    /// Scopes required to access a method/path, from the published index.
    /// Any lookup failure is a 404, including the window before the first
    /// definition is published.
    pub fn required_scopes(&self, method: &str, path: &str) -> Result<Vec<String>, GatewayError> {
        let index = self
            .snapshot()
            .ok_or_else(|| GatewayError::NotFound(NO_DEFINITION.to_string()))?;
        index
            .find_scopes(method, path)
            .map(<[String]>::to_vec)
            .map_err(|e| GatewayError::NotFound(e.to_string()))
    }

    /// HTTP methods available for a path, from the published index.
    pub fn allowed_methods(&self, path: &str) -> Result<Vec<String>, GatewayError> {
        let index = self
            .snapshot()
            .ok_or_else(|| GatewayError::NotFound(NO_DEFINITION.to_string()))?;
        index
            .find_methods(path)
            .map_err(|e| GatewayError::NotFound(e.to_string()))
    }
}

const NO_DEFINITION: &str = "no OpenAPI definition read yet";

fn create_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(std::time::Duration::from_secs(30))
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .tcp_nodelay(true)
        .build()
}
