use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long a cached introspection result is served without re-checking the
/// IDP, in seconds. Bounds the delay between an IDP-side revocation and
/// rejection here.
const CACHE_FRESHNESS_SECS: i64 = 10;

/// Garbage collect interval for expired cache entries.
const GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum TokeninfoError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("tokeninfo status {0}")]
    Status(StatusCode),

    #[error("tokeninfo response error {0}")]
    Idp(String),
}

/// The result of a tokeninfo call (RFC 7662).
#[derive(Debug, Clone, Deserialize)]
pub struct TokeninfoResponse {
    /// The application for which the token was created.
    #[serde(default)]
    pub client_id: String,
    /// Zero or more OAuth2 scopes.
    #[serde(default)]
    pub scope: Vec<String>,
    /// Number of seconds this session is still valid.
    #[serde(default)]
    pub expires_in: i64,
    /// Empty on success, an error name otherwise.
    #[serde(default)]
    pub error: String,
    /// Set representation of `scope`, built after deserialization.
    #[serde(skip)]
    pub scopes: HashSet<String>,
    /// When this response was received. `timestamp + expires_in` is the
    /// absolute expiry time.
    #[serde(skip, default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TokeninfoResponse {
    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.timestamp + chrono::Duration::seconds(self.expires_in) < now
    }

    fn fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.timestamp + chrono::Duration::seconds(CACHE_FRESHNESS_SECS) > now
    }
}

struct Gc {
    cancel: CancellationToken,
}

/// Calls an OAuth2 tokeninfo endpoint with caching to reduce the load on the
/// IDP.
///
/// A side effect of caching is that a revoked token may still be accepted
/// until its entry goes stale; entries older than [`CACHE_FRESHNESS_SECS`] are
/// re-checked. A background sweeper evicts entries past their absolute
/// expiry so the cache cannot grow without bound.
pub struct TokeninfoClient {
    url: String,
    http: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, Arc<TokeninfoResponse>>>>,
    gc: Mutex<Option<Gc>>,
}

impl TokeninfoClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
            cache: Arc::new(RwLock::new(HashMap::new())),
            gc: Mutex::new(None),
        }
    }

    /// Resolve a bearer token to its introspection response, consulting the
    /// cache first. Endpoint errors are propagated and leave the cache
    /// untouched.
    pub async fn call(&self, token: &str) -> Result<Arc<TokeninfoResponse>, TokeninfoError> {
        if let Some(cached) = self.cache.read().await.get(token) {
            if cached.fresh_at(Utc::now()) {
                return Ok(cached.clone());
            }
        }

        let response = Arc::new(self.introspect(token).await?);
        self.cache
            .write()
            .await
            .insert(token.to_string(), response.clone());
        Ok(response)
    }

    /// One GET against the tokeninfo endpoint. The receipt timestamp is
    /// clocked before the call so freshness checks err on the stale side.
    async fn introspect(&self, token: &str) -> Result<TokeninfoResponse, TokeninfoError> {
        let now = Utc::now();

        let response = self
            .http
            .get(&self.url)
            .query(&[("access_token", token)])
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(TokeninfoError::Status(response.status()));
        }
        let mut info: TokeninfoResponse = response.json().await?;
        if !info.error.is_empty() {
            return Err(TokeninfoError::Idp(info.error));
        }

        info.scopes = info.scope.iter().cloned().collect();
        info.timestamp = now;
        Ok(info)
    }

    /// Start or stop the background sweeper. Enabling when already running
    /// and disabling when already stopped are no-ops.
    pub async fn enable_gc(&self, enable: bool) {
        let mut gc = self.gc.lock().await;
        if enable {
            if gc.is_some() {
                return;
            }
            let cancel = CancellationToken::new();
            let cache = self.cache.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(GC_INTERVAL);
                ticker.tick().await; // the first tick completes immediately
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = ticker.tick() => sweep(&cache).await,
                    }
                }
            });
            *gc = Some(Gc { cancel });
        } else if let Some(gc) = gc.take() {
            gc.cancel.cancel();
        }
    }
}

/// Remove every entry whose absolute expiry has passed. The write lock is
/// held for the whole pass; introspection calls happen outside the lock.
async fn sweep(cache: &RwLock<HashMap<String, Arc<TokeninfoResponse>>>) {
    let now = Utc::now();
    let mut data = cache.write().await;
    let before = data.len();
    data.retain(|_, info| !info.expired_at(now));
    let removed = before - data.len();
    if removed > 0 {
        debug!(removed, "expired tokeninfo cache entries swept");
    }
}
