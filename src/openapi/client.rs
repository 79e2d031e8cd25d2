use std::time::Duration;

use axum::body::Bytes;
use axum::http::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backoff::Backoff;
use crate::openapi::spec;
use crate::path_index::PathIndex;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("status {0}")]
    Status(StatusCode),
}

/// Fetches an OpenAPI definition from an HTTP endpoint and polls it for
/// changes.
pub struct Client {
    url: String,
    http: reqwest::Client,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(url: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
            backoff: Backoff::new(8, Duration::from_secs(1)),
            cancel,
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Poll the endpoint until cancelled, calling `on_new` whenever a changed
    /// document parses into a fresh index.
    ///
    /// Change detection is by checksum of the raw body. A fetch or parse
    /// failure is logged and retried next tick; the checksum is only updated
    /// after a successful publication, so a transiently broken document keeps
    /// the previous index live.
    pub async fn poll<F>(&self, interval: Duration, mut on_new: F)
    where
        F: FnMut(PathIndex),
    {
        let mut checksum: Option<md5::Digest> = None;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match self.fetch().await {
                Err(err) => error!(url = %self.url, error = %err, "fetching OpenAPI definition"),
                Ok(body) => {
                    let digest = md5::compute(&body);
                    if Some(digest) != checksum {
                        match spec::build_index(&body) {
                            Err(err) => error!(error = %err, "parsing OpenAPI definition"),
                            Ok(index) => {
                                info!(url = %self.url, "OpenAPI definition fetch successful");
                                on_new(index);
                                checksum = Some(digest);
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Perform an HTTP GET with backoff (8 retries starting at 1 second).
    pub async fn fetch(&self) -> Result<Bytes, FetchError> {
        let mut backoff = self.backoff.clone();
        backoff.run(|| self.get_once()).await
    }

    async fn get_once(&self) -> Result<Bytes, FetchError> {
        let response = self.http.get(&self.url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(FetchError::Status(response.status()));
        }
        Ok(response.bytes().await?)
    }
}
