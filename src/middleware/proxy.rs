//! Reverse proxy terminating the middleware chain. Selects an upstream
//! target round-robin, rewrites the outgoing request, and passes the
//! upstream response back unmodified.

use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, header},
    response::Response,
};
use reqwest::Url;
use thiserror::Error;
use tracing::error;

use crate::error::GatewayError;
use crate::state::AppState;

#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("no proxy targets configured")]
    NoTargets,

    #[error("invalid proxy target {0:?}: {1}")]
    InvalidTarget(String, url::ParseError),
}

/// Upstream selector that advances one step per request, wrapping at the end.
pub struct RoundRobin {
    targets: Vec<Url>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(targets: &[String]) -> Result<Self, BalancerError> {
        if targets.is_empty() {
            return Err(BalancerError::NoTargets);
        }
        let targets = targets
            .iter()
            .map(|t| Url::parse(t).map_err(|e| BalancerError::InvalidTarget(t.clone(), e)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            targets,
            cursor: AtomicUsize::new(0),
        })
    }

    /// The next target. The cursor advances exactly once per call, also
    /// under concurrent contention.
    pub fn next_target(&self) -> &Url {
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.targets[cursor % self.targets.len()]
    }
}

/// Headers that must not travel between the client and upstream connections.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn forwardable(name: &str) -> bool {
    !HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

pub async fn forward(State(state): State<AppState>, req: Request) -> Response {
    let target = state.balancer.next_target();
    let (parts, body) = req.into_parts();

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            error!(error = %err, "reading request body");
            return state
                .error_response(&GatewayError::Internal("Internal server error".to_string()));
        }
    };

    let url = rewrite_url(target, parts.uri.path(), parts.uri.query());

    let mut headers = HeaderMap::new();
    for (name, value) in &parts.headers {
        if forwardable(name.as_str()) {
            headers.append(name, value.clone());
        }
    }
    // The upstream sees its own host, not ours.
    if let Some(host) = host_header(target) {
        headers.insert(header::HOST, host);
    }
    // Explicitly disable User-Agent so the HTTP client doesn't pick a
    // default value.
    if !parts.headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(""));
    }

    let result = state
        .http
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match result {
        Ok(upstream) => upstream,
        Err(err) => {
            error!(upstream = %target, error = %err, "remote unreachable, could not forward");
            return state.error_response(&GatewayError::ServiceUnavailable(
                "Service unavailable".to_string(),
            ));
        }
    };

    let status = upstream.status();
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if forwardable(name.as_str()) {
            headers.append(name, value.clone());
        }
    }
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(err) => {
            error!(upstream = %target, error = %err, "reading upstream response");
            return state.error_response(&GatewayError::ServiceUnavailable(
                "Service unavailable".to_string(),
            ));
        }
    };

    let mut res = Response::new(Body::from(body));
    *res.status_mut() = status;
    *res.headers_mut() = headers;
    res
}

/// Build the outgoing URL: scheme and host from the target, a single-slash
/// join of the target path and the request path, and the target query
/// prefixed to the request query.
fn rewrite_url(target: &Url, path: &str, query: Option<&str>) -> String {
    let mut url = format!(
        "{}://{}",
        target.scheme(),
        target.authority()
    );
    url.push_str(&single_joining_slash(target.path(), path));
    let query = match (target.query().unwrap_or_default(), query.unwrap_or_default()) {
        ("", "") => String::new(),
        (t, "") => t.to_string(),
        ("", r) => r.to_string(),
        (t, r) => format!("{t}&{r}"),
    };
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query);
    }
    url
}

fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

fn host_header(target: &Url) -> Option<HeaderValue> {
    let host = target.host_str()?;
    let host = match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    HeaderValue::from_str(&host).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn single_joining_slash_cases() {
        assert_eq!(single_joining_slash("", "/public"), "/public");
        assert_eq!(single_joining_slash("/", "/public"), "/public");
        assert_eq!(single_joining_slash("/base", "public"), "/base/public");
        assert_eq!(single_joining_slash("/base/", "/public"), "/base/public");
        assert_eq!(single_joining_slash("/base", "/public"), "/base/public");
    }

    #[test]
    fn rewrite_url_joins_path_and_prefixes_query() {
        let target = Url::parse("http://upstream:8080").unwrap();
        assert_eq!(
            rewrite_url(&target, "/read", None),
            "http://upstream:8080/read"
        );

        let target = Url::parse("http://upstream/base?v=1").unwrap();
        assert_eq!(
            rewrite_url(&target, "/read", Some("x=2")),
            "http://upstream/base/read?v=1&x=2"
        );
        assert_eq!(rewrite_url(&target, "/read", None), "http://upstream/base/read?v=1");

        let target = Url::parse("http://upstream").unwrap();
        assert_eq!(
            rewrite_url(&target, "/read", Some("x=2")),
            "http://upstream/read?x=2"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_not_forwarded() {
        assert!(forwardable("content-type"));
        assert!(forwardable("authorization"));
        assert!(!forwardable("Connection"));
        assert!(!forwardable("Host"));
        assert!(!forwardable("transfer-encoding"));
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let balancer = RoundRobin::new(&[
            "http://one".to_string(),
            "http://two".to_string(),
            "http://three".to_string(),
        ])
        .unwrap();

        let hosts: Vec<_> = (0..7)
            .map(|_| balancer.next_target().host_str().unwrap().to_string())
            .collect();
        assert_eq!(hosts, ["one", "two", "three", "one", "two", "three", "one"]);
    }

    #[test]
    fn round_robin_rejects_empty_target_list() {
        assert!(matches!(RoundRobin::new(&[]), Err(BalancerError::NoTargets)));
        assert!(matches!(
            RoundRobin::new(&["not a url".to_string()]),
            Err(BalancerError::InvalidTarget(..))
        ));
    }

    #[tokio::test]
    async fn round_robin_is_fair_under_concurrency() {
        let balancer = Arc::new(
            RoundRobin::new(&["http://one".to_string(), "http://two".to_string()]).unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let balancer = balancer.clone();
            handles.push(tokio::spawn(async move {
                let mut counts = (0usize, 0usize);
                for _ in 0..250 {
                    match balancer.next_target().host_str().unwrap() {
                        "one" => counts.0 += 1,
                        "two" => counts.1 += 1,
                        other => panic!("unexpected target {other}"),
                    }
                }
                counts
            }));
        }

        let mut one = 0;
        let mut two = 0;
        for handle in handles {
            let (a, b) = handle.await.unwrap();
            one += a;
            two += b;
        }
        // 2000 selections over 2 targets: exactly half each, no skips.
        assert_eq!(one, 1000);
        assert_eq!(two, 1000);
    }
}
