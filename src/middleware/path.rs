use axum::{
    extract::{Request, State},
    http::Uri,
    http::uri::PathAndQuery,
    middleware::Next,
    response::Response,
};

use crate::error::GatewayError;
use crate::state::AppState;

/// Gate and rewrite the request path. Requests whose path does not begin
/// with the configured prefix are rejected with 404; otherwise the trim
/// prefix is stripped from the front. Checks run prior to mutations; both
/// values are literal strings.
pub async fn rewrite(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let cfg = &state.config.ingress.middleware.path;

    let path = req.uri().path();
    if !path.starts_with(&cfg.require_prefix) {
        return state.error_response(&GatewayError::NotFound("Not found".to_string()));
    }

    let trimmed = path.strip_prefix(&cfg.trim_prefix).unwrap_or(path);
    if trimmed != path {
        let trimmed = if trimmed.is_empty() { "/" } else { trimmed };
        match rewrite_uri(req.uri(), trimmed) {
            Ok(uri) => *req.uri_mut() = uri,
            Err(err) => {
                tracing::warn!(error = %err, "rewriting request path");
                return state.error_response(&GatewayError::NotFound("Not found".to_string()));
            }
        }
    }

    next.run(req).await
}

fn rewrite_uri(uri: &Uri, path: &str) -> Result<Uri, axum::http::Error> {
    let path_and_query = match uri.query() {
        Some(query) => PathAndQuery::try_from(format!("{path}?{query}"))?,
        None => PathAndQuery::try_from(path.to_string())?,
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Ok(Uri::from_parts(parts)?)
}
