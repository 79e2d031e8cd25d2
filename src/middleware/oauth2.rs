//! OAuth2 authorization middleware. Allows or denies traffic based on the
//! `Authorization` header and the scopes the API definition requires for the
//! requested method/path (RFC 6749, RFC 6750).
//!
//! The authenticated client id is added to the request so other middleware
//! can do client specific things like per-client accounting.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::state::{AppState, ClientId};

fn token_missing() -> GatewayError {
    GatewayError::BadRequest("Missing or malformed token".to_string())
}

fn token_invalid() -> GatewayError {
    GatewayError::Unauthorized("Not allowed".to_string())
}

pub async fn authorize(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    // Required scopes for this method/path. Lookup failures (unknown path,
    // unknown method, no definition yet) are 404s.
    let required = match state.required_scopes(req.method().as_str(), req.uri().path()) {
        Ok(required) => required,
        Err(err) => return state.error_response(&err),
    };

    if required.is_empty() {
        // No required scopes, proceed.
        return next.run(req).await;
    }

    let token = match bearer_token(req.headers()) {
        Ok(token) => token,
        Err(err) => return state.error_response(&err),
    };

    let info = match state.tokeninfo.call(&token).await {
        Ok(info) => info,
        Err(err) => {
            // Log the internal cause but don't let the caller know.
            info!(error = %err, "tokeninfo call failed");
            return state.error_response(&token_invalid());
        }
    };

    // Check the token is still valid.
    if info.expires_in <= 0 {
        return state.error_response(&token_invalid());
    }

    // All required scopes must be granted.
    for scope in &required {
        if !info.scopes.contains(scope) {
            debug!(
                method = %req.method(),
                path = %req.uri().path(),
                ?required,
                allowed = ?info.scopes,
                "missing required scope"
            );
            return state.error_response(&token_invalid());
        }
    }

    let client_id = ClientId(info.client_id.clone());
    req.extensions_mut().insert(client_id.clone());
    let mut res = next.run(req).await;
    // Echo the client id onto the response so the access logger can see it.
    res.extensions_mut().insert(client_id);
    res
}

/// Get an OAuth2 token from a header of the form
/// `Authorization: Bearer cn389ncoiwuencr`.
fn bearer_token(headers: &HeaderMap) -> Result<String, GatewayError> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if auth.is_empty() {
        return Err(token_missing());
    }
    let parts: Vec<&str> = auth.split("Bearer").collect();
    if parts.len() != 2 {
        return Err(token_missing());
    }
    Ok(parts[1].trim().to_string())
}
