use axum::{
    body::Body,
    http::{StatusCode, header},
    response::Response,
};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Errors surfaced to gateway clients. Each variant maps to one HTTP status;
/// the message is rendered through the configured [`ErrorTemplate`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            GatewayError::BadRequest(m)
            | GatewayError::Unauthorized(m)
            | GatewayError::NotFound(m)
            | GatewayError::ServiceUnavailable(m)
            | GatewayError::Internal(m) => m,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum TemplateError {
    #[error("unterminated placeholder at offset {0}")]
    Unterminated(usize),

    #[error("unknown placeholder {{{{{0}}}}}")]
    UnknownPlaceholder(String),
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Status,
    Message,
    /// Parsed but unrenderable; fails at render time like an unresolvable
    /// field in the original templates.
    Unknown(String),
}

/// Error-response body template with `{{.Status}}` and `{{.Message}}`
/// substitutions, parsed once at startup.
#[derive(Debug, Clone)]
pub struct ErrorTemplate {
    segments: Vec<Segment>,
}

/// Fallback body when template rendering fails.
#[derive(Serialize)]
struct ErrorBody<'a> {
    #[serde(rename = "Status")]
    status: u16,
    #[serde(rename = "Message")]
    message: &'a str,
}

impl ErrorTemplate {
    pub fn parse(input: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = input;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + open))?;
            let name = after[..close].trim();
            segments.push(match name {
                ".Status" => Segment::Status,
                ".Message" => Segment::Message,
                other => Segment::Unknown(other.to_string()),
            });
            offset += open + 2 + close + 2;
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn render(&self, status: u16, message: &str) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Status => out.push_str(&status.to_string()),
                Segment::Message => out.push_str(message),
                Segment::Unknown(name) => {
                    return Err(TemplateError::UnknownPlaceholder(name.clone()));
                }
            }
        }
        Ok(out)
    }

    /// Build a full error response. A render failure is logged and answered
    /// with a plain JSON representation of the same fields.
    pub fn respond(&self, status: StatusCode, message: &str) -> Response {
        match self.render(status.as_u16(), message) {
            Ok(body) => {
                let mut res = Response::new(Body::from(body));
                *res.status_mut() = status;
                res
            }
            Err(err) => {
                warn!(error = %err, "error template render failed, falling back to JSON");
                let body = ErrorBody {
                    status: status.as_u16(),
                    message,
                };
                let body = serde_json::to_string(&body).unwrap_or_default();
                let mut res = Response::new(Body::from(body));
                *res.status_mut() = status;
                res.headers_mut().insert(
                    header::CONTENT_TYPE,
                    header::HeaderValue::from_static("application/json"),
                );
                res
            }
        }
    }
}
