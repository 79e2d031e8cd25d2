//! In-process servers used by the end-to-end tests: multipurpose upstream
//! API servers and an OAuth2 IDP mock.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use apigw::{Config, Gateway};
use axum::extract::Query;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;

/// Swagger definition served by the upstream servers: /read requires the
/// "read" scope, /write requires "write", /public requires nothing.
pub const SWAGGER: &str = r#"{
  "swagger": "2.0",
  "info": { "version": "v1", "title": "MyBank.OpenApi", "description": "MyBank Open API test." },
  "host": "api.mybank.com",
  "schemes": ["http"],
  "paths": {
    "/read": {
      "get": {
        "summary": "get a test page that requires 'read' scope.",
        "security": [{"oauth2": ["read"]}]
      }
    },
    "/write": {
      "get": {
        "summary": "get a test page that requires 'write' scope.",
        "security": [{"oauth2": ["write"]}]
      },
      "put": {
        "summary": "put a test page that requires 'write' scope.",
        "security": [{"oauth2": ["write"]}]
      }
    },
    "/public": {
      "get": {
        "summary": "get a public test page.",
        "security": [{"oauth2": [""]}]
      }
    }
  }
}"#;

async fn bind(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A multipurpose upstream server. Every API endpoint echoes its path and
/// the server name; the swagger document is served under /v1/doc.
pub async fn spawn_upstream(name: &'static str) -> SocketAddr {
    let page = |prefix: &'static str| move || async move { format!("{prefix} {name}") };
    let router = Router::new()
        .route("/", get(page("index")))
        .route("/public", get(page("public")))
        .route("/read", get(page("read")))
        .route("/write", get(page("write")))
        .route(
            "/v1/doc/swagger.json",
            get(|| async { ([(header::CONTENT_TYPE, "application/json")], SWAGGER) }),
        );
    bind(router).await
}

/// An IDP mock with hardcoded token-response pairs.
pub async fn spawn_idp() -> SocketAddr {
    async fn tokeninfo(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
        let token = match params.get("access_token") {
            Some(token) if !token.is_empty() => token.clone(),
            _ => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "invalid_request"})),
                );
            }
        };

        let (scope, expires_in) = match token.as_str() {
            "readabcdef" => (vec!["read"], 20),
            "writeabcdef" => (vec!["read", "write"], 20),
            "expiredabcdef" => (vec!["read", "write"], 0),
            _ => {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({
                        "error": "invalid_token",
                        "error_description": "The access token provided is expired, revoked, malformed or invalid for other reasons."
                    })),
                );
            }
        };

        (
            StatusCode::OK,
            Json(json!({
                "token_type": "Bearer",
                "client_id": "JJqMvO_m5zJ9odxE0iCXeOVGW2oa",
                "access_token": token,
                "grant_type": "authorization_code",
                "scope": scope,
                "expires_in": expires_in
            })),
        )
    }

    bind(Router::new().route("/oauth2/tokeninfo", get(tokeninfo))).await
}

/// A fully wired gateway in front of two upstreams and the IDP mock.
pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub base: String,
    pub client: reqwest::Client,
}

/// Start the whole fleet on the given ingress port and wait until the
/// gateway serves its first indexed request.
pub async fn start_gateway(ingress_port: u16) -> TestGateway {
    let upstream1 = spawn_upstream("upstream1").await;
    let upstream2 = spawn_upstream("upstream2").await;
    let idp = spawn_idp().await;

    let yaml = format!(
        r#"
ingress:
  bind: 127.0.0.1:{ingress_port}
  middleware:
    path:
      requirePrefix: /api/v1
      trimPrefix: /api/v1
    cors:
      allowOrigins: ["*"]
      allowMethods: ["GET", "POST", "DELETE"]
    proxy:
      targets: ["http://{upstream1}", "http://{upstream2}"]
  errorResponse: '{{ "developerMessage":"{{{{.Message}}}}", "endUserMessage":"", "errorCode":"{{{{.Message}}}}", "errorId":{{{{.Status}}}} }}'
openapi:
  url: http://{upstream1}/v1/doc/swagger.json
oauth2idp:
  tokeninfoUrl: http://{idp}/oauth2/tokeninfo
"#
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();

    let gateway = Arc::new(Gateway::new(config));
    let runner = gateway.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });

    let base = format!("http://127.0.0.1:{ingress_port}");
    let client = reqwest::Client::new();

    // Wait for the listener and for the first OpenAPI poll to publish. The
    // probe stops at the authorizer (400 without a token once the index is
    // live), so it never advances the round-robin cursor.
    for _ in 0..100 {
        if let Ok(res) = client.get(format!("{base}/api/v1/read")).send().await {
            if res.status() == StatusCode::BAD_REQUEST {
                return TestGateway {
                    gateway,
                    base,
                    client,
                };
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("gateway did not become ready");
}
