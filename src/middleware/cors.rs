//! CORS middleware, following W3C CORS sections 6.1 and 6.2. Allowed
//! origins come from configuration; allowed methods for a path come from the
//! published API definition.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::Response,
};

use crate::state::AppState;

pub async fn cors(State(state): State<AppState>, req: Request, next: Next) -> Response {
    // 6.1/6.2 step 1: no Origin header means the request is outside the
    // scope of the CORS spec.
    let origin = match req.headers().get(header::ORIGIN) {
        Some(origin) => origin.clone(),
        None => return next.run(req).await,
    };
    let origin_str = origin.to_str().unwrap_or_default().to_string();

    // Step 2: an origin that is not in the allow list gets no additional
    // headers. `*` matches any origin.
    let allowed = state
        .config
        .ingress
        .middleware
        .cors
        .allow_origins
        .iter()
        .any(|o| o == "*" || *o == origin_str);
    if !allowed || origin_str.is_empty() {
        return next.run(req).await;
    }

    // https://www.w3.org/TR/cors/#user-credentials
    // TODO tie this to "this resource requires scopes" instead of the
    // presence of an Authorization header.
    let supports_credentials = req.headers().contains_key(header::AUTHORIZATION);

    if req.method() == Method::OPTIONS {
        return preflight(&state, &req, origin, supports_credentials);
    }

    // 6.1 simple cross-origin/actual request: annotate whatever response the
    // rest of the chain produces.
    let mut res = next.run(req).await;
    let headers = res.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    if supports_credentials {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    headers.append(header::VARY, HeaderValue::from_static("Origin"));
    res
}

/// 6.2 preflight request. Responds directly; the rest of the chain never
/// sees the request.
fn preflight(
    state: &AppState,
    req: &Request,
    origin: HeaderValue,
    supports_credentials: bool,
) -> Response {
    // Step 3: without a requested method the preflight is out of scope.
    let requested_method = match req
        .headers()
        .get(header::ACCESS_CONTROL_REQUEST_METHOD)
        .and_then(|v| v.to_str().ok())
        .filter(|m| !m.is_empty())
    {
        Some(m) => m.to_string(),
        None => return no_content(),
    };

    // Step 4: requested header field names, empty list when absent.
    let requested_headers = req
        .headers()
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    // Step 5: the requested method must be declared for this path. A lookup
    // failure (unknown path, no definition yet) surfaces as the templated
    // error with no CORS headers.
    let allow_methods = match state.allowed_methods(req.uri().path()) {
        Ok(methods) => methods,
        Err(err) => return state.error_response(&err),
    };
    if !allow_methods.iter().any(|m| *m == requested_method) {
        return no_content();
    }

    // Steps 7, 9, 10: echo the origin and the requested method; the
    // requested headers are allowed wholesale, with Content-Type appended
    // since only a subset of its values qualifies as simple.
    let mut allow_headers = requested_headers;
    if !allow_headers.is_empty() {
        allow_headers.push(',');
    }
    allow_headers.push_str("Content-Type");

    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::OK;
    let headers = res.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    if supports_credentials {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    if let Ok(value) = HeaderValue::from_str(&requested_method) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
    }
    if let Ok(value) = HeaderValue::from_str(&allow_headers) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
    }
    headers.append(header::VARY, HeaderValue::from_static("Origin"));
    res
}

fn no_content() -> Response {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::NO_CONTENT;
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::middleware::from_fn_with_state;
    use tower::ServiceExt;

    use crate::path_index::PathIndex;
    use crate::state::testutil;

    fn read_index() -> PathIndex {
        let mut index = PathIndex::new();
        index.add_method_path_scopes("GET", "/api/v1/read", vec!["read".into()]);
        index
    }

    fn app(state: AppState) -> Router {
        Router::new()
            .fallback(|| async { "handled" })
            .layer(from_fn_with_state(state.clone(), cors))
            .with_state(state)
    }

    fn allow_all_state() -> AppState {
        let mut config = testutil::base_config();
        config.ingress.middleware.cors.allow_origins = vec!["*".into()];
        let (state, _tx) = testutil::state_with_index(config, Some(read_index()), "http://127.0.0.1:9/");
        state
    }

    #[tokio::test]
    async fn requests_without_origin_pass_through() {
        let res = app(allow_all_state())
            .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(!res.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn unmatched_origin_gets_no_cors_headers() {
        let mut config = testutil::base_config();
        config.ingress.middleware.cors.allow_origins = vec!["trusted.example".into()];
        let (state, _tx) = testutil::state_with_index(config, Some(read_index()), "http://127.0.0.1:9/");

        let res = app(state)
            .oneshot(
                Request::builder()
                    .uri("/x")
                    .header(header::ORIGIN, "evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(!res.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
        assert!(!res.headers().contains_key(header::VARY));
    }

    #[tokio::test]
    async fn matched_origin_annotates_the_response() {
        let res = app(allow_all_state())
            .oneshot(
                Request::builder()
                    .uri("/x")
                    .header(header::ORIGIN, "localhost")
                    .header(header::AUTHORIZATION, "Bearer abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "localhost"
        );
        assert_eq!(
            res.headers().get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );
        assert_eq!(res.headers().get(header::VARY).unwrap(), "Origin");
    }

    #[tokio::test]
    async fn preflight_returns_the_full_header_set() {
        let res = app(allow_all_state())
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/v1/read")
                    .header(header::ORIGIN, "localhost")
                    .header(header::AUTHORIZATION, "Bearer readabcdef")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "authorization")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let headers = res.headers();
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "localhost");
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(), "GET");
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "authorization,Content-Type"
        );
        assert_eq!(headers.get(header::VARY).unwrap(), "Origin");
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn preflight_without_credentials_omits_the_credentials_header() {
        let res = app(allow_all_state())
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/v1/read")
                    .header(header::ORIGIN, "localhost")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(!res.headers().contains_key(header::ACCESS_CONTROL_ALLOW_CREDENTIALS));
        assert_eq!(
            res.headers().get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "Content-Type"
        );
    }

    #[tokio::test]
    async fn preflight_without_requested_method_is_no_content() {
        let res = app(allow_all_state())
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/v1/read")
                    .header(header::ORIGIN, "localhost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn preflight_for_undeclared_method_is_no_content() {
        let res = app(allow_all_state())
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/v1/read")
                    .header(header::ORIGIN, "localhost")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PUT")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn preflight_for_unknown_path_is_404_without_cors_headers() {
        let res = app(allow_all_state())
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/v1/doesnotexist")
                    .header(header::ORIGIN, "localhost")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(!res.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
        assert!(!res.headers().contains_key(header::VARY));
    }
}
