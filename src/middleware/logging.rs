//! Access logging middleware. Writes one IIS W3C-extended log line per
//! request and updates the Prometheus request counters.

use std::io::Write;
use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use http_body::Body as _;

use crate::metrics::METRICS;
use crate::state::{AppState, ClientId};

pub async fn access_log(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let timestamp = Utc::now();

    let ip = client_ip(&req);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let bytes_in = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let res = next.run(req).await;

    let elapsed = started.elapsed();
    let status = res.status().as_u16().to_string();
    let client_id = res
        .extensions()
        .get::<ClientId>()
        .map(|c| c.0.clone())
        .unwrap_or_else(|| "-".to_string());
    let bytes_out = res.body().size_hint().exact().unwrap_or(0);

    METRICS
        .handled_total
        .with_label_values(&[client_id.as_str(), status.as_str()])
        .inc();
    METRICS
        .handling_duration_seconds
        .with_label_values(&[method.as_str()])
        .observe(elapsed.as_secs_f64());

    if let Ok(mut writer) = state.access_log.lock() {
        let _ = writeln!(
            writer,
            "{},{},{},W3SVC,{}, -,{},{},{},{},0,{},{}, -,",
            ip,
            client_id,
            timestamp.format("%m/%d/%y,%H:%M:%S"),
            host,
            elapsed.as_millis(),
            bytes_in,
            bytes_out,
            status,
            method,
            path,
        );
    }

    res
}

/// The caller's IP: the first X-Forwarded-For entry when present, otherwise
/// the peer address recorded by the listener.
fn client_ip(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "-".to_string())
}
