//! Prometheus metrics and the request tracking middleware.
//!
//! Counters:
//! - `mallquest_http_requests_total{method,path,status}`
//! - `mallquest_receipts_total`
//! - `mallquest_busy_rejections_total`
//!
//! Histograms:
//! - `mallquest_http_request_duration_seconds{method,path,status}`

use axum::{extract::Request, middleware::Next, response::Response};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Install the Prometheus recorder; call once at startup.
pub fn init_metrics() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install metrics recorder: {e}"))
}

/// Replace dynamic path segments so label cardinality stays bounded.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            let id_like = segment.len() >= 8
                && segment
                    .chars()
                    .all(|c| c.is_ascii_hexdigit() || c == '-');
            if id_like {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn record_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", normalize_path(path)),
        ("status", status.to_string()),
    ];
    counter!("mallquest_http_requests_total", &labels).increment(1);
    histogram!("mallquest_http_request_duration_seconds", &labels).record(duration_secs);
}

/// Track every request.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    record_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(
            normalize_path("/api/mission/550e8400-e29b-41d4-a716-446655440000/claim"),
            "/api/mission/:id/claim"
        );
        assert_eq!(normalize_path("/api/leaderboard/coins"), "/api/leaderboard/coins");
    }
}
