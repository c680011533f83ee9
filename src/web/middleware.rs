use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// 请求日志中间件
pub async fn request_logging(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let start_time = Instant::now();

    tracing::debug!("Request started: {} {} - User-Agent: {}", method, uri, user_agent);

    // 执行请求
    let response = next.run(req).await;

    let duration = start_time.elapsed();
    let status = response.status();

    if status.is_server_error() {
        tracing::warn!(
            "Request completed: {} {} - {} - {:.3}ms",
            method,
            uri,
            status,
            duration.as_secs_f64() * 1000.0
        );
    } else {
        tracing::info!(
            "Request completed: {} {} - {} - {:.3}ms",
            method,
            uri,
            status,
            duration.as_secs_f64() * 1000.0
        );
    }

    response
}
