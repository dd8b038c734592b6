use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, error, warn};

pub async fn log_requests(req: Request<Body>, next: Next) -> Response {
    let uri = req.uri().clone();
    let method = req.method().clone();
    let started = Instant::now();

    let response = next.run(req).await;
    let status = response.status();
    let elapsed = started.elapsed();
    if status.is_server_error() {
        error!(
            method = %method,
            uri = %uri,
            status = %status,
            ?elapsed,
            "Server error"
        );
    } else if status.is_client_error() {
        warn!(
            method = %method,
            uri = %uri,
            status = %status,
            ?elapsed,
            "Client error"
        );
    } else {
        debug!(
            method = %method,
            uri = %uri,
            status = %status,
            ?elapsed,
            "Request served"
        );
    }

    response
}
