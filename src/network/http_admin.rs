use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::AddrIncoming;
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use serde_json::json;

use crate::network::metrics;
use crate::sync::{CycleOutcome, SyncOrchestrator};

/// Serves the local admin API until the server fails.
///
/// - `GET /status`: current sync snapshot
/// - `GET /queue`: every queued mutation, oldest first
/// - `GET /metrics`: Prometheus counters
/// - `POST /sync`: run a full cycle and return its outcome
/// - `POST /flush`: run the upload phase only
pub async fn run_http_admin(
    addr: SocketAddr,
    orchestrator: Arc<SyncOrchestrator>,
) -> Result<(), hyper::Error> {
    serve(hyper::Server::try_bind(&addr)?, orchestrator).await
}

/// Like [`run_http_admin`], on a listener the caller already bound.
pub async fn serve_http_admin(
    listener: std::net::TcpListener,
    orchestrator: Arc<SyncOrchestrator>,
) -> Result<(), hyper::Error> {
    serve(hyper::Server::from_tcp(listener)?, orchestrator).await
}

async fn serve(
    builder: hyper::server::Builder<AddrIncoming>,
    orchestrator: Arc<SyncOrchestrator>,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let orchestrator = Arc::clone(&orchestrator);
                async move { handle(req, orchestrator).await }
            }))
        }
    });

    let server = builder.serve(make_svc);
    log::info!("Admin API listening on http://{}", server.local_addr());
    server.await
}

fn respond(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => respond(status, "application/json", Body::from(bytes)),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn json_error(status: StatusCode, msg: &str) -> Response<Body> {
    let body = json!({ "error": msg }).to_string();
    respond(status, "application/json", Body::from(body))
}

/// Bearer check against `TALLY_ADMIN_TOKEN` / `TALLY_READONLY_TOKEN`. With
/// neither set the API is open. Read-only tokens may not trigger cycles.
fn authenticate_http(req: &Request<Body>, allow_readonly: bool) -> Option<Response<Body>> {
    let admin_token = std::env::var("TALLY_ADMIN_TOKEN").ok();
    let readonly_token = std::env::var("TALLY_READONLY_TOKEN").ok();
    if admin_token.is_none() && readonly_token.is_none() {
        return None;
    }

    let raw = match req.headers().get(header::AUTHORIZATION) {
        Some(v) => v,
        None => return Some(json_error(StatusCode::UNAUTHORIZED, "missing authorization header")),
    };
    let Ok(raw) = raw.to_str() else {
        return Some(json_error(StatusCode::UNAUTHORIZED, "invalid authorization header"));
    };
    let Some(token) = raw.strip_prefix("Bearer ") else {
        return Some(json_error(StatusCode::UNAUTHORIZED, "invalid authorization scheme"));
    };

    if admin_token.as_deref() == Some(token) {
        return None;
    }
    if readonly_token.as_deref() == Some(token) {
        if allow_readonly {
            return None;
        }
        return Some(json_error(
            StatusCode::FORBIDDEN,
            "write operations are not allowed for read-only role",
        ));
    }

    Some(json_error(StatusCode::UNAUTHORIZED, "invalid token"))
}

fn cycle_response(result: Result<CycleOutcome, crate::sync::SyncError>) -> Response<Body> {
    match result {
        Ok(outcome @ CycleOutcome::Completed(_)) => json_response(StatusCode::OK, &outcome),
        Ok(outcome @ CycleOutcome::Skipped { .. }) => json_response(StatusCode::CONFLICT, &outcome),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn handle(
    req: Request<Body>,
    orchestrator: Arc<SyncOrchestrator>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    log::debug!("Admin request {method} {path}");

    let read_only = method == Method::GET;
    if let Some(denied) = authenticate_http(&req, read_only) {
        return Ok(denied);
    }

    let response = match (method, path.as_str()) {
        (Method::GET, "/status") => match orchestrator.snapshot().await {
            Ok(snapshot) => json_response(StatusCode::OK, &snapshot),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (Method::GET, "/queue") => match orchestrator.store().list().await {
            Ok(entries) => json_response(StatusCode::OK, &entries),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (Method::GET, "/metrics") => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            Body::from(metrics::render_prometheus()),
        ),
        (Method::POST, "/sync") => cycle_response(orchestrator.sync_all().await),
        (Method::POST, "/flush") => cycle_response(orchestrator.process_queue().await),
        (_, "/status" | "/queue" | "/metrics" | "/sync" | "/flush") => {
            json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_wraps_message() {
        let response = json_error(StatusCode::NOT_FOUND, "not \"here\"");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn skipped_cycle_maps_to_conflict() {
        let response = cycle_response(Ok(CycleOutcome::Skipped {
            reason: crate::sync::SkipReason::Offline,
        }));
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
