//! Operator-facing admin surface
//!
//! Small hyper/http1 server with three routes:
//!
//! - `GET /cache/health` — backend probe + circuit breaker snapshot;
//!   HTTP 200 while healthy or degraded-but-serving, 503 otherwise.
//! - `GET /metrics/batch-optimizer` — per-loader counters and latency
//!   percentiles plus an aggregate hit-rate summary.
//! - `POST /cache/optimize` — control actions
//!   (`optimize|warm|start-monitoring|stop-monitoring|start-warming|stop-warming`);
//!   unknown actions get a 400.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::{CacheError, CacheService, HealthStatus};

#[derive(Debug, Deserialize)]
struct OptimizeRequest {
    action: String,
    target: Option<String>,
    aggressive: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    message: String,
    status: &'static str,
}

pub(crate) async fn run_admin_server(
    addr: SocketAddr,
    service: Arc<CacheService>,
) -> Result<(), CacheError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CacheError::Internal(format!("failed to bind admin server: {}", e)))?;

    info!("cache admin server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| CacheError::Internal(format!("admin server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let service = Arc::clone(&service);

        tokio::spawn(async move {
            let handler = service_fn(move |req| handle_request(req, Arc::clone(&service)));
            if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                debug!("admin server connection error: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    service: Arc<CacheService>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/cache/health") => {
            let report = service.health_check().await;
            let status = if report.status == HealthStatus::Error {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            json_response(status, &report)
        }
        (&Method::GET, "/metrics/batch-optimizer") => {
            json_response(StatusCode::OK, &service.loader_metrics())
        }
        (&Method::POST, "/cache/optimize") => handle_optimize(req, &service).await,
        _ => json_response(
            StatusCode::NOT_FOUND,
            &ActionResponse {
                message: "not found".to_owned(),
                status: "error",
            },
        ),
    };
    Ok(response)
}

async fn handle_optimize(
    req: Request<hyper::body::Incoming>,
    service: &CacheService,
) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ActionResponse {
                    message: format!("failed to read request body: {}", e),
                    status: "error",
                },
            )
        }
    };

    let request: OptimizeRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ActionResponse {
                    message: format!("invalid request body: {}", e),
                    status: "error",
                },
            )
        }
    };

    let message = match request.action.as_str() {
        "optimize" => {
            let aggressive = request.aggressive.unwrap_or(false);
            service.optimizer().optimize_manual(aggressive).await;
            format!("optimization pass complete (aggressive={})", aggressive)
        }
        "warm" => {
            let names = request.target.map(|t| vec![t]);
            let ran = service.warmer().warm_manual(names.as_deref()).await;
            format!("warmed {} tasks", ran)
        }
        "start-monitoring" => {
            service.optimizer().start_monitoring();
            "memory monitoring started".to_owned()
        }
        "stop-monitoring" => {
            service.optimizer().stop_monitoring();
            "memory monitoring stopped".to_owned()
        }
        "start-warming" => {
            service.warmer().start_periodic_warming();
            "periodic warming started".to_owned()
        }
        "stop-warming" => {
            service.warmer().stop_periodic_warming();
            "periodic warming stopped".to_owned()
        }
        other => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ActionResponse {
                    message: format!("unknown action: {}", other),
                    status: "error",
                },
            )
        }
    };

    json_response(
        StatusCode::OK,
        &ActionResponse {
            message,
            status: "ok",
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
