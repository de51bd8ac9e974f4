//! Liveness HTTP server
//!
//! Minimal hyper HTTP/1.1 server used by orchestration health checks. It
//! never touches the cache or the engine.
//!
//! # Routes
//!
//! - `GET /livenessProbe` - `{"timestamp": <epoch millis>}`
//! - `GET /metrics` - processor statistics snapshot as JSON
//! - anything else - 404
//!
//! # Example
//!
//! ```no_run
//! use jsexec_metrics::ProcessorStats;
//! use jsexec_server::http_server::HttpServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = HttpServer::new(ProcessorStats::new());
//!     server.run("127.0.0.1:8888".parse().unwrap()).await.unwrap();
//! }
//! ```

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use jsexec_metrics::ProcessorStats;
use serde_json::json;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;

pub const LIVENESS_PATH: &str = "/livenessProbe";
pub const METRICS_PATH: &str = "/metrics";

pub struct HttpServer {
    stats: ProcessorStats,
}

impl HttpServer {
    pub fn new(stats: ProcessorStats) -> Self {
        Self { stats }
    }

    /// Binds `addr` and serves until the task is dropped.
    pub async fn run(self, addr: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves connections accepted on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        tracing::info!("Liveness server listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let stats = self.stats.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let stats = stats.clone();
                    async move { Ok::<_, Infallible>(handle_request(&stats, &req)) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!(%peer, "Error serving connection: {}", err);
                }
            });
        }
    }
}

fn handle_request(stats: &ProcessorStats, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    route(stats, req.method(), req.uri().path())
}

fn route(stats: &ProcessorStats, method: &Method, path: &str) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, LIVENESS_PATH) => json_response(StatusCode::OK, json!({ "timestamp": now_ms() })),
        (&Method::GET, METRICS_PATH) => match serde_json::to_value(stats.snapshot()) {
            Ok(snapshot) => json_response(StatusCode::OK, snapshot),
            Err(e) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": e.to_string() }),
            ),
        },
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" })),
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
