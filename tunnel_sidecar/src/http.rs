//! The liveness and metrics HTTP surfaces.
//!
//! Each surface is a small HTTP/1 server: an accept loop that hands every
//! connection to its own task, so a slow client or a slow handler never
//! blocks the next probe.

use crate::error::SidecarResult;
use crate::health::HealthEvaluator;
use crate::metrics::MetricsEngine;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Answers requests on one surface.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn respond(&self, method: &Method, path: &str) -> Response<Full<Bytes>>;
}

fn text_response(
    status: StatusCode,
    body: impl Into<Bytes>,
    content_type: &str,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

/// Liveness: reflects tunnel health only.
pub struct HealthEndpoint {
    evaluator: Arc<HealthEvaluator>,
}

impl HealthEndpoint {
    pub fn new(evaluator: Arc<HealthEvaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl Endpoint for HealthEndpoint {
    fn name(&self) -> &'static str {
        "health"
    }

    async fn respond(&self, _method: &Method, _path: &str) -> Response<Full<Bytes>> {
        let verdict = self.evaluator.evaluate().await;
        if verdict.is_healthy() {
            text_response(
                StatusCode::OK,
                format!("VPN is active ({})\n", verdict.reason),
                TEXT_PLAIN,
            )
        } else {
            text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("VPN unhealthy: {}\n", verdict.reason),
                TEXT_PLAIN,
            )
        }
    }
}

/// Text exposition of the metric registry on `/metrics`.
pub struct MetricsEndpoint {
    engine: Arc<MetricsEngine>,
}

impl MetricsEndpoint {
    pub fn new(engine: Arc<MetricsEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Endpoint for MetricsEndpoint {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn respond(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        if path != "/metrics" || (method != Method::GET && method != Method::HEAD) {
            return text_response(StatusCode::NOT_FOUND, "Not Found\n", TEXT_PLAIN);
        }
        match self.engine.scrape().await {
            Ok(body) => text_response(
                StatusCode::OK,
                body,
                &self.engine.registry().content_type(),
            ),
            Err(e) => {
                error!("Failed to render metrics: {}", e);
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("metrics unavailable: {}\n", e),
                    TEXT_PLAIN,
                )
            }
        }
    }
}

/// Bind a surface's listener. Done before serving so a port clash is
/// reported at startup.
pub async fn bind(address: &str, port: u16) -> SidecarResult<TcpListener> {
    let listener = TcpListener::bind((address, port)).await?;
    Ok(listener)
}

/// Serve `endpoint` on `listener` until `shutdown` fires.
///
/// Stops accepting immediately on shutdown; connections already being
/// served finish on their own tasks.
pub async fn serve<E: Endpoint>(
    listener: TcpListener,
    endpoint: Arc<E>,
    shutdown: CancellationToken,
) -> SidecarResult<()> {
    let local: Option<SocketAddr> = listener.local_addr().ok();
    info!(
        "{} endpoint listening on {}",
        endpoint.name(),
        local.map_or_else(|| "?".to_string(), |a| a.to_string())
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("{} endpoint shutting down", endpoint.name());
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted {} connection from {}", endpoint.name(), peer);
                        spawn_connection(stream, endpoint.clone());
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    Ok(())
}

fn spawn_connection<E: Endpoint>(stream: tokio::net::TcpStream, endpoint: Arc<E>) {
    tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let endpoint = endpoint.clone();
            async move {
                let response = endpoint.respond(req.method(), req.uri().path()).await;
                Ok::<_, Infallible>(response)
            }
        });

        if let Err(e) = http1::Builder::new()
            .keep_alive(false)
            .serve_connection(io, service)
            .await
        {
            let msg = e.to_string();
            if msg.contains("connection reset") || msg.contains("broken pipe") {
                debug!("Connection ended: {}", e);
            } else {
                warn!("Connection error: {}", e);
            }
        }
    });
}
