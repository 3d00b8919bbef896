//! # HTTP Server
//!
//! A single fallback route feeds each request to the dispatcher on a
//! blocking worker; git reads and handler calls are synchronous.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::config::HttpServerConfig;
use crate::dispatch::RequestDispatcher;
use crate::handlers::{HandlerRequest, HandlerResponse};

/// HTTP server in front of a dispatcher
pub struct HttpServer {
    config: HttpServerConfig,
    router: Router,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, dispatcher: Arc<RequestDispatcher>) -> Self {
        Self {
            config,
            router: Self::build_router(dispatcher),
        }
    }

    /// Router sending every request to `dispatcher`
    pub fn build_router(dispatcher: Arc<RequestDispatcher>) -> Router {
        Router::new()
            .fallback(dispatch_request)
            .with_state(dispatcher)
            .layer(TraceLayer::new_for_http())
    }

    /// Get the socket address
    pub fn socket_addr(&self) -> String {
        self.config.socket_addr()
    }

    /// Get the router (for testing)
    pub fn router(self) -> Router {
        self.router
    }

    /// Bind and serve until the process ends
    pub async fn start(self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        tracing::info!(addr = %listener.local_addr()?, "serving");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }
}

async fn dispatch_request(
    State(dispatcher): State<Arc<RequestDispatcher>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let mut request = HandlerRequest::new(method.as_str(), target).with_body(body.to_vec());
    request.remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    for (name, value) in headers.iter() {
        match value.to_str() {
            Ok(value) => request.headers.push((name.as_str().to_string(), value.to_string())),
            Err(_) => tracing::debug!(header = %name, "dropping non-text request header"),
        }
    }

    match tokio::task::spawn_blocking(move || dispatcher.dispatch(&request)).await {
        Ok(response) => into_http_response(response),
        Err(e) => {
            tracing::error!("dispatch task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Convert a dispatcher response to an HTTP response.
/// Invalid status codes become 500; invalid headers are skipped.
pub fn into_http_response(response: HandlerResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or_else(|_| {
        tracing::warn!(status = response.status, "handler set an invalid status code");
        StatusCode::INTERNAL_SERVER_ERROR
    });

    let mut headers = HeaderMap::new();
    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "skipping invalid response header"),
        }
    }

    (status, headers, Body::from(response.body)).into_response()
}
