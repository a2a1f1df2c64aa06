//! # HTTP Server Module
//!
//! Hosts a [`Dispatcher`] behind axum. Every path is sent to the dispatcher; a request no
//! route handles gets a 404 and errors render through [`GatewayError`]'s `IntoResponse`.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Router as AxumRouter,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest};
use crate::gateway::dispatcher::Dispatcher;

/// Largest request body buffered before dispatch
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

#[derive(Clone)]
struct ServerState {
    dispatcher: Arc<Dispatcher>,
    max_body_size: usize,
}

/// axum host for a dispatcher
pub struct DispatcherServer {
    state: ServerState,
    bind_addr: SocketAddr,
}

impl DispatcherServer {
    pub fn new(dispatcher: Arc<Dispatcher>, bind_addr: SocketAddr) -> Self {
        Self {
            state: ServerState {
                dispatcher,
                max_body_size: DEFAULT_MAX_BODY_SIZE,
            },
            bind_addr,
        }
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.state.max_body_size = max_body_size;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// The axum application routing every request to the dispatcher
    pub fn app(&self) -> AxumRouter {
        AxumRouter::new()
            .fallback(handle_request)
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| GatewayError::internal(format!("Failed to bind to {}: {}", self.bind_addr, e)))?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.app();
        info!("Dispatcher listening on {}", listener.local_addr()?);

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| GatewayError::internal(format!("Server error: {}", e)))
    }
}

async fn handle_request(State(state): State<ServerState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let body = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return GatewayError::invalid_request("Failed to read request body").into_response();
        }
    };

    let mut incoming = IncomingRequest::new(parts.method, parts.uri, parts.headers, body);
    incoming.version = parts.version;
    incoming.remote_addr = remote_addr;

    match state.dispatcher.handle(incoming).await {
        Ok(Some(response)) => into_axum_response(response),
        Ok(None) => into_axum_response(GatewayResponse::error(StatusCode::NOT_FOUND, "No route matched")),
        Err(error) => error.into_response(),
    }
}

/// The body is fully buffered, so framing headers from the backend are dropped
fn into_axum_response(response: GatewayResponse) -> Response {
    let GatewayResponse {
        status,
        mut headers,
        body,
        ..
    } = response;
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);
    headers.remove(header::CONTENT_LENGTH);

    let mut out = Response::new(Body::from(body));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}
