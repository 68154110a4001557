//! WebSocket exec endpoint.
//!
//! Serves `/shell.sock`: each upgraded connection launches one process and
//! runs a controlled session over the socket until it ends.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use exec_stream_core::{
    Frame, FrameSink, FrameSource, ProcessEndpoint, ProcessError, SessionConfig, Transport,
    TransportError,
};
use exec_stream_session::{SessionController, SessionRegistry};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};

/// Write half of a server-side socket.
pub struct WsSink(SplitSink<WebSocket, Message>);

/// Read half of a server-side socket.
pub struct WsSource(SplitStream<WebSocket>);

/// Wrap an upgraded socket as a frame transport.
#[must_use]
pub fn transport(socket: WebSocket) -> Transport {
    let (sink, source) = socket.split();
    Transport::new(WsSink(sink), WsSource(source))
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        self.0
            .send(Message::Binary(message))
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0
            .close()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Text(_)) => tracing::debug!("Ignoring text message"),
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::Other(e.to_string()))),
            }
        }
    }
}

/// What the caller asked to run, from the upgrade request's query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// Repeated `command` parameters, in order. Empty means a shell.
    pub command: Vec<String>,
    pub tty: bool,
}

impl ExecRequest {
    /// Parse `command=..&command=..&tty=true|false`. Unknown keys are ignored.
    ///
    /// # Errors
    /// Returns a message if `tty` is not a boolean.
    pub fn from_query(params: &[(String, String)]) -> Result<Self, String> {
        let mut request = Self::default();
        for (key, value) in params {
            match key.as_str() {
                "command" => request.command.push(value.clone()),
                "tty" => {
                    request.tty = match value.as_str() {
                        "true" | "1" => true,
                        "false" | "0" | "" => false,
                        other => return Err(format!("Invalid tty value: {other}")),
                    };
                }
                _ => {}
            }
        }
        Ok(request)
    }
}

/// Starts the process for an exec request.
#[async_trait]
pub trait ExecLauncher: Send + Sync + 'static {
    /// Start the process described by `request`.
    async fn launch(&self, request: &ExecRequest) -> Result<ProcessEndpoint, ProcessError>;
}

/// Shared state of the exec endpoint.
#[derive(Clone)]
pub struct ExecState {
    pub launcher: Arc<dyn ExecLauncher>,
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<SessionConfig>,
}

impl ExecState {
    #[must_use]
    pub fn new(launcher: impl ExecLauncher, config: SessionConfig) -> Self {
        Self {
            launcher: Arc::new(launcher),
            registry: Arc::new(SessionRegistry::new()),
            config: Arc::new(config),
        }
    }
}

/// Upgrade handler for `/shell.sock`.
pub async fn exec_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<Vec<(String, String)>>,
    State(state): State<ExecState>,
) -> Response {
    let request = match ExecRequest::from_query(&params) {
        Ok(request) => request,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };
    ws.on_upgrade(move |socket| serve_socket(socket, request, state))
        .into_response()
}

async fn serve_socket(socket: WebSocket, request: ExecRequest, state: ExecState) {
    let mut transport = transport(socket);
    let controller = match SessionController::new(Arc::clone(&state.config)) {
        Ok(controller) => controller,
        Err(e) => {
            tracing::error!(error = %e, "Refusing exec session");
            reject(&mut transport, format!("Invalid session config: {e}")).await;
            return;
        }
    };
    let endpoint = match state.launcher.launch(&request).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::warn!(error = %e, command = ?request.command, "Failed to launch process");
            reject(&mut transport, format!("Failed to launch process: {e}")).await;
            return;
        }
    };

    let id = controller.id();
    state.registry.insert(controller.handle()).await;
    tracing::info!(%id, command = ?request.command, tty = request.tty, "Exec session started");

    let outcome = controller.serve(transport, endpoint).await;
    state.registry.remove(id).await;
    tracing::info!(%id, state = %outcome, "Exec session closed");
}

/// Send a single error frame and close.
async fn reject(transport: &mut Transport, message: String) {
    let frame = Frame::Error { message };
    if let Err(e) = transport.sink.send(frame.encode()).await {
        tracing::debug!(error = %e, "Failed to report error");
    }
    let _ = transport.sink.close().await;
}

/// Create the exec router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_exec_router(ExecState::new(launcher, config)));
/// ```
#[must_use]
pub fn create_exec_router(state: ExecState) -> Router {
    Router::new()
        .route("/shell.sock", get(exec_handler))
        .with_state(state)
}
