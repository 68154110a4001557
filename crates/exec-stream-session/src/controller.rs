//! Session controller.
//!
//! Drives one session from start to its terminal state: runs the
//! multiplexer, watches the process, applies resize requests and decides
//! which lifecycle frame (if any) the peer gets.

use std::{sync::Arc, time::Duration};

use exec_stream_core::{
    CallerEndpoint, ConfigError, Error, ExitStatus, FlowState, ProcessEndpoint, ProcessError,
    ProcessHandle, SessionConfig, StreamId, StreamSet, TermSize, TerminalResizer, Transport,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    mux::{FlowView, FlowWatch, MuxEvent, Multiplexer},
    state::{Role, SessionState},
};

enum Request {
    Shutdown(Option<String>),
    Resize(TermSize),
}

/// How the main loop ended.
enum Outcome {
    /// The process exited.
    Exited(ExitStatus),
    /// Local shutdown request.
    Shutdown(Option<String>),
    /// Protocol or process fault. The peer is still reachable.
    Failed(String),
    /// The transport is gone. Nothing more can be sent.
    Lost(String),
    /// The peer announced the outcome.
    Remote(SessionState),
}

/// Owns one session until it reaches a terminal state.
pub struct SessionController {
    id: Uuid,
    config: Arc<SessionConfig>,
    requests_tx: mpsc::UnboundedSender<Request>,
    requests: mpsc::UnboundedReceiver<Request>,
    state: watch::Sender<SessionState>,
    geometry: watch::Sender<Option<TermSize>>,
    flow: FlowWatch,
    view: FlowView,
}

impl SessionController {
    /// Create a controller for one session.
    ///
    /// # Errors
    /// Returns error if `config` fails validation.
    pub fn new(config: impl Into<Arc<SessionConfig>>) -> Result<Self, ConfigError> {
        let config = config.into();
        config.validate()?;
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (flow, view) = FlowWatch::new();
        Ok(Self {
            id: Uuid::new_v4(),
            config,
            requests_tx,
            requests,
            state: watch::Sender::new(SessionState::Running),
            geometry: watch::Sender::new(None),
            flow,
            view,
        })
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Handle for observing and steering the session from other tasks.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            requests: self.requests_tx.clone(),
            state: self.state.subscribe(),
            geometry: self.geometry.subscribe(),
            flow: self.view.clone(),
        }
    }

    /// Serve a process to the peer on the other end of `transport`.
    ///
    /// Returns the terminal state once the transport has been closed.
    pub async fn serve(self, transport: Transport, endpoint: ProcessEndpoint) -> SessionState {
        self.run(Role::Controlled, transport, endpoint.into_streams())
            .await
    }

    /// Drive a remote process from local streams.
    ///
    /// Returns the terminal state once the transport has been closed.
    pub async fn attach(self, transport: Transport, endpoint: CallerEndpoint) -> SessionState {
        self.run(Role::Controlling, transport, endpoint.into_streams())
            .await
    }

    async fn run(self, role: Role, transport: Transport, streams: StreamSet) -> SessionState {
        let span = tracing::info_span!("session", id = %self.id, ?role);
        self.drive(role, transport, streams).instrument(span).await
    }

    async fn drive(self, role: Role, transport: Transport, streams: StreamSet) -> SessionState {
        let Self {
            config,
            requests_tx,
            mut requests,
            state,
            geometry,
            flow,
            ..
        } = self;
        let StreamSet {
            sources,
            sinks,
            process,
            resizer,
            initial_size,
        } = streams;
        drop(requests_tx);

        tracing::info!("Session started");
        let (mut mux, mut events) =
            Multiplexer::start(role, Arc::clone(&config), transport, sources, sinks, flow);
        let mut monitor = process.map(ProcessMonitor::spawn);

        if let Some(size) = initial_size {
            geometry.send_replace(Some(size));
            if role == Role::Controlling {
                mux.resize(size);
            }
        }

        let mut protocol_errors = 0u32;
        let mut requests_open = true;
        let outcome = loop {
            tokio::select! {
                result = exited(&mut monitor) => break match result {
                    Ok(status) => {
                        tracing::info!(%status, "Process exited");
                        Outcome::Exited(status)
                    }
                    Err(e) => {
                        let error = Error::ProcessFailure(e);
                        tracing::error!(error = %error, "Lost track of process");
                        Outcome::Failed(error.to_string())
                    }
                },
                event = events.recv() => match event {
                    Some(MuxEvent::Resize(size)) => {
                        apply_resize(resizer.as_deref(), &geometry, size);
                    }
                    Some(MuxEvent::Lifecycle(remote)) => {
                        tracing::info!(state = %remote, "Peer ended the session");
                        break Outcome::Remote(remote);
                    }
                    Some(MuxEvent::Malformed(e)) => {
                        protocol_errors += 1;
                        if protocol_errors >= config.malformed_frame_limit {
                            break Outcome::Failed(Error::MalformedFrame(e).to_string());
                        }
                    }
                    Some(MuxEvent::Unexpected(kind)) => {
                        protocol_errors += 1;
                        if protocol_errors >= config.malformed_frame_limit {
                            break Outcome::Failed(format!("Unexpected {kind:?} frame"));
                        }
                    }
                    Some(MuxEvent::TransportClosed) => {
                        break Outcome::Lost("Connection closed unexpectedly".to_string());
                    }
                    Some(MuxEvent::TransportFailed(e)) => {
                        break Outcome::Lost(Error::from(e).to_string());
                    }
                    None => break Outcome::Lost("Multiplexer stopped".to_string()),
                },
                request = requests.recv(), if requests_open => match request {
                    Some(Request::Shutdown(reason)) => {
                        tracing::info!(reason = reason.as_deref().unwrap_or(""), "Shutdown requested");
                        break Outcome::Shutdown(reason);
                    }
                    Some(Request::Resize(size)) => {
                        if role == Role::Controlling {
                            geometry.send_replace(Some(size));
                            mux.resize(size);
                        } else {
                            apply_resize(resizer.as_deref(), &geometry, size);
                        }
                    }
                    None => requests_open = false,
                },
            }
        };

        let drain = config.drain_timeout;
        let announce = |state: &SessionState| {
            if role.emits_lifecycle() {
                state.lifecycle_frame()
            } else {
                None
            }
        };
        let terminal = match outcome {
            Outcome::Exited(status) => {
                if !mux.drain_sources(drain).await {
                    tracing::warn!(?drain, "Process output did not drain in time");
                }
                let terminal = SessionState::Stopped(status);
                mux.finish(announce(&terminal), drain).await;
                terminal
            }
            Outcome::Shutdown(reason) => {
                let terminal = SessionState::Shutdown { reason };
                mux.finish(announce(&terminal), drain).await;
                terminal
            }
            Outcome::Failed(message) => {
                tracing::error!(%message, "Session failed");
                let terminal = SessionState::Errored { message };
                mux.finish(announce(&terminal), drain).await;
                terminal
            }
            Outcome::Remote(remote) => {
                mux.finish(None, drain).await;
                remote
            }
            Outcome::Lost(message) => {
                tracing::warn!(%message, "Transport lost");
                mux.abandon(drain).await;
                SessionState::Errored { message }
            }
        };

        if let Some(monitor) = monitor {
            monitor.stop(config.kill_on_close, drain).await;
        }

        tracing::info!(state = %terminal, "Session ended");
        state.send_replace(terminal.clone());
        terminal
    }
}

fn apply_resize(
    resizer: Option<&dyn TerminalResizer>,
    geometry: &watch::Sender<Option<TermSize>>,
    size: TermSize,
) {
    tracing::debug!(%size, "Resizing terminal");
    if let Some(resizer) = resizer {
        if let Err(e) = resizer.resize(size) {
            tracing::warn!(error = %e, %size, "Failed to resize terminal");
        }
    }
    geometry.send_replace(Some(size));
}

async fn exited(monitor: &mut Option<ProcessMonitor>) -> Result<ExitStatus, ProcessError> {
    match monitor {
        Some(monitor) => monitor.exited().await,
        None => std::future::pending().await,
    }
}

/// Waits on the process in its own task so a kill can interrupt the wait.
struct ProcessMonitor {
    kill: Option<oneshot::Sender<()>>,
    /// `None` once the exit has been observed.
    exit: Option<oneshot::Receiver<Result<ExitStatus, ProcessError>>>,
    task: JoinHandle<()>,
}

impl ProcessMonitor {
    fn spawn(process: Box<dyn ProcessHandle>) -> Self {
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = exit_tx.send(watch_process(process, kill_rx).await);
        });
        Self {
            kill: Some(kill_tx),
            exit: Some(exit_rx),
            task,
        }
    }

    async fn exited(&mut self) -> Result<ExitStatus, ProcessError> {
        let Some(exit) = self.exit.as_mut() else {
            return std::future::pending().await;
        };
        let result = exit
            .await
            .unwrap_or_else(|_| Err(ProcessError::Other("Process monitor stopped".to_string())));
        self.exit = None;
        result
    }

    /// Kill the process if it is still running and `kill` is set, then give
    /// the monitor `limit` to reap it.
    async fn stop(mut self, kill: bool, limit: Duration) {
        let Some(mut exit) = self.exit.take() else {
            return;
        };
        if !kill {
            tracing::debug!("Leaving process running");
            return;
        }
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(limit, &mut self.task).await {
            Ok(_) => {
                if let Ok(Ok(status)) = exit.try_recv() {
                    tracing::debug!(%status, "Process reaped");
                }
            }
            Err(_) => {
                tracing::warn!(?limit, "Process did not exit after kill");
                self.task.abort();
            }
        }
    }
}

async fn watch_process(
    mut process: Box<dyn ProcessHandle>,
    mut kill: oneshot::Receiver<()>,
) -> Result<ExitStatus, ProcessError> {
    let exited = tokio::select! {
        result = process.wait() => Some(result),
        Ok(()) = &mut kill => None,
    };
    if let Some(result) = exited {
        return result;
    }
    tracing::debug!("Killing process");
    process.kill()?;
    process.wait().await
}

/// Cloneable view of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<SessionState>,
    geometry: watch::Receiver<Option<TermSize>>,
    flow: FlowView,
}

impl SessionHandle {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Last terminal size set by either side.
    #[must_use]
    pub fn geometry(&self) -> Option<TermSize> {
        *self.geometry.borrow()
    }

    /// Ask the session to shut down. Returns false if it already ended.
    ///
    /// An empty reason is treated as no reason.
    pub fn shutdown(&self, reason: Option<String>) -> bool {
        let reason = reason.filter(|r| !r.is_empty());
        self.requests.send(Request::Shutdown(reason)).is_ok()
    }

    /// Resize the terminal. Returns false if the session already ended.
    pub fn resize(&self, size: TermSize) -> bool {
        self.requests.send(Request::Resize(size)).is_ok()
    }

    /// Wait for the terminal state.
    pub async fn wait(&self) -> SessionState {
        let mut rx = self.state.clone();
        let terminal = match rx.wait_for(SessionState::is_terminal).await {
            Ok(state) => Some(state.clone()),
            Err(_) => None,
        };
        terminal.unwrap_or_else(|| rx.borrow().clone())
    }

    /// Stream of lifecycle states, starting with the current one.
    #[must_use]
    pub fn state_changes(&self) -> WatchStream<SessionState> {
        WatchStream::new(self.state.clone())
    }

    #[must_use]
    pub fn flow_state(&self, stream: StreamId) -> FlowState {
        self.flow.get(stream)
    }

    /// Wait until `stream` reaches `state`.
    pub async fn wait_flow(&self, stream: StreamId, state: FlowState) -> bool {
        self.flow.wait_for(stream, state).await
    }
}
