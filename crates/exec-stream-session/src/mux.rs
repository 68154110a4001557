//! Stream multiplexer.
//!
//! The multiplexer is the only writer of the transport and the first reader
//! of it. It runs as a set of tasks:
//!
//! ```text
//!  source pumps ──data──▶ ┌────────┐
//!                         │ writer │──frames──▶ transport sink
//!  controller ──control─▶ └────────┘
//!                              ▲ pause/resume/backlog
//!  transport source ──▶ reader ┴──bytes──▶ sink pumps ──▶ consumers
//! ```
//!
//! Flow signals and lifecycle commands use a priority channel, so a pause is
//! applied before any data queued behind it. Data submitted while a stream is
//! paused is held in order and released on resume. Source pumps stop reading
//! while their stream is paused, which bounds what can be held.

use std::{
    collections::VecDeque,
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use exec_stream_core::{
    ByteSink, ByteSource, FlowSignal, FlowState, FlowTable, Frame, FrameError, FrameSink,
    FrameSource, MessageType, SessionConfig, StreamId, TermSize, Transport, TransportError,
};
use futures::future::join_all;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::state::{Role, SessionState};

/// Event reported to the session controller.
#[derive(Debug)]
pub enum MuxEvent {
    /// The peer changed the terminal geometry.
    Resize(TermSize),
    /// The peer announced the end of the session.
    Lifecycle(SessionState),
    /// A frame could not be decoded.
    Malformed(FrameError),
    /// A well-formed frame that this role never receives.
    Unexpected(MessageType),
    /// The peer closed the connection.
    TransportClosed,
    TransportFailed(TransportError),
}

/// Publishing side of the per-stream flow state.
pub struct FlowWatch {
    senders: Vec<watch::Sender<FlowState>>,
}

/// Observer of the per-stream flow state.
#[derive(Clone)]
pub struct FlowView {
    receivers: Vec<watch::Receiver<FlowState>>,
}

impl FlowWatch {
    /// Create a watch with every stream flowing.
    #[must_use]
    pub fn new() -> (Self, FlowView) {
        let (senders, receivers) = StreamId::ALL
            .iter()
            .map(|_| watch::channel(FlowState::Flowing))
            .unzip();
        (Self { senders }, FlowView { receivers })
    }

    fn publish(&self, stream: StreamId, state: FlowState) {
        self.senders[stream.index()].send_replace(state);
    }

    fn subscribe(&self, stream: StreamId) -> watch::Receiver<FlowState> {
        self.senders[stream.index()].subscribe()
    }
}

impl FlowView {
    #[must_use]
    pub fn get(&self, stream: StreamId) -> FlowState {
        *self.receivers[stream.index()].borrow()
    }

    /// Wait until `stream` reaches `state`. Returns false if the multiplexer
    /// is gone first.
    pub async fn wait_for(&self, stream: StreamId, state: FlowState) -> bool {
        let mut rx = self.receivers[stream.index()].clone();
        rx.wait_for(|s| *s == state).await.is_ok()
    }
}

enum Outbound {
    Data(StreamId, Bytes),
    Eof(StreamId),
}

impl Outbound {
    const fn stream(&self) -> StreamId {
        match self {
            Self::Data(stream, _) | Self::Eof(stream) => *stream,
        }
    }
}

enum Control {
    /// The peer paused or resumed our outbound streams.
    PeerFlow(FlowSignal),
    /// An inbound consumer fell behind or caught up.
    Backlog { stream: StreamId, congested: bool },
    /// The peer ended one of our inbound streams.
    InboundEnded(StreamId),
    Resize(TermSize),
    Finish {
        lifecycle: Option<Frame>,
        done: oneshot::Sender<()>,
    },
}

#[derive(Default)]
struct Backlog {
    bytes: AtomicUsize,
    congested: AtomicBool,
}

struct InboundQueue {
    tx: mpsc::UnboundedSender<Bytes>,
    backlog: Arc<Backlog>,
}

/// Running multiplexer of one session.
pub struct Multiplexer {
    control: mpsc::UnboundedSender<Control>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    sources: Vec<JoinHandle<()>>,
    sinks: Vec<JoinHandle<()>>,
}

impl Multiplexer {
    /// Spawn the writer, the reader and one pump per source and sink.
    ///
    /// Streams that the role does not send (for sources) or receive (for
    /// sinks) are ignored.
    #[must_use]
    pub fn start(
        role: Role,
        config: Arc<SessionConfig>,
        transport: Transport,
        sources: Vec<(StreamId, ByteSource)>,
        sinks: Vec<(StreamId, ByteSink)>,
        flow: FlowWatch,
    ) -> (Self, mpsc::UnboundedReceiver<MuxEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(config.outbound_queue_depth.max(1));
        let Transport { sink, source } = transport;

        // Streams nobody feeds or consumes start out ended.
        let mut table = FlowTable::new();
        for stream in StreamId::ALL {
            let attached = if role.sends(stream) {
                sources.iter().any(|(s, _)| *s == stream)
            } else {
                sinks.iter().any(|(s, _)| *s == stream)
            };
            if !attached {
                table.apply(stream, FlowSignal::End);
                flow.publish(stream, FlowState::Ended);
            }
        }

        let mut source_tasks = Vec::new();
        for (stream, reader) in sources {
            if !role.sends(stream) {
                tracing::warn!(%stream, ?role, "Ignoring source for a stream this role does not send");
                continue;
            }
            source_tasks.push(tokio::spawn(pump_source(
                stream,
                reader,
                data_tx.clone(),
                flow.subscribe(stream),
                config.read_buffer_size.max(1),
            )));
        }
        drop(data_tx);

        let mut queues: Vec<Option<InboundQueue>> = StreamId::ALL.iter().map(|_| None).collect();
        let mut sink_tasks = Vec::new();
        for (stream, writer) in sinks {
            if !role.receives(stream) {
                tracing::warn!(%stream, ?role, "Ignoring sink for a stream this role does not receive");
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let backlog = Arc::new(Backlog::default());
            sink_tasks.push(tokio::spawn(pump_sink(
                stream,
                writer,
                rx,
                Arc::clone(&backlog),
                config.inbound_low_water,
                control_tx.clone(),
            )));
            queues[stream.index()] = Some(InboundQueue { tx, backlog });
        }

        let reader = Reader {
            role,
            config: Arc::clone(&config),
            source,
            ended: table.clone(),
            queues,
            control: control_tx.clone(),
            events: event_tx.clone(),
        };
        let writer = Writer {
            role,
            config,
            sink,
            flow: table,
            watch: flow,
            held: StreamId::ALL.iter().map(|_| VecDeque::new()).collect(),
            congested: [false; 3],
            end_sent: false,
            healthy: true,
            events: event_tx,
        };

        let mux = Self {
            control: control_tx,
            writer: tokio::spawn(writer.run(control_rx, data_rx)),
            reader: tokio::spawn(reader.run()),
            sources: source_tasks,
            sinks: sink_tasks,
        };
        (mux, event_rx)
    }

    /// Send a resize frame to the peer.
    pub fn resize(&self, size: TermSize) -> bool {
        self.control.send(Control::Resize(size)).is_ok()
    }

    /// Wait for every source to reach end of stream. Sources still running
    /// after `limit` are stopped. Returns whether all of them finished.
    pub async fn drain_sources(&mut self, limit: Duration) -> bool {
        let mut pending = std::mem::take(&mut self.sources);
        if tokio::time::timeout(limit, join_all(pending.iter_mut()))
            .await
            .is_ok()
        {
            return true;
        }
        for task in &pending {
            task.abort();
        }
        false
    }

    /// Stop processing inbound frames and outbound data, flush what is
    /// already queued, send `lifecycle` if given and close the transport.
    /// Inbound consumers get up to `drain` to take what was delivered.
    pub async fn finish(mut self, lifecycle: Option<Frame>, drain: Duration) {
        self.reader.abort();
        let _ = (&mut self.reader).await;
        for task in &self.sources {
            task.abort();
        }
        for task in &mut self.sources {
            let _ = task.await;
        }

        let (done_tx, done_rx) = oneshot::channel();
        if self
            .control
            .send(Control::Finish {
                lifecycle,
                done: done_tx,
            })
            .is_ok()
        {
            let _ = done_rx.await;
        }
        let _ = (&mut self.writer).await;

        self.drain_sinks(drain).await;
    }

    /// Tear everything down without writing another frame.
    pub async fn abandon(mut self, drain: Duration) {
        self.writer.abort();
        self.reader.abort();
        for task in &self.sources {
            task.abort();
        }
        let _ = (&mut self.reader).await;
        self.drain_sinks(drain).await;
    }

    async fn drain_sinks(&mut self, limit: Duration) {
        let mut pending = std::mem::take(&mut self.sinks);
        if tokio::time::timeout(limit, join_all(pending.iter_mut()))
            .await
            .is_err()
        {
            tracing::debug!("Inbound consumers did not drain in time");
            for task in &pending {
                task.abort();
            }
        }
    }
}

struct Writer {
    role: Role,
    config: Arc<SessionConfig>,
    sink: Box<dyn FrameSink>,
    flow: FlowTable,
    watch: FlowWatch,
    held: Vec<VecDeque<Outbound>>,
    congested: [bool; 3],
    end_sent: bool,
    healthy: bool,
    events: mpsc::UnboundedSender<MuxEvent>,
}

impl Writer {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut data: mpsc::Receiver<Outbound>,
    ) {
        if let Err(e) = self.maybe_send_end().await {
            self.fail(e);
            return;
        }

        let mut data_open = true;
        loop {
            tokio::select! {
                biased;
                cmd = control.recv() => {
                    let Some(cmd) = cmd else { return };
                    let result = match cmd {
                        Control::Finish { lifecycle, done } => {
                            self.finish(&mut data, lifecycle).await;
                            let _ = done.send(());
                            return;
                        }
                        Control::PeerFlow(signal) => self.peer_flow(signal).await,
                        Control::Backlog { stream, congested } => {
                            self.backlog(stream, congested).await
                        }
                        Control::InboundEnded(stream) => {
                            self.set_flow(stream, FlowSignal::End);
                            self.backlog(stream, false).await
                        }
                        Control::Resize(size) => self.write(Frame::Resize(size)).await,
                    };
                    if let Err(e) = result {
                        self.fail(e);
                        return;
                    }
                }
                item = data.recv(), if data_open => match item {
                    Some(item) => {
                        if let Err(e) = self.outbound(item).await {
                            self.fail(e);
                            return;
                        }
                    }
                    None => data_open = false,
                },
            }
        }
    }

    async fn outbound(&mut self, item: Outbound) -> Result<(), TransportError> {
        let stream = item.stream();
        match self.flow.get(stream) {
            FlowState::Flowing => self.forward(item).await,
            FlowState::Paused => {
                self.held[stream.index()].push_back(item);
                Ok(())
            }
            FlowState::Ended => {
                if let Outbound::Data(_, payload) = &item {
                    tracing::warn!(%stream, bytes = payload.len(), "Dropping data for an ended stream");
                }
                Ok(())
            }
        }
    }

    async fn forward(&mut self, item: Outbound) -> Result<(), TransportError> {
        match item {
            Outbound::Data(stream, payload) => self.write_data(stream, payload).await,
            Outbound::Eof(stream) => {
                self.write(Frame::end_of(stream)).await?;
                self.set_flow(stream, FlowSignal::End);
                self.maybe_send_end().await
            }
        }
    }

    async fn write_data(&mut self, stream: StreamId, mut payload: Bytes) -> Result<(), TransportError> {
        if payload.is_empty() {
            return Ok(());
        }
        let Some(max) = self.config.max_frame_payload.filter(|&max| max > 0) else {
            return self.write(Frame::Data { stream, payload }).await;
        };
        while !payload.is_empty() {
            let chunk = payload.split_to(max.min(payload.len()));
            self.write(Frame::Data {
                stream,
                payload: chunk,
            })
            .await?;
        }
        Ok(())
    }

    async fn maybe_send_end(&mut self) -> Result<(), TransportError> {
        if !self.end_sent && self.flow.all_ended(self.role.outbound()) {
            self.end_sent = true;
            self.write(Frame::End).await?;
        }
        Ok(())
    }

    async fn peer_flow(&mut self, signal: FlowSignal) -> Result<(), TransportError> {
        for &stream in self.role.outbound() {
            self.set_flow(stream, signal);
        }
        if signal != FlowSignal::Resume {
            return Ok(());
        }
        for &stream in self.role.outbound() {
            while self.flow.get(stream).can_send() {
                let Some(item) = self.held[stream.index()].pop_front() else {
                    break;
                };
                self.forward(item).await?;
            }
        }
        Ok(())
    }

    /// Pause the peer while any inbound consumer is congested.
    async fn backlog(&mut self, stream: StreamId, congested: bool) -> Result<(), TransportError> {
        let was = self.congested.iter().any(|c| *c);
        self.congested[stream.index()] = congested;
        let now = self.congested.iter().any(|c| *c);
        let signal = match (was, now) {
            (false, true) => FlowSignal::Pause,
            (true, false) => FlowSignal::Resume,
            _ => return Ok(()),
        };
        self.write(if signal == FlowSignal::Pause {
            Frame::Pause
        } else {
            Frame::Resume
        })
        .await?;
        for &inbound in self.role.inbound() {
            self.set_flow(inbound, signal);
        }
        Ok(())
    }

    async fn finish(&mut self, data: &mut mpsc::Receiver<Outbound>, lifecycle: Option<Frame>) {
        data.close();
        while let Ok(item) = data.try_recv() {
            if !self.healthy {
                break;
            }
            if let Err(e) = self.outbound(item).await {
                tracing::warn!(error = %e, "Failed to flush queued output");
                self.healthy = false;
            }
        }

        let withheld: usize = self.held.iter().map(VecDeque::len).sum();
        if withheld > 0 {
            tracing::debug!(chunks = withheld, "Discarding output withheld by a paused peer");
        }
        for held in &mut self.held {
            held.clear();
        }
        for &stream in self.role.outbound() {
            self.set_flow(stream, FlowSignal::End);
        }

        if let Some(frame) = lifecycle {
            if self.healthy {
                tracing::debug!(kind = ?frame.message_type(), "Sending lifecycle frame");
                if let Err(e) = self.write(frame).await {
                    tracing::warn!(error = %e, "Failed to deliver lifecycle frame");
                }
            }
        }
        if let Err(e) = self.sink.close().await {
            tracing::debug!(error = %e, "Failed to close transport");
        }
    }

    async fn write(&mut self, frame: Frame) -> Result<(), TransportError> {
        tracing::trace!(kind = ?frame.message_type(), "Writing frame");
        let limit = self.config.write_timeout;
        match tokio::time::timeout(limit, self.sink.send(frame.encode())).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(limit)),
        }
    }

    fn set_flow(&mut self, stream: StreamId, signal: FlowSignal) {
        if let Some(state) = self.flow.apply(stream, signal) {
            tracing::debug!(%stream, %state, "Flow state changed");
            self.watch.publish(stream, state);
        }
    }

    fn fail(&mut self, error: TransportError) {
        tracing::error!(error = %error, "Transport write failed");
        self.healthy = false;
        let _ = self.events.send(MuxEvent::TransportFailed(error));
    }
}

struct Reader {
    role: Role,
    config: Arc<SessionConfig>,
    source: Box<dyn FrameSource>,
    /// Only inbound directions are tracked here.
    ended: FlowTable,
    queues: Vec<Option<InboundQueue>>,
    control: mpsc::UnboundedSender<Control>,
    events: mpsc::UnboundedSender<MuxEvent>,
}

impl Reader {
    async fn run(mut self) {
        loop {
            let next = match self.config.idle_timeout {
                Some(limit) => tokio::time::timeout(limit, self.source.recv())
                    .await
                    .unwrap_or(Some(Err(TransportError::Timeout(limit)))),
                None => self.source.recv().await,
            };
            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Transport read failed");
                    let _ = self.events.send(MuxEvent::TransportFailed(e));
                    return;
                }
                None => {
                    tracing::debug!("Transport closed by peer");
                    let _ = self.events.send(MuxEvent::TransportClosed);
                    return;
                }
            };
            match Frame::decode(message) {
                Ok(frame) => {
                    if self.dispatch(frame).is_break() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed frame");
                    let _ = self.events.send(MuxEvent::Malformed(e));
                }
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) -> ControlFlow<()> {
        match frame {
            Frame::Data { stream, payload } => self.data(stream, payload),
            Frame::Pause => {
                let _ = self.control.send(Control::PeerFlow(FlowSignal::Pause));
            }
            Frame::Resume => {
                let _ = self.control.send(Control::PeerFlow(FlowSignal::Resume));
            }
            Frame::End => {
                for &stream in self.role.inbound() {
                    self.end(stream);
                }
            }
            Frame::Resize(size) if self.role == Role::Controlled => {
                let _ = self.events.send(MuxEvent::Resize(size));
            }
            frame if frame.is_lifecycle() && self.role == Role::Controlling => {
                if let Some(state) = SessionState::from_lifecycle_frame(frame) {
                    let _ = self.events.send(MuxEvent::Lifecycle(state));
                }
                return ControlFlow::Break(());
            }
            other => {
                let kind = other.message_type();
                tracing::warn!(?kind, role = ?self.role, "Unexpected frame for this role");
                let _ = self.events.send(MuxEvent::Unexpected(kind));
            }
        }
        ControlFlow::Continue(())
    }

    fn data(&mut self, stream: StreamId, payload: Bytes) {
        if !self.role.receives(stream) {
            tracing::warn!(%stream, bytes = payload.len(), "Dropping data for a stream this role sends");
            return;
        }
        if payload.is_empty() {
            self.end(stream);
            return;
        }
        if let Err(e) = self.ended.check_send(stream) {
            tracing::warn!(error = %e, bytes = payload.len(), "Dropping data");
            return;
        }
        let Some(queue) = &self.queues[stream.index()] else {
            return;
        };

        let len = payload.len();
        let held = queue.backlog.bytes.load(Ordering::Acquire);
        if held + len > self.config.max_outstanding_bytes {
            tracing::warn!(%stream, held, bytes = len, "Inbound backlog full, dropping data");
            return;
        }
        queue.backlog.bytes.fetch_add(len, Ordering::AcqRel);
        if queue.tx.send(payload).is_err() {
            tracing::debug!(%stream, "Consumer gone, ending stream");
            self.end(stream);
            return;
        }
        if held + len >= self.config.inbound_high_water
            && !queue.backlog.congested.swap(true, Ordering::AcqRel)
        {
            tracing::debug!(%stream, backlog = held + len, "Inbound backlog high, pausing peer");
            let _ = self.control.send(Control::Backlog {
                stream,
                congested: true,
            });
        }
    }

    fn end(&mut self, stream: StreamId) {
        if self.ended.apply(stream, FlowSignal::End).is_some() {
            tracing::debug!(%stream, "Inbound stream ended");
            self.queues[stream.index()] = None;
            let _ = self.control.send(Control::InboundEnded(stream));
        }
    }
}

async fn pump_source(
    stream: StreamId,
    mut source: ByteSource,
    tx: mpsc::Sender<Outbound>,
    mut flow: watch::Receiver<FlowState>,
    buffer_size: usize,
) {
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        let state = match flow.wait_for(|s| *s != FlowState::Paused).await {
            Ok(state) => *state,
            Err(_) => return,
        };
        if state.is_ended() {
            return;
        }

        buf.reserve(buffer_size);
        match source.read_buf(&mut buf).await {
            Ok(0) => {
                tracing::debug!(%stream, "Source reached end of stream");
                let _ = tx.send(Outbound::Eof(stream)).await;
                return;
            }
            Ok(n) => {
                tracing::trace!(%stream, bytes = n, "Read from source");
                if tx
                    .send(Outbound::Data(stream, buf.split().freeze()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                // A pty master reports EIO once the child has gone.
                tracing::debug!(%stream, error = %e, "Source read failed, ending stream");
                let _ = tx.send(Outbound::Eof(stream)).await;
                return;
            }
        }
    }
}

async fn pump_sink(
    stream: StreamId,
    mut sink: ByteSink,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    backlog: Arc<Backlog>,
    low_water: usize,
    control: mpsc::UnboundedSender<Control>,
) {
    while let Some(chunk) = rx.recv().await {
        let written = write_chunk(&mut sink, &chunk).await;
        let remaining = backlog
            .bytes
            .fetch_sub(chunk.len(), Ordering::AcqRel)
            .saturating_sub(chunk.len());
        if let Err(e) = written {
            tracing::debug!(%stream, error = %e, "Consumer closed");
            break;
        }
        if remaining <= low_water && backlog.congested.swap(false, Ordering::AcqRel) {
            tracing::debug!(%stream, backlog = remaining, "Inbound backlog drained, resuming peer");
            let _ = control.send(Control::Backlog {
                stream,
                congested: false,
            });
        }
    }

    rx.close();
    while let Ok(chunk) = rx.try_recv() {
        backlog.bytes.fetch_sub(chunk.len(), Ordering::AcqRel);
    }
    if backlog.congested.swap(false, Ordering::AcqRel) {
        let _ = control.send(Control::Backlog {
            stream,
            congested: false,
        });
    }
    if let Err(e) = sink.shutdown().await {
        tracing::debug!(%stream, error = %e, "Failed to close consumer");
    }
}

async fn write_chunk(sink: &mut ByteSink, chunk: &[u8]) -> std::io::Result<()> {
    sink.write_all(chunk).await?;
    sink.flush().await
}
