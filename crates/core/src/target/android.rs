//! Target backed by a length-prefixed TCP connection to the device
//!
//! Each `AndroidTarget` is a cheap handle onto a task that owns the socket,
//! the correlation tables, the filter table and two lanes of in-flight
//! pipelines (one per direction). A lane runs at most one pipeline at a time
//! and holds later messages back until it finishes, so messages leave a
//! target in the order they entered it.
//!
//! Messages pushed to the client through the handle (`fire_event_to_tools`,
//! `fire_result_to_tools`) land in an outbox that is flushed before anything
//! else goes to the client. A filter that pushes messages and then forwards
//! its own is therefore observed by the client in that order.

use super::correlation::{CallIdAllocator, CallReply, Correlation};
use super::filter::{FilterKey, FilterOutcome, FilterTable, MessageFilter, Pipeline, run_pipeline};
use super::{Target, TargetEvent, TargetOptions, ToolsSink};
use crate::error::TargetError;
use crate::protocol::envelope::{self, DISPATCH_MESSAGE_FROM_TARGET};
use crate::protocol::frame::{FrameDecoder, encode_frame, frame_text};
use crate::protocol::{ProxyRequestId, RequestId};
use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::future::{Future, pending};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

const EVENT_CAPACITY: usize = 256;

enum Command {
    Connect {
        url: String,
        tools: Option<ToolsSink>,
    },
    UpdateClient(ToolsSink),
    Forward(String),
    AddFilter(FilterKey, Arc<dyn MessageFilter>),
    Call {
        id: ProxyRequestId,
        method: String,
        params: Value,
        reply: CallReply,
    },
    CancelCall(ProxyRequestId),
    FlushOutbox,
    Kill,
}

/// Client-bound messages pushed through the handle
#[derive(Debug, Default)]
struct Outbox {
    queue: Mutex<VecDeque<String>>,
}

impl Outbox {
    fn push(&self, raw: String) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(raw);
    }

    fn take(&self) -> VecDeque<String> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Handle to a device session over a framed TCP socket
#[derive(Clone)]
pub struct AndroidTarget {
    id: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TargetEvent>,
    outbox: Arc<Outbox>,
    call_ids: Arc<CallIdAllocator>,
    call_timeout: Duration,
}

impl AndroidTarget {
    /// Start the session task; nothing connects until `connect_to`
    ///
    /// `address` is the `host:port` of the device socket, usually the local
    /// end of an ADB tunnel.
    pub fn spawn<I: Into<String>, A: Into<String>>(
        id: I,
        address: A,
        options: TargetOptions,
    ) -> Self {
        let id: Arc<str> = Arc::from(id.into());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let call_timeout = options.call_timeout;
        let outbox = Arc::new(Outbox::default());

        let actor = TargetActor::new(
            id.to_string(),
            address.into(),
            options,
            command_rx,
            events.clone(),
            outbox.clone(),
        );
        tokio::spawn(actor.run());

        Self {
            id,
            commands,
            events,
            outbox,
            call_ids: Arc::new(CallIdAllocator::new()),
            call_timeout,
        }
    }

    fn send(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            debug!(target_id = %self.id, "Target task has already finished");
            return false;
        }
        true
    }

    fn push_to_tools(&self, raw: String) {
        self.outbox.push(raw);
        self.send(Command::FlushOutbox);
    }
}

impl fmt::Debug for AndroidTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AndroidTarget")
            .field("id", &self.id)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

#[async_trait]
impl Target for AndroidTarget {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect_to(&self, url: &str, tools: ToolsSink) {
        self.send(Command::Connect {
            url: url.to_string(),
            tools: Some(tools),
        });
    }

    fn direct_connect_to(&self, url: &str) {
        self.send(Command::Connect {
            url: url.to_string(),
            tools: None,
        });
    }

    fn update_client(&self, tools: ToolsSink) {
        self.send(Command::UpdateClient(tools));
    }

    fn forward(&self, message: String) {
        if !self.send(Command::Forward(message)) {
            // Writing to a session that is gone
            let _ = self.events.send(TargetEvent::SocketClosed {
                target_id: self.id.to_string(),
            });
        }
    }

    fn add_message_filter(&self, key: FilterKey, filter: Arc<dyn MessageFilter>) {
        self.send(Command::AddFilter(key, filter));
    }

    async fn call_target(&self, method: &str, params: Value) -> Result<Value, TargetError> {
        let id = self.call_ids.next();
        let (reply, response) = oneshot::channel();
        let command = Command::Call {
            id,
            method: method.to_string(),
            params,
            reply,
        };
        if !self.send(command) {
            return Err(TargetError::Closed);
        }

        match tokio::time::timeout(self.call_timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TargetError::Closed),
            Err(_) => {
                self.send(Command::CancelCall(id));
                Err(TargetError::Timeout {
                    millis: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    fn fire_event_to_tools(&self, method: &str, params: Value) {
        let message = envelope::notification(method, params);
        self.push_to_tools(message.to_string());
    }

    fn fire_result_to_tools(&self, id: i64, result: Value) {
        let message = envelope::result(id, result);
        self.push_to_tools(message.to_string());
    }

    fn subscribe(&self) -> broadcast::Receiver<TargetEvent> {
        self.events.subscribe()
    }

    fn kill(&self) {
        self.send(Command::Kill);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Messages accepted before the device socket opened
enum Buffered {
    Tools(String),
    Call(String),
}

enum Staged {
    /// Goes out byte for byte
    Raw(String),
    /// Goes out after the pipeline, if it is not dropped
    Filtered(Pipeline, Value),
}

#[derive(Default)]
struct Lane {
    running: Option<BoxFuture<'static, FilterOutcome>>,
    /// `id` of the message in the running pipeline
    running_id: Option<i64>,
    backlog: VecDeque<Staged>,
}

impl Lane {
    /// Next item to process, unless a pipeline is still running
    fn next(&mut self) -> Option<Staged> {
        if self.running.is_some() {
            return None;
        }
        self.backlog.pop_front()
    }

    fn start(&mut self, pipeline: Pipeline, message: Value) {
        self.running_id = envelope::message_id(&message);
        self.running = Some(Box::pin(run_pipeline(pipeline, message)));
    }

    /// Mark the running pipeline done, returning the id of its message
    fn finish(&mut self) -> Option<i64> {
        self.running = None;
        self.running_id.take()
    }

    fn clear(&mut self) {
        self.running = None;
        self.running_id = None;
        self.backlog.clear();
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

struct TargetActor {
    id: String,
    address: String,
    url: String,
    options: TargetOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<TargetEvent>,
    outbox: Arc<Outbox>,
    tools: Option<ToolsSink>,
    link: Link,
    connecting: Option<ConnectFuture>,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    decoder: FrameDecoder,
    buffered: Vec<Buffered>,
    correlation: Correlation,
    filters: FilterTable,
    to_device: Lane,
    to_tools: Lane,
}

impl TargetActor {
    fn new(
        id: String,
        address: String,
        options: TargetOptions,
        commands: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<TargetEvent>,
        outbox: Arc<Outbox>,
    ) -> Self {
        let decoder = FrameDecoder::with_max_frame_size(options.max_frame_size);
        Self {
            id,
            address,
            url: String::new(),
            options,
            commands,
            events,
            outbox,
            tools: None,
            link: Link::Idle,
            connecting: None,
            reader: None,
            writer: None,
            decoder,
            buffered: Vec::new(),
            correlation: Correlation::new(),
            filters: FilterTable::new(),
            to_device: Lane::default(),
            to_tools: Lane::default(),
        }
    }

    async fn run(mut self) {
        debug!(target_id = %self.id, address = %self.address, "Target task started");

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Kill) | None => {
                        self.shutdown().await;
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                connected = poll_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect(connected).await;
                }
                read = read_device(&mut self.reader, self.decoder.buffer_mut()) => {
                    self.on_device_read(read);
                }
                outcome = poll_lane(&mut self.to_device.running) => {
                    let id = self.to_device.finish();
                    match outcome {
                        FilterOutcome::Forward(message) => {
                            self.send_to_target(message.to_string()).await;
                        }
                        FilterOutcome::Drop => {
                            // No response will come for a request that never left
                            if let Some(id) = id {
                                self.correlation.take_tool_request(id);
                            }
                        }
                    }
                    self.drain_device_lane().await;
                }
                outcome = poll_lane(&mut self.to_tools.running) => {
                    self.to_tools.finish();
                    if let FilterOutcome::Forward(message) = outcome {
                        self.send_to_tools(message.to_string());
                    }
                    self.drain_tools_lane();
                }
            }

            if self.link == Link::Closed {
                break;
            }
        }

        debug!(target_id = %self.id, "Target task finished");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { url, tools } => {
                if self.link != Link::Idle {
                    error!(target_id = %self.id, "Already connected");
                    return;
                }
                self.url = url;
                if tools.is_some() {
                    self.tools = tools;
                }
                self.start_connect();
            }
            Command::UpdateClient(tools) => {
                self.reset_link();
                self.tools = Some(tools);
                self.start_connect();
            }
            Command::Forward(raw) => {
                if self.link == Link::Connected {
                    self.on_message_from_tools(raw).await;
                } else {
                    debug!(target_id = %self.id, "Connection not yet open, buffering message");
                    self.buffered.push(Buffered::Tools(raw));
                }
            }
            Command::AddFilter(key, filter) => {
                debug!(target_id = %self.id, filter = %key, "Registered message filter");
                self.filters.add(key, filter);
            }
            Command::Call {
                id,
                method,
                params,
                reply,
            } => {
                self.correlation.register_call(id, reply);
                let request = envelope::request(id.wire(), &method, params).to_string();
                if self.link == Link::Connected {
                    self.to_device.backlog.push_back(Staged::Raw(request));
                    self.drain_device_lane().await;
                } else {
                    self.buffered.push(Buffered::Call(request));
                }
            }
            Command::CancelCall(id) => {
                if self.correlation.cancel_call(id) {
                    warn!(target_id = %self.id, id = %id, "Proxy call timed out");
                }
            }
            Command::FlushOutbox => self.flush_outbox(),
            // Handled by the run loop
            Command::Kill => {}
        }
    }

    fn start_connect(&mut self) {
        debug!(target_id = %self.id, address = %self.address, "Connecting to device");
        self.link = Link::Connecting;
        let address = self.address.clone();
        self.connecting = Some(Box::pin(async move { TcpStream::connect(address).await }));
    }

    async fn on_connect(&mut self, connected: io::Result<TcpStream>) {
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                error!(target_id = %self.id, address = %self.address, "Failed to connect to device: {}", e);
                self.close_link();
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(target_id = %self.id, "Failed to set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.link = Link::Connected;
        info!(target_id = %self.id, url = %self.url, "Connection established to {}", self.address);

        let buffered = std::mem::take(&mut self.buffered);
        if !buffered.is_empty() {
            debug!(target_id = %self.id, count = buffered.len(), "Replaying buffered messages");
        }
        for item in buffered {
            match item {
                Buffered::Tools(raw) => self.on_message_from_tools(raw).await,
                Buffered::Call(request) => {
                    self.to_device.backlog.push_back(Staged::Raw(request));
                    self.drain_device_lane().await;
                }
            }
            if self.link != Link::Connected {
                break;
            }
        }
    }

    fn on_device_read(&mut self, read: io::Result<usize>) {
        match read {
            Ok(0) => {
                debug!(target_id = %self.id, "Socket is closed");
                self.close_link();
            }
            Ok(n) => {
                trace!(target_id = %self.id, bytes = n, "Received data from device");
                self.process_buffer();
            }
            Err(e) => {
                error!(target_id = %self.id, "Device read failed: {}", e);
                self.close_link();
            }
        }
    }

    /// Dispatch every complete frame currently buffered
    fn process_buffer(&mut self) {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => match frame_text(&frame) {
                    Ok(text) => self.on_message_from_target(text.to_string()),
                    Err(e) => warn!(target_id = %self.id, "Dropping frame: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    // The stream cannot be resynchronized past a bad length
                    error!(target_id = %self.id, "Device stream is corrupt: {}", e);
                    self.close_link();
                    break;
                }
            }
        }
    }

    async fn on_message_from_tools(&mut self, raw: String) {
        let message = match envelope::parse(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(target_id = %self.id, "Dropping malformed client message: {}", e);
                return;
            }
        };

        let method = envelope::message_method(&message)
            .unwrap_or_default()
            .to_string();
        if let Some(id) = envelope::message_id(&message) {
            self.correlation.record_tool_request(id, method.clone());
        }
        self.emit(|| TargetEvent::Tools {
            method: method.clone(),
            message: message.clone(),
        });

        let staged = self.stage(&FilterKey::tools(method), raw, message);
        self.to_device.backlog.push_back(staged);
        self.drain_device_lane().await;
    }

    fn on_message_from_target(&mut self, raw: String) {
        trace!(target_id = %self.id, message = %raw, "Message from target");

        let mut raw = raw;
        let mut message = match envelope::parse(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(target_id = %self.id, "Dropping unparseable frame: {}", e);
                return;
            }
        };

        if self.options.target_based {
            match envelope::message_method(&message) {
                Some(method) if envelope::is_target_domain(method) => {}
                _ => return,
            }
            if envelope::message_method(&message) == Some(DISPATCH_MESSAGE_FROM_TARGET) {
                let inner = match envelope::dispatched_payload(&message) {
                    Ok(inner) => inner.to_string(),
                    Err(e) => {
                        warn!(target_id = %self.id, "Dropping frame: {}", e);
                        return;
                    }
                };
                message = match envelope::parse(&inner) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(target_id = %self.id, "Dropping dispatched message: {}", e);
                        return;
                    }
                };
                raw = inner;
            }
        }

        if !envelope::has_id(&message) {
            let method = envelope::message_method(&message)
                .unwrap_or_default()
                .to_string();
            self.emit(|| TargetEvent::Target {
                method: method.clone(),
                message: message.clone(),
            });
            let staged = self.stage(&FilterKey::target(method), raw, message);
            self.to_tools.backlog.push_back(staged);
            self.drain_tools_lane();
            return;
        }

        let classified = envelope::message_id(&message).and_then(|id| self.correlation.classify(id));
        match classified {
            Some(RequestId::Tools(id)) => {
                let method = self.correlation.take_tool_request(id).unwrap_or_default();
                self.emit(|| TargetEvent::Target {
                    method: method.clone(),
                    message: message.clone(),
                });

                let error_key = FilterKey::target_error();
                let key = if envelope::is_error(&message) && self.filters.contains(&error_key) {
                    error_key
                } else {
                    FilterKey::target(method)
                };
                let staged = self.stage(&key, raw, message);
                self.to_tools.backlog.push_back(staged);
                self.drain_tools_lane();
            }
            Some(RequestId::Proxy(id)) => {
                if let Err(e) = self.correlation.settle_call(id, &message) {
                    error!(target_id = %self.id, "Unhandled type of response from target: {} ({})", raw, e);
                }
            }
            None => {
                warn!(target_id = %self.id, "Unhandled message from target: {}", raw);
                self.to_tools.backlog.push_back(Staged::Raw(raw));
                self.drain_tools_lane();
            }
        }
    }

    fn stage(&self, key: &FilterKey, raw: String, message: Value) -> Staged {
        match self.filters.pipeline(key) {
            Some(pipeline) => Staged::Filtered(pipeline, message),
            None => Staged::Raw(raw),
        }
    }

    async fn drain_device_lane(&mut self) {
        while let Some(item) = self.to_device.next() {
            match item {
                Staged::Raw(raw) => self.send_to_target(raw).await,
                Staged::Filtered(pipeline, message) => self.to_device.start(pipeline, message),
            }
            if self.link == Link::Closed {
                break;
            }
        }
    }

    fn drain_tools_lane(&mut self) {
        while let Some(item) = self.to_tools.next() {
            match item {
                Staged::Raw(raw) => self.send_to_tools(raw),
                Staged::Filtered(pipeline, message) => self.to_tools.start(pipeline, message),
            }
        }
    }

    async fn send_to_target(&mut self, raw: String) {
        trace!(target_id = %self.id, message = %raw, "Sending to target");

        let raw = if self.options.target_based {
            match self.wrap_for_session(raw) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(target_id = %self.id, "Dropping message for target: {}", e);
                    return;
                }
            }
        } else {
            raw
        };

        let frame = match encode_frame(raw.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target_id = %self.id, "Dropping message for target: {}", e);
                return;
            }
        };

        let Some(writer) = self.writer.as_mut() else {
            self.close_link();
            return;
        };
        if let Err(e) = writer.write_all(&frame).await {
            error!(target_id = %self.id, "Write to device failed: {}", e);
            self.close_link();
        }
    }

    fn wrap_for_session(&self, raw: String) -> crate::error::Result<String> {
        let message = envelope::parse(&raw)?;
        let wrap = envelope::message_method(&message)
            .is_some_and(|method| !envelope::is_target_domain(method));
        if !wrap {
            return Ok(raw);
        }
        Ok(envelope::wrap_for_target(message, &self.options.target_id)?.to_string())
    }

    fn send_to_tools(&self, raw: String) {
        self.flush_outbox();
        self.deliver_to_tools(raw);
    }

    fn flush_outbox(&self) {
        for raw in self.outbox.take() {
            self.deliver_to_tools(raw);
        }
    }

    fn deliver_to_tools(&self, raw: String) {
        trace!(target_id = %self.id, message = %raw, "Sending to tools");
        match &self.tools {
            Some(tools) if !tools.is_closed() => {
                let _ = tools.send(raw);
            }
            _ => debug!(target_id = %self.id, "No client attached, dropping message"),
        }
    }

    fn emit<F: FnOnce() -> TargetEvent>(&self, event: F) {
        if self.events.receiver_count() > 0 {
            let _ = self.events.send(event());
        }
    }

    /// Drop the device side and tell subscribers the session is over
    fn close_link(&mut self) {
        if self.link == Link::Closed {
            return;
        }
        self.link = Link::Closed;
        self.connecting = None;
        self.reader = None;
        self.writer = None;
        self.correlation.clear();
        self.to_device.clear();
        let _ = self.events.send(TargetEvent::SocketClosed {
            target_id: self.id.clone(),
        });
    }

    /// Forget the current connection but keep filters and buffered messages
    fn reset_link(&mut self) {
        self.link = Link::Idle;
        self.connecting = None;
        self.reader = None;
        self.writer = None;
        self.decoder.clear();
        self.correlation.clear();
        self.to_device.clear();
        self.to_tools.clear();
    }

    async fn shutdown(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.reset_link();
        info!(target_id = %self.id, "Target killed");
    }
}

async fn poll_connect(connecting: &mut Option<ConnectFuture>) -> io::Result<TcpStream> {
    match connecting {
        Some(connect) => connect.await,
        None => pending().await,
    }
}

async fn read_device(reader: &mut Option<OwnedReadHalf>, buffer: &mut BytesMut) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read_buf(buffer).await,
        None => pending().await,
    }
}

async fn poll_lane(running: &mut Option<BoxFuture<'static, FilterOutcome>>) -> FilterOutcome {
    match running {
        Some(pipeline) => pipeline.await,
        None => pending().await,
    }
}
