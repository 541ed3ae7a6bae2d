//! The message correlator: turns one duplex DAP byte stream into a
//! request/response call model plus event and reverse-request streams.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::AdapterCommand;
use crate::error::BridgeError;
use crate::protocol::{
    encode_raw_frame, DecodedFrame, Event, FrameDecoder, ProtocolMessage, Request, Response,
};
use crate::Result;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK_SIZE: usize = 8 * 1024;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One framed DAP connection: a spawned adapter on stdio, or a TCP socket
/// (possibly one of several logical sessions against the same backend).
pub struct DapClient {
    writer: Arc<Mutex<BoxedWriter>>,
    next_seq: AtomicU64,
    pending: PendingMap,
    events_tx: broadcast::Sender<Event>,
    reverse_rx: Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
    closed_rx: watch::Receiver<bool>,
    reader_task: JoinHandle<()>,
    child: Mutex<Option<Child>>,
    shutdown_done: AtomicBool,
}

impl DapClient {
    /// Spawn the backend process and speak framed DAP over its stdio pipes.
    pub async fn spawn(adapter: &AdapterCommand) -> Result<Self> {
        tracing::info!(command = %adapter.command, args = ?adapter.args, "spawning DAP adapter");

        let mut child = Command::new(&adapter.command)
            .args(&adapter.args)
            .envs(&adapter.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                BridgeError::Environment(format!(
                    "failed to spawn adapter '{}': {e}",
                    adapter.command
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Environment("adapter stdin pipe missing".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Environment("adapter stdout pipe missing".to_string()))?;

        Ok(Self::from_io(Box::new(stdin), Box::new(stdout), Some(child)))
    }

    /// Spawn the backend process but talk DAP over a TCP socket it listens
    /// on. The connection is retried until the listener is up or the
    /// deadline passes.
    pub async fn spawn_and_connect(
        adapter: &AdapterCommand,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self> {
        tracing::info!(command = %adapter.command, %host, port, "spawning TCP DAP adapter");

        let mut child = Command::new(&adapter.command)
            .args(&adapter.args)
            .envs(&adapter.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                BridgeError::Environment(format!(
                    "failed to spawn adapter '{}': {e}",
                    adapter.command
                ))
            })?;

        let stream = match connect_with_retry(host, port, connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(e);
            }
        };
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_io(
            Box::new(write_half),
            Box::new(read_half),
            Some(child),
        ))
    }

    /// Open an additional logical connection to an already-running backend.
    /// Child sessions use this: same process, fresh socket.
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let stream = connect_with_retry(host, port, connect_timeout).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_io(Box::new(write_half), Box::new(read_half), None))
    }

    /// Assemble a client over arbitrary IO halves. Production code goes
    /// through `spawn`/`connect`; tests script a backend over in-memory
    /// pipes.
    pub(crate) fn from_io(
        writer: BoxedWriter,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        child: Option<Child>,
    ) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (reverse_tx, reverse_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let reader_task = tokio::spawn(reader_loop(
            reader,
            pending.clone(),
            events_tx.clone(),
            reverse_tx,
            closed_tx,
        ));

        Self {
            writer: Arc::new(Mutex::new(writer)),
            next_seq: AtomicU64::new(1),
            pending,
            events_tx,
            reverse_rx: Mutex::new(Some(reverse_rx)),
            closed_rx,
            reader_task,
            child: Mutex::new(child),
            shutdown_done: AtomicBool::new(false),
        }
    }

    /// Subscribe to unsolicited events, delivered in arrival order.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Take the reverse-request stream. Whoever takes it is responsible for
    /// answering every request; an unanswered reverse request hangs the
    /// backend.
    pub async fn take_reverse_requests(&self) -> Option<mpsc::UnboundedReceiver<Request>> {
        self.reverse_rx.lock().await.take()
    }

    /// Resolves when the transport closes (backend exit or socket EOF).
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Write the request and register its pending slot without waiting for
    /// the response. Needed for reversed handshakes where other traffic
    /// must flow between send and completion.
    pub async fn send_request_begin(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<(u64, oneshot::Receiver<Response>)> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let request = ProtocolMessage::Request(Request {
            seq,
            command: command.to_string(),
            arguments,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        tracing::debug!(command, seq, "sending DAP request");
        if let Err(e) = self.write_message(&request).await {
            self.pending.lock().await.remove(&seq);
            return Err(e);
        }

        Ok((seq, rx))
    }

    /// Wait for the response registered by [`Self::send_request_begin`].
    /// Exactly one of three things happens: success, a rejected response
    /// (`success: false`), or a timeout that clears the pending slot.
    pub async fn await_response(
        &self,
        command: &str,
        seq: u64,
        rx: oneshot::Receiver<Response>,
        wait: Duration,
    ) -> Result<Response> {
        let response = match timeout(wait, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(BridgeError::Connection(format!(
                    "connection closed while waiting for '{command}' response"
                )));
            }
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                return Err(BridgeError::timeout(format!("'{command}' response"), wait));
            }
        };

        if response.success {
            Ok(response)
        } else {
            Err(BridgeError::command_failed(command, response.error_text()))
        }
    }

    pub async fn send_request(
        &self,
        command: &str,
        arguments: Option<Value>,
        wait: Duration,
    ) -> Result<Response> {
        let (seq, rx) = self.send_request_begin(command, arguments).await?;
        self.await_response(command, seq, rx, wait).await
    }

    /// Answer a reverse request. The response's own `seq` comes from this
    /// side's counter; `request_seq` references the backend's request.
    pub async fn send_response(&self, request: &Request, success: bool, body: Value) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let response = ProtocolMessage::Response(Response {
            seq,
            request_seq: request.seq,
            command: request.command.clone(),
            success,
            message: None,
            body: if body.is_null() { None } else { Some(body) },
        });
        tracing::debug!(command = %request.command, request_seq = request.seq, "answering reverse request");
        self.write_message(&response).await
    }

    async fn write_message(&self, message: &ProtocolMessage) -> Result<()> {
        let frame = encode_raw_frame(&serde_json::to_value(message)?)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| BridgeError::Connection(format!("transport write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| BridgeError::Connection(format!("transport flush failed: {e}")))?;
        Ok(())
    }

    /// Idempotent teardown: stops the reader, rejects all pending requests
    /// and terminates the owned subprocess (graceful signal first, forced
    /// kill after the grace period).
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }

        self.reader_task.abort();
        self.pending.lock().await.clear();

        let child = self.child.lock().await.take();
        if let Some(child) = child {
            terminate_child(child, grace).await;
        }
    }
}

async fn connect_with_retry(host: &str, port: u16, deadline: Duration) -> Result<TcpStream> {
    let address = format!("{host}:{port}");
    let started = tokio::time::Instant::now();
    loop {
        match TcpStream::connect(&address).await {
            Ok(stream) => return Ok(stream),
            Err(e) if started.elapsed() < deadline => {
                tracing::debug!(%address, error = %e, "adapter not listening yet, retrying");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => {
                return Err(BridgeError::Connection(format!(
                    "failed to connect to adapter at {address}: {e}"
                )));
            }
        }
    }
}

/// Graceful-then-forced subprocess termination.
pub(crate) async fn terminate_child(mut child: Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
            if timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            tracing::warn!(pid, "adapter ignored SIGTERM, killing");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Reads frames and dispatches them: responses resolve pending slots, events
/// broadcast to subscribers, reverse requests go to the reverse channel.
/// Subscriber work never runs on this task, so parsing is never stalled.
async fn reader_loop(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    pending: PendingMap,
    events_tx: broadcast::Sender<Event>,
    reverse_tx: mpsc::UnboundedSender<Request>,
    closed_tx: watch::Sender<bool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "transport read failed");
                break;
            }
        };

        for frame in decoder.feed(&chunk[..read]) {
            match frame {
                DecodedFrame::Invalid(reason) => {
                    // One bad frame must not kill the connection.
                    tracing::warn!(%reason, "dropping malformed DAP frame");
                }
                DecodedFrame::Message(ProtocolMessage::Response(response)) => {
                    let waiter = pending.lock().await.remove(&response.request_seq);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => {
                            // Expected under timeout races; must not affect
                            // other pending entries.
                            tracing::debug!(
                                request_seq = response.request_seq,
                                command = %response.command,
                                "discarding response with no pending request"
                            );
                        }
                    }
                }
                DecodedFrame::Message(ProtocolMessage::Event(event)) => {
                    tracing::trace!(event = %event.event, "DAP event");
                    let _ = events_tx.send(event);
                }
                DecodedFrame::Message(ProtocolMessage::Request(request)) => {
                    tracing::debug!(command = %request.command, "reverse request from backend");
                    let _ = reverse_tx.send(request);
                }
            }
        }
    }

    let _ = closed_tx.send(true);
}
