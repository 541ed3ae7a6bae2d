//! The REPL bridge: makes a blocking, line-oriented debugger process
//! conform to the request/response/event shape of the framed backends.
//!
//! Exactly one REPL command is in flight at a time; the output collected
//! between sending it and seeing the next prompt is its result. Commands
//! that resume execution never produce a prompt until the program stops
//! again, so they bypass the queue entirely.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, Mutex, Notify};
use tokio::time::timeout;

use crate::client::terminate_child;
use crate::config::AdapterCommand;
use crate::error::BridgeError;
use crate::protocol::Event;
use crate::repl::parser::ReplOutputParser;
use crate::Result;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTPUT_BUFFER_CAP: usize = 64 * 1024;

struct QueuedCommand {
    id: u64,
    text: String,
    responder: oneshot::Sender<String>,
}

struct InFlight {
    id: u64,
    output: String,
    responder: oneshot::Sender<String>,
}

#[derive(Default)]
struct BridgeState {
    queue: VecDeque<QueuedCommand>,
    current: Option<InFlight>,
    /// Accumulated raw output, scanned for position-independent events.
    scan_buffer: String,
    next_command_id: u64,
    ready: bool,
    terminated: bool,
}

pub struct ReplBridge {
    stdin: Arc<Mutex<ChildStdin>>,
    state: Arc<Mutex<BridgeState>>,
    parser: Arc<ReplOutputParser>,
    events_tx: broadcast::Sender<Event>,
    ready_notify: Arc<Notify>,
    child: Mutex<Option<Child>>,
}

impl ReplBridge {
    /// Spawn the REPL debugger and wait for it to come up (VM-started
    /// banner or first prompt).
    pub async fn spawn(adapter: &AdapterCommand, spawn_timeout: Duration) -> Result<Arc<Self>> {
        tracing::info!(command = %adapter.command, args = ?adapter.args, "spawning REPL debugger");

        let mut child = Command::new(&adapter.command)
            .args(&adapter.args)
            .envs(&adapter.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BridgeError::Environment(format!(
                    "failed to spawn REPL debugger '{}': {e}",
                    adapter.command
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Environment("REPL stdin pipe missing".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Environment("REPL stdout pipe missing".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::Environment("REPL stderr pipe missing".to_string()))?;

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let bridge = Arc::new(Self {
            stdin: Arc::new(Mutex::new(stdin)),
            state: Arc::new(Mutex::new(BridgeState::default())),
            parser: Arc::new(ReplOutputParser::new()),
            events_tx,
            ready_notify: Arc::new(Notify::new()),
            child: Mutex::new(Some(child)),
        });

        // stdout and stderr both carry meaningful output; classify both.
        for reader in [
            tokio::io::BufReader::new(Box::new(stdout) as Box<dyn tokio::io::AsyncRead + Send + Unpin>),
            BufReader::new(Box::new(stderr) as Box<dyn tokio::io::AsyncRead + Send + Unpin>),
        ] {
            let bridge_for_reader = bridge.clone();
            tokio::spawn(async move {
                bridge_for_reader.read_loop(reader).await;
            });
        }

        bridge.wait_until_ready(spawn_timeout).await?;
        Ok(bridge)
    }

    /// Test entry: wire a bridge around arbitrary IO without a process.
    #[cfg(test)]
    pub(crate) fn from_io_for_tests(
        stdin: ChildStdin,
        output: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let bridge = Arc::new(Self {
            stdin: Arc::new(Mutex::new(stdin)),
            state: Arc::new(Mutex::new(BridgeState::default())),
            parser: Arc::new(ReplOutputParser::new()),
            events_tx,
            ready_notify: Arc::new(Notify::new()),
            child: Mutex::new(None),
        });
        let bridge_for_reader = bridge.clone();
        tokio::spawn(async move {
            bridge_for_reader.read_loop(BufReader::new(output)).await;
        });
        bridge
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.ready
    }

    async fn wait_until_ready(&self, wait: Duration) -> Result<()> {
        if self.is_ready().await {
            return Ok(());
        }
        let notified = self.ready_notify.notified();
        if timeout(wait, notified).await.is_err() && !self.is_ready().await {
            return Err(BridgeError::timeout("REPL debugger startup", wait));
        }
        Ok(())
    }

    /// Queue a command and collect its output up to the next prompt.
    pub async fn execute(&self, text: &str, wait: Duration) -> Result<String> {
        let (responder, rx) = oneshot::channel();
        let id = {
            let mut state = self.state.lock().await;
            if state.terminated {
                return Err(BridgeError::SessionClosed);
            }
            state.next_command_id += 1;
            let id = state.next_command_id;
            state.queue.push_back(QueuedCommand {
                id,
                text: text.to_string(),
                responder,
            });
            id
        };
        self.pump_queue().await;

        match timeout(wait, rx).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(_)) => Err(BridgeError::SessionClosed),
            Err(_) => {
                // Give the queue back to the next command; a stuck REPL
                // command must not wedge everything behind it.
                let mut state = self.state.lock().await;
                if state.current.as_ref().is_some_and(|current| current.id == id) {
                    state.current = None;
                }
                state.queue.retain(|queued| queued.id != id);
                drop(state);
                self.pump_queue().await;
                Err(BridgeError::timeout(format!("REPL command '{text}'"), wait))
            }
        }
    }

    /// Fire-and-forget send for commands that will not produce a prompt
    /// until the program stops again (`resume`, `step`, `run`). Waiting on
    /// these would block the queue indefinitely.
    pub async fn send_direct(&self, text: &str) -> Result<()> {
        tracing::debug!(command = text, "direct REPL command");
        self.write_line(text).await
    }

    async fn write_line(&self, text: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(format!("{text}\n").as_bytes())
            .await
            .map_err(|e| BridgeError::Connection(format!("REPL stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| BridgeError::Connection(format!("REPL stdin flush failed: {e}")))?;
        Ok(())
    }

    /// Dispatch the next queued command if nothing is in flight.
    async fn pump_queue(&self) {
        let to_send = {
            let mut state = self.state.lock().await;
            if state.current.is_some() {
                None
            } else {
                state.queue.pop_front().map(|queued| {
                    state.current = Some(InFlight {
                        id: queued.id,
                        output: String::new(),
                        responder: queued.responder,
                    });
                    queued.text
                })
            }
        };

        if let Some(text) = to_send {
            tracing::debug!(command = %text, "REPL command dispatched");
            if let Err(e) = self.write_line(&text).await {
                tracing::warn!(error = %e, "failed to write REPL command");
                let mut state = self.state.lock().await;
                state.current = None;
            }
        }
    }

    async fn read_loop<R>(&self, reader: BufReader<R>)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.handle_output(&line).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "REPL output read failed");
                    break;
                }
            }
        }
        self.handle_process_gone().await;
    }

    /// Classify one line of combined stdout/stderr.
    ///
    /// State-change detection is pattern-based and position-independent;
    /// command/response correlation is prompt-position-based. The same
    /// line can feed both.
    async fn handle_output(&self, line: &str) {
        let mut completed = false;
        {
            let mut state = self.state.lock().await;

            if let Some(current) = &mut state.current {
                current.output.push_str(line);
                current.output.push('\n');
            }

            state.scan_buffer.push_str(line);
            state.scan_buffer.push('\n');
            if state.scan_buffer.len() > OUTPUT_BUFFER_CAP {
                let excess = state.scan_buffer.len() - OUTPUT_BUFFER_CAP;
                state.scan_buffer.drain(..excess);
            }

            if let Some(stopped) = self.parser.parse_stopped_event(&state.scan_buffer) {
                state.scan_buffer.clear();
                let _ = self.events_tx.send(Event::new(
                    "stopped",
                    Some(json!({
                        "reason": stopped.reason.as_dap(),
                        "threadId": stopped.thread_id,
                        "allThreadsStopped": true,
                        "description": format!(
                            "{}.{} line {}",
                            stopped.class_name, stopped.method_name, stopped.line
                        ),
                    })),
                ));
            } else if self.parser.is_vm_started(&state.scan_buffer) {
                state.scan_buffer.clear();
                if !state.ready {
                    state.ready = true;
                    self.ready_notify.notify_waiters();
                }
            } else if self.parser.is_terminated(&state.scan_buffer) {
                state.scan_buffer.clear();
                if !state.terminated {
                    state.terminated = true;
                    let _ = self.events_tx.send(Event::new("terminated", None));
                }
            }

            if self.parser.is_prompt(line) {
                if !state.ready {
                    state.ready = true;
                    self.ready_notify.notify_waiters();
                }
                if let Some(current) = state.current.take() {
                    let _ = current.responder.send(current.output);
                    completed = true;
                }
            }
        }

        let _ = self.events_tx.send(Event::new(
            "output",
            Some(json!({ "category": "stdout", "output": format!("{line}\n") })),
        ));

        if completed {
            self.pump_queue().await;
        }
    }

    async fn handle_process_gone(&self) {
        let mut state = self.state.lock().await;
        if !state.terminated {
            state.terminated = true;
            let _ = self.events_tx.send(Event::new("terminated", None));
        }
        // Nothing will ever answer; drop everything waiting.
        state.current = None;
        state.queue.clear();
    }

    /// Graceful quit, then signal, then forced kill.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut state = self.state.lock().await;
            state.terminated = true;
            state.current = None;
            state.queue.clear();
        }
        let _ = self.write_line("quit").await;

        let child = self.child.lock().await.take();
        if let Some(child) = child {
            terminate_child(child, grace).await;
        }
    }
}
