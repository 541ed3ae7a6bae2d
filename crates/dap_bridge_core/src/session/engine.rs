//! The session engine: one backend subprocess, one transport, one policy.
//!
//! All mutation of session state happens behind one async mutex; command
//! submission is safe from any task and serializes into that single path.
//! The handshake shape, queueing rules and child-session behavior all come
//! from the adapter policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, Notify};
use tokio::time::timeout;

use crate::client::DapClient;
use crate::config::{BindMode, ConnectMode, SessionConfig};
use crate::error::BridgeError;
use crate::policy::{
    AdapterPolicy, AdapterState, ChildSessionStrategy, PendingCommand, ReverseRequestDisposition,
    StackFrame,
};
use crate::protocol::{Event, Request, Response};
use crate::session::adoption::ChildSessionManager;
use crate::session::state::{SessionState, StateTracker, Transition};
use crate::session::{BreakpointSpec, DebugSession};
use crate::Result;

const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Phase-one wait for backends that may emit `initialized` on either side
/// of `launch`.
const BRIEF_INITIALIZED_WAIT: Duration = Duration::from_millis(500);

struct EngineInner {
    state: StateTracker,
    adapter_state: AdapterState,
    pending: Vec<PendingCommand>,
    waiters: HashMap<u64, oneshot::Sender<Result<Response>>>,
    /// Requested breakpoints grouped by file, in file insertion order. The
    /// per-file vector is replaced wholesale on update, never mutated.
    breakpoints: Vec<(String, Vec<BreakpointSpec>)>,
    current_thread_id: Option<u64>,
    closed: bool,
}

pub struct SessionEngine {
    id: String,
    policy: Arc<dyn AdapterPolicy>,
    config: SessionConfig,
    client: Arc<DapClient>,
    children: Option<Arc<ChildSessionManager>>,
    events_tx: broadcast::Sender<Event>,
    transitions_tx: broadcast::Sender<Transition>,
    initialized_notify: Arc<Notify>,
    next_request_id: AtomicU64,
    inner: Mutex<EngineInner>,
}

impl SessionEngine {
    /// Spawn the backend, wire the transport and run the policy-shaped
    /// handshake. Returns only once the session is usable (or failed
    /// fatally, in which case the backend has been torn down).
    pub async fn create(
        id: String,
        policy: Arc<dyn AdapterPolicy>,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        let client = match &config.connect {
            ConnectMode::Stdio => DapClient::spawn(&config.adapter).await?,
            ConnectMode::Tcp { host, port } => {
                DapClient::spawn_and_connect(&config.adapter, host, *port, config.timeouts.adapter_listen)
                    .await?
            }
        };

        let engine = Self::assemble(id, policy, config, Arc::new(client));
        engine.clone().spawn_pumps().await;

        if let Err(e) = engine.run_handshake().await {
            tracing::error!(session = %engine.id, error = %e, "handshake failed");
            engine.close().await;
            return Err(e);
        }
        Ok(engine)
    }

    /// Build an engine around an existing client without spawning or
    /// handshaking. Tests drive scripted backends through this.
    pub(crate) fn assemble(
        id: String,
        policy: Arc<dyn AdapterPolicy>,
        config: SessionConfig,
        client: Arc<DapClient>,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = StateTracker::new();
        let transitions_tx = state.sender();

        let children = match (&config.connect, policy.child_session_strategy()) {
            (ConnectMode::Tcp { host, port }, strategy) if strategy != ChildSessionStrategy::None => {
                Some(Arc::new(ChildSessionManager::new(
                    policy.clone(),
                    host.clone(),
                    *port,
                    config.timeouts.clone(),
                    events_tx.clone(),
                )))
            }
            _ => None,
        };

        let adapter_state = policy.create_initial_state();
        Arc::new(Self {
            id,
            policy,
            config,
            client,
            children,
            events_tx,
            transitions_tx,
            initialized_notify: Arc::new(Notify::new()),
            next_request_id: AtomicU64::new(1),
            inner: Mutex::new(EngineInner {
                state,
                adapter_state,
                pending: Vec::new(),
                waiters: HashMap::new(),
                breakpoints: Vec::new(),
                current_thread_id: None,
                closed: false,
            }),
        })
    }

    /// Start the event pump, the reverse-request loop and the close
    /// monitor.
    pub(crate) async fn spawn_pumps(self: Arc<Self>) {
        let engine = self.clone();
        let mut events = self.client.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => engine.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(session = %engine.id, skipped, "event pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(reverse) = self.client.take_reverse_requests().await {
            let engine = self.clone();
            tokio::spawn(engine.run_reverse_requests(reverse));
        }

        let engine = self.clone();
        tokio::spawn(async move {
            engine.client.closed().await;
            engine.on_connection_closed().await;
        });
    }

    pub fn client(&self) -> &Arc<DapClient> {
        &self.client
    }

    pub async fn current_thread_id(&self) -> Option<u64> {
        self.inner.lock().await.current_thread_id
    }

    pub async fn transition_history(&self) -> Vec<Transition> {
        self.inner.lock().await.state.history().to_vec()
    }

    // ---- handshake -------------------------------------------------------

    async fn run_handshake(&self) -> Result<()> {
        let behavior = self.policy.initialization_behavior();
        let timeouts = self.config.timeouts.clone();

        {
            let mut inner = self.inner.lock().await;
            inner
                .state
                .transition(SessionState::Initializing, "initialize sent", &*self.policy)?;
        }

        let init_args = self.initialize_arguments(&behavior);
        {
            let mut inner = self.inner.lock().await;
            self.dispatch_now(&mut inner, "initialize", Some(init_args), timeouts.initialize)
                .await?;
            inner
                .state
                .transition(SessionState::Ready, "initialize response received", &*self.policy)?;
        }

        let bind = self.config.launch.bind;
        let bind_args = self.bind_arguments(&behavior);

        if behavior.send_attach_before_initialized {
            // The backend only emits `initialized` after it has processed
            // the bind request; waiting first would deadlock.
            let (seq, rx) = {
                let mut inner = self.inner.lock().await;
                self.policy.update_state_on_command(
                    bind.dap_command(),
                    Some(&bind_args),
                    &mut inner.adapter_state,
                );
                self.client
                    .send_request_begin(bind.dap_command(), Some(bind_args.clone()))
                    .await?
            };

            if !self.wait_for_initialized(timeouts.initialized_event).await {
                tracing::warn!(session = %self.id, "no initialized event before configuration, continuing");
            }

            self.replay_breakpoints().await;
            self.send_optional("setExceptionBreakpoints", json!({ "filters": [] }))
                .await;
            if !behavior.defer_config_done {
                self.send_configuration_done().await;
            }

            let response = self
                .client
                .await_response(bind.dap_command(), seq, rx, timeouts.launch)
                .await;
            self.finish_bind(bind, response).await?;
        } else if behavior.send_launch_before_config {
            // Phase 1: the backend may emit `initialized` right after
            // `initialize`. Wait briefly, then send the bind request and
            // fall back to a post-bind wait.
            let early = self.wait_for_initialized(BRIEF_INITIALIZED_WAIT).await;

            {
                let mut inner = self.inner.lock().await;
                self.dispatch_now(&mut inner, bind.dap_command(), Some(bind_args), timeouts.launch)
                    .await?;
            }

            if !early && !self.wait_for_initialized(timeouts.initialized_event).await {
                tracing::warn!(session = %self.id, "no initialized event after bind, continuing");
            }

            self.replay_breakpoints().await;
            self.send_optional("setExceptionBreakpoints", json!({ "filters": [] }))
                .await;
            if !behavior.defer_config_done {
                self.send_configuration_done().await;
            }
        } else {
            if !self.wait_for_initialized(timeouts.initialized_event).await {
                tracing::warn!(session = %self.id, "no initialized event, continuing handshake");
            }

            let (seq, rx) = {
                let mut inner = self.inner.lock().await;
                self.policy.update_state_on_command(
                    bind.dap_command(),
                    Some(&bind_args),
                    &mut inner.adapter_state,
                );
                self.client
                    .send_request_begin(bind.dap_command(), Some(bind_args.clone()))
                    .await?
            };

            self.replay_breakpoints().await;
            self.send_optional("setExceptionBreakpoints", json!({ "filters": [] }))
                .await;
            if !behavior.defer_config_done {
                self.send_configuration_done().await;
            }

            let response = self
                .client
                .await_response(bind.dap_command(), seq, rx, timeouts.launch)
                .await;
            self.finish_bind(bind, response).await?;
        }

        let mut inner = self.inner.lock().await;
        if self.policy.is_connected(&inner.adapter_state)
            && inner.state.current() == SessionState::Ready
        {
            inner
                .state
                .transition(SessionState::Connected, "handshake complete", &*self.policy)?;
        }
        self.flush_pending(&mut inner).await;
        Ok(())
    }

    fn initialize_arguments(&self, behavior: &crate::policy::InitializationBehavior) -> Value {
        let mut args = json!({
            "clientID": "dap-bridge",
            "clientName": "dap-bridge",
            "adapterID": self.policy.name(),
            "locale": "en-US",
            "pathFormat": "path",
            "linesStartAt1": true,
            "columnsStartAt1": true,
            "supportsVariableType": true,
            "supportsVariablePaging": true,
            "supportsRunInTerminalRequest": false,
        });
        if let Some(Value::Object(extra)) = &behavior.extra_capabilities {
            let merged = args.as_object_mut().expect("initialize args are an object");
            for (key, value) in extra {
                merged.insert(key.clone(), value.clone());
            }
        }
        args
    }

    fn bind_arguments(&self, behavior: &crate::policy::InitializationBehavior) -> Value {
        let mut args = self.config.launch.configuration.clone();
        if !args.is_object() {
            args = Value::Object(Map::new());
        }
        let object = args.as_object_mut().expect("bind args are an object");
        if !object.contains_key("stopOnEntry") {
            let stop_on_entry = self
                .config
                .launch
                .stop_on_entry
                .unwrap_or(behavior.default_stop_on_entry);
            object.insert("stopOnEntry".to_string(), stop_on_entry.into());
        }
        args
    }

    async fn finish_bind(&self, bind: BindMode, response: Result<Response>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match response {
            Ok(response) => {
                self.policy.update_state_on_response(
                    bind.dap_command(),
                    response.success,
                    &mut inner.adapter_state,
                );
                Ok(())
            }
            Err(e) => Err(self.add_hint(bind.dap_command(), e)),
        }
    }

    /// Bounded wait for the `initialized` event, satisfied immediately if
    /// it already arrived.
    async fn wait_for_initialized(&self, wait: Duration) -> bool {
        if self.inner.lock().await.adapter_state.initialized {
            return true;
        }
        let notified = self.initialized_notify.notified();
        let _ = timeout(wait, notified).await;
        self.inner.lock().await.adapter_state.initialized
    }

    /// One `setBreakpoints` per source file, file order preserved.
    async fn replay_breakpoints(&self) {
        let grouped = {
            let inner = self.inner.lock().await;
            inner.breakpoints.clone()
        };
        for (path, specs) in grouped {
            let breakpoints: Vec<Value> = specs.iter().map(BreakpointSpec::to_dap).collect();
            let args = json!({
                "source": { "path": path },
                "breakpoints": breakpoints,
            });
            self.send_optional("setBreakpoints", args).await;
        }
    }

    /// Optional handshake step: a rejection is logged, never fatal.
    async fn send_optional(&self, command: &str, args: Value) {
        let result = {
            let mut inner = self.inner.lock().await;
            self.dispatch_now(&mut inner, command, Some(args), self.config.timeouts.request)
                .await
        };
        if let Err(e) = result {
            tracing::warn!(session = %self.id, command, error = %e, "optional handshake step failed");
        }
    }

    async fn send_configuration_done(&self) {
        let result = {
            let mut inner = self.inner.lock().await;
            if inner.adapter_state.configuration_done {
                return;
            }
            self.dispatch_now(
                &mut inner,
                "configurationDone",
                Some(json!({})),
                self.config.timeouts.configuration_done,
            )
            .await
        };
        if let Err(e) = result {
            tracing::warn!(session = %self.id, error = %e, "configurationDone rejected");
        }
    }

    // ---- command submission ---------------------------------------------

    async fn submit(&self, command: &str, arguments: Option<Value>) -> Result<Response> {
        let (arguments, include_internals, include_special) = strip_filter_flags(arguments);
        let arguments = self.apply_disconnect_safety(command, arguments);

        // Execution-state commands go to the adopted child, transparently
        // to the caller.
        if let Some(children) = &self.children {
            if self.policy.client_behavior().routes_to_child(command) {
                if let Some(child) = children.active_child().await {
                    tracing::debug!(session = %self.id, command, "routing command to child session");
                    let response = child
                        .send_request(command, arguments, self.config.timeouts.request)
                        .await
                        .map_err(|e| self.add_hint(command, e))?;
                    return Ok(self.filter_response(command, response, include_internals, include_special));
                }
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(BridgeError::SessionClosed);
        }

        if command == "setBreakpoints" {
            record_breakpoints(&mut inner.breakpoints, arguments.as_ref());
        }

        let handling = self.policy.should_queue_command(command, &inner.adapter_state);

        if handling.defer {
            // Composite send: prerequisite first, then the command. One
            // logical submission; success requires both.
            tracing::debug!(session = %self.id, command, reason = handling.reason, "deferred prerequisite");
            if !inner.adapter_state.configuration_done {
                self.dispatch_now(
                    &mut inner,
                    "configurationDone",
                    Some(json!({})),
                    self.config.timeouts.configuration_done,
                )
                .await?;
            }
            let response = self
                .dispatch_now(&mut inner, command, arguments, self.timeout_for(command))
                .await?;
            return Ok(self.filter_response(command, response, include_internals, include_special));
        }

        if handling.queue {
            tracing::debug!(session = %self.id, command, reason = handling.reason, "queueing command");
            let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            inner.pending.push(PendingCommand {
                request_id,
                command: command.to_string(),
                arguments,
            });
            inner.waiters.insert(request_id, tx);
            drop(inner);

            let response = match timeout(self.config.timeouts.request, rx).await {
                Ok(Ok(result)) => result?,
                Ok(Err(_)) => return Err(BridgeError::SessionClosed),
                Err(_) => {
                    let mut inner = self.inner.lock().await;
                    inner.pending.retain(|pending| pending.request_id != request_id);
                    inner.waiters.remove(&request_id);
                    return Err(BridgeError::timeout(
                        format!("queued command '{command}'"),
                        self.config.timeouts.request,
                    ));
                }
            };
            return Ok(self.filter_response(command, response, include_internals, include_special));
        }

        let response = self
            .dispatch_now(&mut inner, command, arguments, self.timeout_for(command))
            .await;
        self.flush_pending(&mut inner).await;
        drop(inner);

        let response = response?;
        Ok(self.filter_response(command, response, include_internals, include_special))
    }

    /// Send on the wire while holding the session's mutation lock, keeping
    /// the policy's state bookkeeping in step with traffic.
    async fn dispatch_now(
        &self,
        inner: &mut EngineInner,
        command: &str,
        arguments: Option<Value>,
        wait: Duration,
    ) -> Result<Response> {
        self.policy
            .update_state_on_command(command, arguments.as_ref(), &mut inner.adapter_state);
        let result = self.client.send_request(command, arguments, wait).await;
        match &result {
            Ok(response) => {
                self.policy.update_state_on_response(
                    command,
                    response.success,
                    &mut inner.adapter_state,
                );
            }
            Err(BridgeError::CommandFailed { .. }) => {
                self.policy
                    .update_state_on_response(command, false, &mut inner.adapter_state);
            }
            Err(_) => {}
        }
        result.map_err(|e| self.add_hint(command, e))
    }

    /// Drain the pending queue in policy order. The order is recomputed on
    /// every flush; FIFO within a category is preserved by the policy. The
    /// first still-gated command stops the drain.
    async fn flush_pending(&self, inner: &mut EngineInner) {
        if inner.pending.is_empty() {
            return;
        }
        let queue = std::mem::take(&mut inner.pending);
        let mut ordered = self.policy.process_queued_commands(queue);

        while let Some(next) = ordered.first() {
            let handling = self.policy.should_queue_command(&next.command, &inner.adapter_state);
            if handling.queue {
                break;
            }
            let pending = ordered.remove(0);
            tracing::debug!(session = %self.id, command = %pending.command, "flushing queued command");

            if handling.defer && !inner.adapter_state.configuration_done {
                if let Err(e) = self
                    .dispatch_now(
                        inner,
                        "configurationDone",
                        Some(json!({})),
                        self.config.timeouts.configuration_done,
                    )
                    .await
                {
                    tracing::warn!(session = %self.id, error = %e, "deferred configurationDone failed during flush");
                }
            }

            let result = self
                .dispatch_now(
                    inner,
                    &pending.command,
                    pending.arguments.clone(),
                    self.timeout_for(&pending.command),
                )
                .await;
            if let Some(waiter) = inner.waiters.remove(&pending.request_id) {
                let _ = waiter.send(result);
            }
        }

        inner.pending = ordered;
    }

    fn timeout_for(&self, command: &str) -> Duration {
        let timeouts = &self.config.timeouts;
        match command {
            "initialize" => timeouts.initialize,
            "launch" | "attach" => timeouts.launch,
            "configurationDone" => timeouts.configuration_done,
            _ => timeouts.request,
        }
    }

    /// Safety invariant: a policy may pin `terminateDebuggee` regardless of
    /// what the caller asked for (attach-mode backends that must never kill
    /// the debuggee).
    fn apply_disconnect_safety(&self, command: &str, arguments: Option<Value>) -> Option<Value> {
        if command != "disconnect" {
            return arguments;
        }
        let attach_mode = self.config.launch.bind == BindMode::Attach;
        let Some(forced) = self.policy.force_terminate_debuggee(attach_mode) else {
            return arguments;
        };

        let mut args = match arguments {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if args.get("terminateDebuggee").and_then(Value::as_bool) != Some(forced) {
            tracing::info!(session = %self.id, forced, "forcing terminateDebuggee on disconnect");
        }
        args.insert("terminateDebuggee".to_string(), forced.into());
        Some(Value::Object(args))
    }

    fn add_hint(&self, command: &str, error: BridgeError) -> BridgeError {
        if let BridgeError::CommandFailed { message, .. } = &error {
            if let Some(hint) = self.policy.translate_error(command, message) {
                return error.with_hint(hint);
            }
        }
        error
    }

    /// Apply policy frame/variable conventions to responses that carry
    /// them.
    fn filter_response(
        &self,
        command: &str,
        mut response: Response,
        include_internals: bool,
        include_special: bool,
    ) -> Response {
        match command {
            "stackTrace" => {
                let Some(body) = response.body.as_mut().and_then(Value::as_object_mut) else {
                    return response;
                };
                let Some(frames) = body.get("stackFrames").and_then(Value::as_array) else {
                    return response;
                };
                let parsed: Vec<StackFrame> =
                    frames.iter().filter_map(StackFrame::from_body).collect();
                if parsed.len() != frames.len() {
                    // Frames we cannot parse pass through untouched.
                    return response;
                }
                let kept = self.policy.filter_stack_frames(parsed, include_internals);
                let kept_ids: Vec<u64> = kept.iter().map(|frame| frame.id).collect();
                let filtered: Vec<Value> = frames
                    .iter()
                    .filter(|frame| {
                        frame
                            .get("id")
                            .and_then(Value::as_u64)
                            .is_some_and(|id| kept_ids.contains(&id))
                    })
                    .cloned()
                    .collect();
                body.insert("totalFrames".to_string(), filtered.len().into());
                body.insert("stackFrames".to_string(), Value::Array(filtered));
            }
            "variables" => {
                let Some(body) = response.body.as_mut().and_then(Value::as_object_mut) else {
                    return response;
                };
                let Some(variables) = body.get("variables").and_then(Value::as_array) else {
                    return response;
                };
                let filtered: Vec<Value> = variables
                    .iter()
                    .filter(|variable| {
                        variable
                            .get("name")
                            .and_then(Value::as_str)
                            .map(|name| self.policy.keep_variable(name, include_special))
                            .unwrap_or(true)
                    })
                    .cloned()
                    .collect();
                body.insert("variables".to_string(), Value::Array(filtered));
            }
            _ => {}
        }
        response
    }

    // ---- inbound traffic -------------------------------------------------

    async fn handle_event(&self, event: Event) {
        {
            let mut inner = self.inner.lock().await;
            self.policy.update_state_on_event(
                &event.event,
                event.body.as_ref(),
                &mut inner.adapter_state,
            );

            let edge = match event.event.as_str() {
                "initialized" => {
                    self.initialized_notify.notify_waiters();
                    if inner.state.current() == SessionState::Ready {
                        Some((SessionState::Connected, "initialized event"))
                    } else {
                        None
                    }
                }
                "stopped" => {
                    if let Some(thread_id) = event.thread_id() {
                        inner.current_thread_id = Some(thread_id);
                    }
                    Some((SessionState::Debugging, "stopped event"))
                }
                "continued" => {
                    if inner.state.current() == SessionState::Debugging {
                        Some((SessionState::Connected, "continued event"))
                    } else {
                        None
                    }
                }
                "terminated" | "exited" => {
                    let hosting_children = match &self.children {
                        Some(children) => children.has_children().await,
                        None => false,
                    };
                    if hosting_children {
                        // The parent keeps serving child sessions.
                        Some((SessionState::Connected, "debuggee terminated, children active"))
                    } else {
                        Some((SessionState::Disconnected, "debuggee terminated"))
                    }
                }
                _ => None,
            };

            if let Some((to, cause)) = edge {
                if let Err(e) = inner.state.transition(to, cause, &*self.policy) {
                    // A strict policy makes this a fatal protocol error.
                    tracing::error!(session = %self.id, error = %e, "fatal protocol error");
                    inner.state.force(SessionState::Error, e.to_string());
                }
            }

            self.flush_pending(&mut inner).await;
        }

        let _ = self.events_tx.send(normalize_event(event));
    }

    async fn run_reverse_requests(self: Arc<Self>, mut reverse: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = reverse.recv().await {
            match self.policy.reverse_request_disposition(&request) {
                ReverseRequestDisposition::Acknowledge => {
                    let _ = self.client.send_response(&request, true, Value::Null).await;
                }
                ReverseRequestDisposition::StartChild { pending_id } => {
                    // The backend blocks on this answer; acknowledge before
                    // running the adoption protocol.
                    let _ = self.client.send_response(&request, true, Value::Null).await;
                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.adopt_child(pending_id).await;
                    });
                }
                ReverseRequestDisposition::Unhandled => {
                    // Second tier: a generic acknowledgement, because an
                    // unanswered reverse request hangs the backend.
                    tracing::warn!(
                        session = %self.id,
                        command = %request.command,
                        "policy declined reverse request, sending generic acknowledgement"
                    );
                    let _ = self.client.send_response(&request, true, Value::Null).await;
                }
            }
        }
    }

    async fn adopt_child(&self, pending_id: String) {
        let Some(children) = &self.children else {
            tracing::error!(session = %self.id, %pending_id, "startDebugging received but policy has no child strategy");
            return;
        };

        let breakpoints = self.inner.lock().await.breakpoints.clone();
        let parent_config = self.config.launch.configuration.clone();

        match children.adopt(&pending_id, &parent_config, &breakpoints).await {
            Ok(Some(_child)) => {
                // A deferred parent configurationDone is released once the
                // child is bound.
                if self.policy.initialization_behavior().defer_config_done {
                    self.send_configuration_done().await;
                }
                let mut inner = self.inner.lock().await;
                self.flush_pending(&mut inner).await;
            }
            Ok(None) => {}
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner
                    .state
                    .force(SessionState::Error, format!("child adoption failed: {e}"));
            }
        }
    }

    async fn on_connection_closed(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        tracing::warn!(session = %self.id, "backend connection closed");
        inner.state.force(SessionState::Disconnected, "backend process exited");
        fail_waiters(&mut inner);
        drop(inner);

        // Controllers see a terminated event even when the backend died
        // without sending one.
        let _ = self.events_tx.send(Event::new("terminated", None));
    }

    async fn shutdown_session(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            fail_waiters(&mut inner);
            inner.state.force(SessionState::Uninitialized, "session disposed");
        }

        if let Some(children) = &self.children {
            children.shutdown(self.config.timeouts.graceful_exit).await;
        }
        self.client.shutdown(self.config.timeouts.graceful_exit).await;
    }
}

#[async_trait]
impl DebugSession for SessionEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    async fn state(&self) -> SessionState {
        self.inner.lock().await.state.current()
    }

    async fn submit_command(&self, command: &str, arguments: Option<Value>) -> Result<Response> {
        self.submit(command, arguments).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    fn subscribe_transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions_tx.subscribe()
    }

    async fn close(&self) {
        self.shutdown_session().await;
    }
}

/// Drop the queue and reject every waiter; used on close and backend death.
fn fail_waiters(inner: &mut EngineInner) {
    inner.pending.clear();
    for (_, waiter) in inner.waiters.drain() {
        let _ = waiter.send(Err(BridgeError::SessionClosed));
    }
}

/// Record a `setBreakpoints` submission into the per-file map, replacing
/// (never mutating) the file's entry.
fn record_breakpoints(breakpoints: &mut Vec<(String, Vec<BreakpointSpec>)>, arguments: Option<&Value>) {
    let Some(arguments) = arguments else { return };
    let Some(path) = arguments
        .get("source")
        .and_then(|source| source.get("path"))
        .and_then(Value::as_str)
    else {
        return;
    };

    let specs: Vec<BreakpointSpec> = arguments
        .get("breakpoints")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|breakpoint| {
                    Some(BreakpointSpec {
                        path: path.to_string(),
                        line: breakpoint.get("line")?.as_u64()?,
                        condition: breakpoint
                            .get("condition")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    if let Some(entry) = breakpoints.iter_mut().find(|(file, _)| file == path) {
        entry.1 = specs;
    } else {
        breakpoints.push((path.to_string(), specs));
    }
}

/// Pop the engine-level filter flags off the caller's arguments before they
/// reach the wire.
fn strip_filter_flags(arguments: Option<Value>) -> (Option<Value>, bool, bool) {
    match arguments {
        Some(Value::Object(mut map)) => {
            let include_internals = map
                .remove("includeInternals")
                .and_then(|value| value.as_bool())
                .unwrap_or(false);
            let include_special = map
                .remove("includeSpecial")
                .and_then(|value| value.as_bool())
                .unwrap_or(false);
            (Some(Value::Object(map)), include_internals, include_special)
        }
        other => (other, false, false),
    }
}

/// Minimal event normalization: output events without a category default to
/// the console stream.
fn normalize_event(mut event: Event) -> Event {
    if event.event == "output" {
        if let Some(body) = event.body.as_mut().and_then(Value::as_object_mut) {
            body.entry("category".to_string())
                .or_insert_with(|| "console".into());
        }
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdapterCommand, LaunchSpec, SessionTimeouts};
    use crate::policy::{CommandHandling, DotnetPolicy, MockPolicy};
    use crate::protocol::{encode_frame, DecodedFrame, FrameDecoder, ProtocolMessage};
    use std::collections::VecDeque;
    use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::net::TcpListener;

    /// Scripted backend over any byte stream: reads the engine's requests,
    /// answers them and emits events on cue.
    struct Backend<R, W> {
        reader: R,
        writer: W,
        decoder: FrameDecoder,
        inbox: VecDeque<ProtocolMessage>,
        next_seq: u64,
    }

    impl<R, W> Backend<R, W>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        fn new(reader: R, writer: W) -> Self {
            Self {
                reader,
                writer,
                decoder: FrameDecoder::new(),
                inbox: VecDeque::new(),
                next_seq: 0,
            }
        }

        async fn next_request(&mut self) -> Request {
            loop {
                if let Some(ProtocolMessage::Request(request)) = self.inbox.pop_front() {
                    return request;
                }
                self.read_more().await;
            }
        }

        async fn next_response(&mut self) -> Response {
            loop {
                if let Some(message) = self.inbox.pop_front() {
                    if let ProtocolMessage::Response(response) = message {
                        return response;
                    }
                    continue;
                }
                self.read_more().await;
            }
        }

        async fn read_more(&mut self) {
            let mut chunk = vec![0u8; 4096];
            let n = self.reader.read(&mut chunk).await.expect("backend read");
            assert!(n > 0, "engine closed the connection mid-script");
            for frame in self.decoder.feed(&chunk[..n]) {
                if let DecodedFrame::Message(message) = frame {
                    self.inbox.push_back(message);
                }
            }
        }

        async fn write(&mut self, message: &ProtocolMessage) {
            let frame = encode_frame(message).expect("encode");
            self.writer.write_all(&frame).await.expect("backend write");
        }

        async fn respond(&mut self, request: &Request, body: Value) {
            self.next_seq += 1;
            self.write(&ProtocolMessage::Response(Response {
                seq: self.next_seq,
                request_seq: request.seq,
                command: request.command.clone(),
                success: true,
                message: None,
                body: if body.is_null() { None } else { Some(body) },
            }))
            .await;
        }

        async fn emit(&mut self, event: &str, body: Option<Value>) {
            self.next_seq += 1;
            self.write(&ProtocolMessage::Event(Event {
                seq: self.next_seq,
                event: event.to_string(),
                body,
            }))
            .await;
        }

        async fn send_reverse_request(&mut self, command: &str, arguments: Value) -> u64 {
            self.next_seq += 1;
            let seq = self.next_seq;
            self.write(&ProtocolMessage::Request(Request {
                seq,
                command: command.to_string(),
                arguments: Some(arguments),
            }))
            .await;
            seq
        }
    }

    type PipeBackend = Backend<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn short_timeouts() -> SessionTimeouts {
        SessionTimeouts {
            initialize: Duration::from_secs(2),
            launch: Duration::from_secs(2),
            configuration_done: Duration::from_secs(2),
            initialized_event: Duration::from_secs(2),
            request: Duration::from_secs(2),
            ..SessionTimeouts::default()
        }
    }

    fn test_config(bind: BindMode, connect: ConnectMode) -> SessionConfig {
        let launch = match bind {
            BindMode::Launch => LaunchSpec::launch(json!({ "program": "app" })),
            BindMode::Attach => LaunchSpec::attach(json!({ "pid": 1234 })),
        };
        SessionConfig {
            adapter: AdapterCommand::new("unused", vec![]),
            connect,
            launch,
            initial_breakpoints: Vec::new(),
            timeouts: short_timeouts(),
        }
    }

    async fn pipe_engine(
        policy: Arc<dyn AdapterPolicy>,
        config: SessionConfig,
    ) -> (Arc<SessionEngine>, PipeBackend) {
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = split(ours);
        let (their_read, their_write) = split(theirs);
        let client = Arc::new(DapClient::from_io(
            Box::new(our_write),
            Box::new(our_read),
            None,
        ));
        let engine = SessionEngine::assemble("test-session".to_string(), policy, config, client);
        engine.clone().spawn_pumps().await;
        (engine, Backend::new(their_read, their_write))
    }

    #[tokio::test]
    async fn test_standard_handshake_reaches_connected() {
        let (engine, mut backend) =
            pipe_engine(Arc::new(MockPolicy), test_config(BindMode::Launch, ConnectMode::Stdio)).await;

        let handshake = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_handshake().await })
        };

        let initialize = backend.next_request().await;
        assert_eq!(initialize.command, "initialize");
        assert_eq!(initialize.arguments.as_ref().unwrap()["adapterID"], "mock");
        backend.respond(&initialize, json!({})).await;
        backend.emit("initialized", None).await;

        let launch = backend.next_request().await;
        assert_eq!(launch.command, "launch");
        assert_eq!(launch.arguments.as_ref().unwrap()["stopOnEntry"], false);
        backend.respond(&launch, Value::Null).await;

        let exception_bps = backend.next_request().await;
        assert_eq!(exception_bps.command, "setExceptionBreakpoints");
        backend.respond(&exception_bps, Value::Null).await;

        let config_done = backend.next_request().await;
        assert_eq!(config_done.command, "configurationDone");
        backend.respond(&config_done, Value::Null).await;

        handshake.await.expect("join").expect("handshake succeeds");
        assert_eq!(engine.state().await, SessionState::Connected);

        let history = engine.transition_history().await;
        let edges: Vec<(SessionState, SessionState)> = history
            .iter()
            .map(|transition| (transition.previous, transition.next))
            .collect();
        assert!(edges.contains(&(SessionState::Uninitialized, SessionState::Initializing)));
        assert!(edges.contains(&(SessionState::Initializing, SessionState::Ready)));
        assert!(edges.contains(&(SessionState::Ready, SessionState::Connected)));

        engine.close().await;
    }

    #[tokio::test]
    async fn test_reversed_handshake_sends_attach_before_initialized() {
        let (engine, mut backend) = pipe_engine(
            Arc::new(DotnetPolicy),
            test_config(BindMode::Attach, ConnectMode::Stdio),
        )
        .await;

        let handshake = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_handshake().await })
        };

        let initialize = backend.next_request().await;
        backend.respond(&initialize, json!({})).await;

        // The attach request must arrive without any initialized event
        // having been emitted.
        let attach = backend.next_request().await;
        assert_eq!(attach.command, "attach");
        assert_eq!(attach.arguments.as_ref().unwrap()["pid"], 1234);

        // vsdbg sequence: initialized only comes after attach processing.
        backend.emit("initialized", None).await;

        let exception_bps = backend.next_request().await;
        assert_eq!(exception_bps.command, "setExceptionBreakpoints");
        backend.respond(&exception_bps, Value::Null).await;

        let config_done = backend.next_request().await;
        assert_eq!(config_done.command, "configurationDone");
        backend.respond(&config_done, Value::Null).await;

        backend.respond(&attach, Value::Null).await;

        handshake.await.expect("join").expect("reversed handshake succeeds");
        assert_eq!(engine.state().await, SessionState::Connected);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_disconnect_forces_terminate_debuggee_false_for_attach_sessions() {
        let (engine, mut backend) = pipe_engine(
            Arc::new(DotnetPolicy),
            test_config(BindMode::Attach, ConnectMode::Stdio),
        )
        .await;

        let submit = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .submit_command("disconnect", Some(json!({ "terminateDebuggee": true })))
                    .await
            })
        };

        let disconnect = backend.next_request().await;
        assert_eq!(disconnect.command, "disconnect");
        assert_eq!(
            disconnect.arguments.as_ref().unwrap()["terminateDebuggee"],
            false,
            "caller-requested termination must be overridden"
        );
        backend.respond(&disconnect, Value::Null).await;

        submit.await.expect("join").expect("disconnect succeeds");
        engine.close().await;
    }

    /// Queues everything until `initialized`, then flushes in the fixed
    /// category order.
    struct GatedPolicy;

    impl AdapterPolicy for GatedPolicy {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn matches_adapter(&self, _command: &str, _args: &[String]) -> bool {
            false
        }

        fn should_queue_command(&self, command: &str, state: &AdapterState) -> CommandHandling {
            if command == "initialize" || state.initialized {
                CommandHandling::send("gate cleared")
            } else {
                CommandHandling::queue("waiting for initialized event")
            }
        }

        fn process_queued_commands(&self, mut queue: Vec<PendingCommand>) -> Vec<PendingCommand> {
            fn category(command: &str) -> u8 {
                match command {
                    "setBreakpoints" | "setExceptionBreakpoints" => 0,
                    "configurationDone" => 1,
                    "launch" | "attach" => 2,
                    _ => 3,
                }
            }
            queue.sort_by_key(|pending| category(&pending.command));
            queue
        }
    }

    #[tokio::test]
    async fn test_queued_commands_flush_in_category_order() {
        let (engine, mut backend) = pipe_engine(
            Arc::new(GatedPolicy),
            test_config(BindMode::Launch, ConnectMode::Stdio),
        )
        .await;

        // Submit in deliberately wrong order; wait until each lands in the
        // queue so FIFO-within-category is deterministic.
        let mut submissions = Vec::new();
        for (command, args) in [
            ("evaluate", Some(json!({ "expression": "x" }))),
            ("launch", Some(json!({ "program": "app" }))),
            (
                "setBreakpoints",
                Some(json!({ "source": { "path": "a.py" }, "breakpoints": [{ "line": 3 }] })),
            ),
            ("configurationDone", Some(json!({}))),
        ] {
            let task_engine = engine.clone();
            let expected_len = submissions.len() + 1;
            submissions.push(tokio::spawn(async move {
                task_engine.submit_command(command, args).await
            }));
            while engine.inner.lock().await.pending.len() < expected_len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        // Clearing the gate flushes the whole queue atomically, in category
        // order with FIFO preserved inside categories.
        backend.emit("initialized", None).await;

        let mut received = Vec::new();
        for _ in 0..4 {
            let request = backend.next_request().await;
            received.push(request.command.clone());
            backend.respond(&request, Value::Null).await;
        }
        assert_eq!(
            received,
            vec!["setBreakpoints", "configurationDone", "launch", "evaluate"]
        );

        for submission in submissions {
            submission.await.expect("join").expect("queued command resolves");
        }
        engine.close().await;
    }

    #[tokio::test]
    async fn test_backend_death_synthesizes_terminated_and_disconnects() {
        let (engine, backend) = pipe_engine(
            Arc::new(MockPolicy),
            test_config(BindMode::Launch, ConnectMode::Stdio),
        )
        .await;
        let mut events = engine.subscribe_events();

        drop(backend);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event before timeout")
            .expect("channel open");
        assert_eq!(event.event, "terminated");
        assert_eq!(engine.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stopped_event_records_thread_and_enters_debugging() {
        let (engine, mut backend) = pipe_engine(
            Arc::new(MockPolicy),
            test_config(BindMode::Launch, ConnectMode::Stdio),
        )
        .await;
        let mut events = engine.subscribe_events();

        backend
            .emit("stopped", Some(json!({ "reason": "breakpoint", "threadId": 7 })))
            .await;

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event before timeout")
            .expect("channel open");
        assert_eq!(event.event, "stopped");
        assert_eq!(engine.state().await, SessionState::Debugging);
        assert_eq!(engine.current_thread_id().await, Some(7));
        engine.close().await;
    }

    #[tokio::test]
    async fn test_adoption_is_idempotent_and_routes_execution_commands_to_child() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let config = SessionConfig {
            launch: LaunchSpec::launch(json!({ "type": "pwa-node", "program": "app.js" })),
            ..test_config(
                BindMode::Launch,
                ConnectMode::Tcp {
                    host: "127.0.0.1".to_string(),
                    port,
                },
            )
        };
        let (engine, mut parent) = pipe_engine(Arc::new(crate::policy::JsDebugPolicy), config).await;

        // Child backend: accept the adoption connection and run the generic
        // child handshake script.
        let child_script = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("child connection");
            let (read, write) = socket.into_split();
            let mut child = Backend::new(read, write);

            let initialize = child.next_request().await;
            assert_eq!(initialize.command, "initialize");
            child.respond(&initialize, json!({})).await;
            child.emit("initialized", None).await;

            let exception_bps = child.next_request().await;
            assert_eq!(exception_bps.command, "setExceptionBreakpoints");
            child.respond(&exception_bps, Value::Null).await;

            let config_done = child.next_request().await;
            assert_eq!(config_done.command, "configurationDone");
            child.respond(&config_done, Value::Null).await;

            let attach = child.next_request().await;
            assert_eq!(attach.command, "attach");
            assert_eq!(attach.arguments.as_ref().unwrap()["__pendingTargetId"], "target-1");
            child.respond(&attach, Value::Null).await;

            // Post-attach: a second initialized triggers re-configuration,
            // then the debuggee stops.
            child.emit("initialized", None).await;
            let post_exception = child.next_request().await;
            assert_eq!(post_exception.command, "setExceptionBreakpoints");
            child.respond(&post_exception, Value::Null).await;
            child.emit("stopped", Some(json!({ "reason": "entry", "threadId": 1 }))).await;

            // Routed command arrives on the child connection.
            let stack_trace = child.next_request().await;
            assert_eq!(stack_trace.command, "stackTrace");
            child
                .respond(
                    &stack_trace,
                    json!({ "stackFrames": [
                        { "id": 1, "name": "handler", "line": 3,
                          "source": { "path": "/workspace/app.js" } }
                    ] }),
                )
                .await;
        });

        // Reverse startDebugging from the parent backend.
        let reverse_seq = parent
            .send_reverse_request(
                "startDebugging",
                json!({ "configuration": { "__pendingTargetId": "target-1", "type": "pwa-node" } }),
            )
            .await;

        // The backend blocks on the acknowledgement; it must come first.
        let ack = parent.next_response().await;
        assert_eq!(ack.request_seq, reverse_seq);
        assert!(ack.success);

        // After adoption, the deferred parent configurationDone is
        // released.
        let parent_config_done = parent.next_request().await;
        assert_eq!(parent_config_done.command, "configurationDone");
        parent.respond(&parent_config_done, Value::Null).await;

        // Wait until the child is active.
        let children = engine.children.as_ref().expect("js engine has a child manager");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while children.active_child().await.is_none() {
            assert!(tokio::time::Instant::now() < deadline, "adoption never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Duplicate adoption for the same target is ignored.
        let duplicate_seq = parent
            .send_reverse_request(
                "startDebugging",
                json!({ "configuration": { "__pendingTargetId": "target-1" } }),
            )
            .await;
        let duplicate_ack = parent.next_response().await;
        assert_eq!(duplicate_ack.request_seq, duplicate_seq);
        assert!(children.is_adopted("target-1").await);

        // A stackTrace submitted against the parent session id is answered
        // over the child's transport.
        let response = engine
            .submit_command("stackTrace", Some(json!({ "threadId": 1 })))
            .await
            .expect("routed stackTrace succeeds");
        assert_eq!(
            response.body.unwrap()["stackFrames"][0]["source"]["path"],
            "/workspace/app.js"
        );

        child_script.await.expect("child script completes");
        engine.close().await;
    }

    #[test]
    fn test_record_breakpoints_replaces_per_file_and_keeps_file_order() {
        let mut breakpoints = Vec::new();
        record_breakpoints(
            &mut breakpoints,
            Some(&json!({
                "source": { "path": "a.py" },
                "breakpoints": [{ "line": 1 }, { "line": 5, "condition": "x > 2" }]
            })),
        );
        record_breakpoints(
            &mut breakpoints,
            Some(&json!({ "source": { "path": "b.py" }, "breakpoints": [{ "line": 9 }] })),
        );
        record_breakpoints(
            &mut breakpoints,
            Some(&json!({ "source": { "path": "a.py" }, "breakpoints": [{ "line": 3 }] })),
        );

        assert_eq!(breakpoints.len(), 2);
        assert_eq!(breakpoints[0].0, "a.py");
        assert_eq!(breakpoints[0].1.len(), 1);
        assert_eq!(breakpoints[0].1[0].line, 3);
        assert_eq!(breakpoints[1].0, "b.py");
    }

    #[test]
    fn test_strip_filter_flags() {
        let (args, internals, special) = strip_filter_flags(Some(json!({
            "threadId": 1,
            "includeInternals": true,
            "includeSpecial": true,
        })));
        assert!(internals);
        assert!(special);
        assert_eq!(args, Some(json!({ "threadId": 1 })));

        let (args, internals, special) = strip_filter_flags(None);
        assert_eq!(args, None);
        assert!(!internals);
        assert!(!special);
    }

    #[test]
    fn test_normalize_output_event_defaults_category() {
        let event = normalize_event(Event::new("output", Some(json!({ "output": "hi\n" }))));
        assert_eq!(event.body.unwrap()["category"], "console");

        let event = normalize_event(Event::new(
            "output",
            Some(json!({ "output": "hi\n", "category": "stderr" })),
        ));
        assert_eq!(event.body.unwrap()["category"], "stderr");
    }
}

