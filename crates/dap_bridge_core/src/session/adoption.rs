//! Child-session adoption for multi-session backends.
//!
//! After `configurationDone`, a multi-session backend sends a reverse
//! `startDebugging` request naming a pending target. The parent stays a
//! control channel; a child session on a fresh connection to the same
//! backend process runs the generic handshake and attaches to the real
//! debuggee.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};

use crate::client::DapClient;
use crate::config::SessionTimeouts;
use crate::error::BridgeError;
use crate::policy::AdapterPolicy;
use crate::protocol::Event;
use crate::session::BreakpointSpec;
use crate::Result;

const ATTACH_RETRIES: usize = 20;
const ATTACH_RETRY_DELAY: Duration = Duration::from_millis(200);
const FALLBACK_ATTACH_RETRIES: usize = 3;
const POST_ATTACH_INIT_WAIT: Duration = Duration::from_secs(3);
const ENSURE_STOPPED_WAIT: Duration = Duration::from_secs(15);

#[derive(Default)]
struct AdoptionState {
    adopted: HashSet<String>,
    children: HashMap<String, Arc<DapClient>>,
    active: Option<Arc<DapClient>>,
    in_progress: bool,
}

pub struct ChildSessionManager {
    policy: Arc<dyn AdapterPolicy>,
    host: String,
    port: u16,
    timeouts: SessionTimeouts,
    /// Parent session's controller-facing event stream; child events are
    /// forwarded here so the controller sees one merged stream.
    events_tx: broadcast::Sender<Event>,
    state: Mutex<AdoptionState>,
}

impl ChildSessionManager {
    pub fn new(
        policy: Arc<dyn AdapterPolicy>,
        host: String,
        port: u16,
        timeouts: SessionTimeouts,
        events_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            policy,
            host,
            port,
            timeouts,
            events_tx,
            state: Mutex::new(AdoptionState::default()),
        }
    }

    pub async fn active_child(&self) -> Option<Arc<DapClient>> {
        self.state.lock().await.active.clone()
    }

    pub async fn has_children(&self) -> bool {
        let state = self.state.lock().await;
        state.active.is_some() || !state.children.is_empty()
    }

    pub async fn is_adopted(&self, pending_id: &str) -> bool {
        self.state.lock().await.adopted.contains(pending_id)
    }

    /// Adopt a pending target. Idempotent: a duplicate identifier, or a
    /// request arriving while adoption is already underway, is ignored and
    /// returns `Ok(None)`.
    pub async fn adopt(
        &self,
        pending_id: &str,
        parent_config: &Value,
        breakpoints: &[(String, Vec<BreakpointSpec>)],
    ) -> Result<Option<Arc<DapClient>>> {
        {
            let mut state = self.state.lock().await;
            if state.adopted.contains(pending_id) {
                tracing::warn!(pending_id, "pending target already adopted, ignoring");
                return Ok(None);
            }
            if state.in_progress || state.active.is_some() {
                tracing::info!(pending_id, "adoption already in progress or child active, ignoring");
                return Ok(None);
            }
            state.in_progress = true;
            state.adopted.insert(pending_id.to_string());
        }

        let result = self
            .run_adoption(pending_id, parent_config, breakpoints)
            .await;

        let mut state = self.state.lock().await;
        state.in_progress = false;
        match result {
            Ok(child) => {
                state.children.insert(pending_id.to_string(), child.clone());
                state.active = Some(child.clone());
                tracing::info!(pending_id, "child session adopted");
                Ok(Some(child))
            }
            Err(e) => {
                tracing::error!(pending_id, error = %e, "child session adoption failed");
                Err(e)
            }
        }
    }

    async fn run_adoption(
        &self,
        pending_id: &str,
        parent_config: &Value,
        breakpoints: &[(String, Vec<BreakpointSpec>)],
    ) -> Result<Arc<DapClient>> {
        let child = Arc::new(
            DapClient::connect(&self.host, self.port, self.timeouts.child_attach).await?,
        );
        self.wire_child(&child).await;

        match self
            .drive_child_handshake(&child, pending_id, parent_config, breakpoints)
            .await
        {
            Ok(()) => Ok(child),
            Err(e) => {
                child.shutdown(self.timeouts.graceful_exit).await;
                Err(e)
            }
        }
    }

    async fn drive_child_handshake(
        &self,
        child: &Arc<DapClient>,
        pending_id: &str,
        parent_config: &Value,
        breakpoints: &[(String, Vec<BreakpointSpec>)],
    ) -> Result<()> {
        let behavior = self.policy.client_behavior();
        let mut events = child.subscribe_events();

        // Generic handshake against the child.
        let init_args = json!({
            "clientID": format!("dap-bridge-child-{pending_id}"),
            "adapterID": self.policy.name(),
            "pathFormat": "path",
            "linesStartAt1": true,
            "columnsStartAt1": true,
        });
        // Receiver subscribed before the send; an immediate `initialized`
        // cannot be missed.
        child
            .send_request("initialize", Some(init_args), self.timeouts.initialize)
            .await?;

        let init_wait = behavior
            .child_init_timeout
            .unwrap_or(self.timeouts.child_initialized);
        let policy = self.policy.clone();
        if !wait_for_event(&mut events, init_wait, |event| policy.is_child_ready_event(event)).await
        {
            tracing::warn!(pending_id, "timed out waiting for child ready event, continuing");
        }

        self.configure_child(child, pending_id, breakpoints, &behavior)
            .await;

        // Bind to the pending target, retrying while the backend finishes
        // wiring the debuggee.
        let start = self.policy.build_child_start_args(pending_id, parent_config)?;
        let mut attached = false;
        let mut last_error = None;
        for attempt in 1..=ATTACH_RETRIES {
            tracing::debug!(pending_id, attempt, command = start.bind.dap_command(), "child attach attempt");
            match child
                .send_request(
                    start.bind.dap_command(),
                    Some(start.args.clone()),
                    self.timeouts.child_attach,
                )
                .await
            {
                Ok(_) => {
                    attached = true;
                    break;
                }
                Err(e) => {
                    last_error = Some(e);
                    tokio::time::sleep(ATTACH_RETRY_DELAY).await;
                }
            }
        }

        if !attached {
            attached = self.try_fallback_attach(child, parent_config).await;
        }

        if !attached {
            let reason = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attach attempt completed".to_string());
            return Err(BridgeError::Connection(format!(
                "failed to attach child session after {ATTACH_RETRIES} attempts: {reason}"
            )));
        }

        self.post_attach(child, pending_id, breakpoints, &behavior, &mut events)
            .await;

        Ok(())
    }

    /// Child-side configuration before attach: exception filters, mirrored
    /// breakpoints, configurationDone. Each step tolerates rejection.
    async fn configure_child(
        &self,
        child: &DapClient,
        pending_id: &str,
        breakpoints: &[(String, Vec<BreakpointSpec>)],
        behavior: &crate::policy::ClientBehavior,
    ) {
        if let Err(e) = child
            .send_request(
                "setExceptionBreakpoints",
                Some(json!({ "filters": [] })),
                self.timeouts.request,
            )
            .await
        {
            tracing::warn!(pending_id, error = %e, "child setExceptionBreakpoints rejected");
        }

        if behavior.mirror_breakpoints_to_child {
            self.mirror_breakpoints(child, pending_id, breakpoints).await;
        }

        if !behavior.suppress_post_attach_config_done {
            if let Err(e) = child
                .send_request("configurationDone", Some(json!({})), self.timeouts.configuration_done)
                .await
            {
                tracing::warn!(pending_id, error = %e, "child configurationDone rejected");
            }
        }
    }

    async fn mirror_breakpoints(
        &self,
        child: &DapClient,
        pending_id: &str,
        breakpoints: &[(String, Vec<BreakpointSpec>)],
    ) {
        for (path, specs) in breakpoints {
            let dap_breakpoints: Vec<Value> = specs.iter().map(BreakpointSpec::to_dap).collect();
            tracing::debug!(pending_id, %path, count = dap_breakpoints.len(), "mirroring breakpoints to child");
            if let Err(e) = child
                .send_request(
                    "setBreakpoints",
                    Some(json!({
                        "source": { "path": path },
                        "breakpoints": dap_breakpoints,
                    })),
                    self.timeouts.request,
                )
                .await
            {
                tracing::warn!(pending_id, %path, error = %e, "mirrored setBreakpoints rejected");
            }
        }
    }

    /// Some backends emit a second `initialized` after attach; when that
    /// happens the child's configuration must be replayed. The caller's
    /// event receiver is reused so nothing emitted around the attach is
    /// missed.
    async fn post_attach(
        &self,
        child: &Arc<DapClient>,
        pending_id: &str,
        breakpoints: &[(String, Vec<BreakpointSpec>)],
        behavior: &crate::policy::ClientBehavior,
        events: &mut broadcast::Receiver<Event>,
    ) {
        let saw_post_init =
            wait_for_event(events, POST_ATTACH_INIT_WAIT, |event| event.event == "initialized")
                .await;

        if saw_post_init && behavior.mirror_breakpoints_to_child {
            if let Err(e) = child
                .send_request(
                    "setExceptionBreakpoints",
                    Some(json!({ "filters": [] })),
                    self.timeouts.request,
                )
                .await
            {
                tracing::debug!(pending_id, error = %e, "post-attach setExceptionBreakpoints rejected");
            }
            self.mirror_breakpoints(child, pending_id, breakpoints).await;
        }

        if behavior.pause_after_child_attach {
            self.ensure_stopped(child, pending_id, events).await;
        }
    }

    /// Wait for the child to stop; if it never does, probe its threads and
    /// ask for a pause so the controller lands in a stopped state.
    async fn ensure_stopped(
        &self,
        child: &Arc<DapClient>,
        pending_id: &str,
        events: &mut broadcast::Receiver<Event>,
    ) {
        if wait_for_event(events, ENSURE_STOPPED_WAIT, |event| event.event == "stopped").await {
            return;
        }

        tracing::info!(pending_id, "child did not stop on its own, requesting pause");
        let threads = match child
            .send_request("threads", None, self.timeouts.request)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(pending_id, error = %e, "could not list child threads for pause");
                return;
            }
        };

        let thread_id = threads
            .body
            .as_ref()
            .and_then(|body| body.get("threads"))
            .and_then(Value::as_array)
            .and_then(|threads| threads.first())
            .and_then(|thread| thread.get("id"))
            .and_then(Value::as_u64);

        if let Some(thread_id) = thread_id {
            let _ = child
                .send_request(
                    "pause",
                    Some(json!({ "threadId": thread_id })),
                    self.timeouts.request,
                )
                .await;
            // js-debug quirk: thread ids can start at 1 while the listing
            // reports 0.
            if thread_id == 0 {
                let _ = child
                    .send_request("pause", Some(json!({ "threadId": 1 })), self.timeouts.request)
                    .await;
            }
        }
    }

    /// Last resort when the pending-target attach never succeeds: bind by
    /// the backend's raw inspector address if the parent config names one.
    async fn try_fallback_attach(&self, child: &DapClient, parent_config: &Value) -> bool {
        let Some(port) = parent_config.get("port").and_then(Value::as_u64) else {
            return false;
        };
        let host = parent_config
            .get("host")
            .and_then(Value::as_str)
            .unwrap_or("127.0.0.1");

        let args = json!({
            "request": "attach",
            "host": host,
            "port": port,
            "continueOnAttach": true,
        });

        for attempt in 1..=FALLBACK_ATTACH_RETRIES {
            tracing::info!(attempt, port, "fallback attach by inspector port");
            if child
                .send_request("attach", Some(args.clone()), self.timeouts.child_attach)
                .await
                .is_ok()
            {
                return true;
            }
            tokio::time::sleep(ATTACH_RETRY_DELAY).await;
        }
        false
    }

    /// Forward child events into the parent's stream and answer any child
    /// reverse requests so the backend never hangs on them.
    async fn wire_child(&self, child: &Arc<DapClient>) {
        let mut events = child.subscribe_events();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let _ = events_tx.send(event);
            }
        });

        if let Some(mut reverse) = child.take_reverse_requests().await {
            let child = child.clone();
            tokio::spawn(async move {
                while let Some(request) = reverse.recv().await {
                    tracing::debug!(command = %request.command, "acknowledging child reverse request");
                    let _ = child.send_response(&request, true, Value::Null).await;
                }
            });
        }
    }

    /// Tear down every child. Cancelling a parent cancels its children.
    pub async fn shutdown(&self, grace: Duration) {
        let mut state = self.state.lock().await;
        for (pending_id, child) in state.children.drain() {
            tracing::debug!(%pending_id, "shutting down child session");
            child.shutdown(grace).await;
        }
        state.active = None;
        state.adopted.clear();
    }
}

/// Drain a broadcast event stream until the predicate matches or the
/// deadline passes.
pub(crate) async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<Event>,
    deadline: Duration,
    predicate: F,
) -> bool
where
    F: Fn(&Event) -> bool,
{
    let timer = tokio::time::sleep(deadline);
    tokio::pin!(timer);
    loop {
        tokio::select! {
            _ = &mut timer => return false,
            received = events.recv() => match received {
                Ok(event) if predicate(&event) => return true,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::JsDebugPolicy;

    fn manager() -> ChildSessionManager {
        let (events_tx, _) = broadcast::channel(16);
        ChildSessionManager::new(
            Arc::new(JsDebugPolicy),
            "127.0.0.1".to_string(),
            1, // nothing listens here; adoption attempts fail fast
            SessionTimeouts {
                child_attach: Duration::from_millis(50),
                ..SessionTimeouts::default()
            },
            events_tx,
        )
    }

    #[tokio::test]
    async fn test_duplicate_pending_target_is_ignored() {
        let manager = manager();

        // First adoption fails (nothing listening) but marks the target.
        let first = manager
            .adopt("pending-1", &json!({}), &[])
            .await;
        assert!(first.is_err());
        assert!(manager.is_adopted("pending-1").await);

        // The duplicate is dropped without another connection attempt.
        let second = manager
            .adopt("pending-1", &json!({}), &[])
            .await
            .expect("duplicate is not an error");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_event_matches_and_times_out() {
        let (tx, mut rx) = broadcast::channel(4);
        tx.send(Event::new("output", None)).expect("send");
        tx.send(Event::new("initialized", None)).expect("send");
        assert!(
            wait_for_event(&mut rx, Duration::from_millis(100), |event| {
                event.event == "initialized"
            })
            .await
        );

        let (_tx2, mut rx2) = broadcast::channel::<Event>(4);
        assert!(
            !wait_for_event(&mut rx2, Duration::from_millis(20), |event| {
                event.event == "initialized"
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_no_children_initially() {
        let manager = manager();
        assert!(!manager.has_children().await);
        assert!(manager.active_child().await.is_none());
    }
}
