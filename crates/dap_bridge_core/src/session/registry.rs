//! Process-wide table of live sessions. Routes control-plane calls to the
//! owning session and tears sessions down on disconnect.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::BridgeError;
use crate::policy::select_policy;
use crate::protocol::{Event, Response};
use crate::repl::ReplDebugSession;
use crate::session::engine::SessionEngine;
use crate::session::state::SessionState;
use crate::session::DebugSession;
use crate::Result;

const MAX_RECENT_EVENTS: usize = 1024;

type EventRing = Arc<Mutex<VecDeque<(u64, Event)>>>;

struct SessionEntry {
    session: Arc<dyn DebugSession>,
    recent_events: EventRing,
    pump: JoinHandle<()>,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub policy: &'static str,
    pub state: SessionState,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for the named backend policy. REPL-backed policies
    /// go through the bridge; everything else speaks framed DAP.
    pub async fn create_session(&self, policy_name: &str, config: SessionConfig) -> Result<String> {
        let policy = select_policy(policy_name)?;
        let id = Uuid::new_v4().to_string();

        let session: Arc<dyn DebugSession> = if policy.uses_repl_bridge() {
            ReplDebugSession::create(id.clone(), policy, config).await? as Arc<dyn DebugSession>
        } else {
            SessionEngine::create(id.clone(), policy, config).await? as Arc<dyn DebugSession>
        };

        self.register(session).await;
        Ok(id)
    }

    /// Insert an already-built session and start buffering its events for
    /// poll-based consumers.
    pub async fn register(&self, session: Arc<dyn DebugSession>) {
        let recent_events: EventRing = Arc::new(Mutex::new(VecDeque::new()));
        let pump = {
            let ring = recent_events.clone();
            let mut events = session.subscribe_events();
            tokio::spawn(async move {
                let mut next_seq = 0u64;
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            let mut ring = ring.lock().await;
                            push_recent_event(&mut ring, next_seq, event);
                            next_seq += 1;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        let entry = SessionEntry {
            session: session.clone(),
            recent_events,
            pump,
        };
        self.sessions
            .lock()
            .await
            .insert(session.id().to_string(), entry);
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<dyn DebugSession>> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))
    }

    pub async fn submit_command(
        &self,
        session_id: &str,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Response> {
        let session = self.get(session_id).await?;
        session.submit_command(command, arguments).await
    }

    pub async fn subscribe_events(&self, session_id: &str) -> Result<broadcast::Receiver<Event>> {
        Ok(self.get(session_id).await?.subscribe_events())
    }

    /// Events with ring sequence >= `since`, for poll-based consumers.
    pub async fn recent_events(&self, session_id: &str, since: u64) -> Result<Vec<(u64, Event)>> {
        let ring = self
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|entry| entry.recent_events.clone())
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        let ring = ring.lock().await;
        Ok(ring
            .iter()
            .filter(|(seq, _)| *seq >= since)
            .cloned()
            .collect())
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<dyn DebugSession>> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|entry| entry.session.clone())
            .collect();

        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(SessionSummary {
                id: session.id().to_string(),
                policy: session.policy_name(),
                state: session.state().await,
            });
        }
        summaries
    }

    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let entry = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        entry.session.close().await;
        entry.pump.abort();
        Ok(())
    }

    pub async fn close_all(&self) {
        let entries: Vec<SessionEntry> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.session.close().await;
            entry.pump.abort();
        }
    }
}

fn push_recent_event(ring: &mut VecDeque<(u64, Event)>, seq: u64, event: Event) {
    ring.push_back((seq, event));
    while ring.len() > MAX_RECENT_EVENTS {
        ring.pop_front();
    }
}
