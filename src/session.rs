//! Session Manager (C5)
//!
//! Allocates session IDs and monotonic chunk IDs per session. Grounded in
//! `websocket_handler.py`'s `SessionManager`: generated IDs follow the
//! same `"{prefix}_{short_uuid}"` shape, and ended sessions are reaped by
//! a per-session delayed task rather than a single global sweep, since
//! each session's grace period starts at a different time.

use crate::error::SessionError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Ended,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub next_chunk_id: u64,
    pub bytes_in: u64,
    pub chunks_in: u64,
    pub status: SessionStatus,
}

impl Session {
    fn new(session_id: String) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            created_at: now,
            last_activity: now,
            next_chunk_id: 0,
            bytes_in: 0,
            chunks_in: 0,
            status: SessionStatus::Active,
        }
    }
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    grace: Duration,
}

impl SessionManager {
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            grace,
        })
    }

    /// Allocate a new session. S2: the generated ID is unique across
    /// live and recently-ended sessions by construction (UUIDv4).
    pub async fn create(&self) -> String {
        let session_id = format!("ws_session_{}", short_id());
        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), Session::new(session_id.clone()));
        session_id
    }

    /// Atomically return the current `next_chunk_id` and increment it
    /// (S1: strictly increasing, no gaps, per session).
    pub async fn next_chunk_id(&self, session_id: &str) -> Result<u64, SessionError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        let id = session.next_chunk_id;
        session.next_chunk_id += 1;
        session.chunks_in += 1;
        session.last_activity = Instant::now();
        Ok(id)
    }

    pub async fn record_bytes(&self, session_id: &str, bytes: u64) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        session.bytes_in += bytes;
        session.last_activity = Instant::now();
        Ok(())
    }

    pub async fn info(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Mark the session Ended and schedule its removal after the grace
    /// period. Late `chunk_done` events can still resolve it via `info`
    /// until then.
    pub async fn end(self: &Arc<Self>, session_id: &str) {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get_mut(session_id) {
                session.status = SessionStatus::Ended;
                session.last_activity = Instant::now();
            } else {
                return;
            }
        }

        let this = self.clone();
        let session_id = session_id.to_string();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.sessions.lock().await.remove(&session_id);
        });
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
