//! Sessions and an in-memory session store.

use std::collections::HashMap;
use std::time::Duration;

use agentloom_core::message::SessionId;
use agentloom_core::session::{SessionError, SessionStore};
use agentloom_tools::CapabilityPolicy;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::context::{ContextWindow, WindowSettings};

/// Per-conversation state owned by one control loop at a time.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub window: ContextWindow,
    /// Narrows the loop's base policy for this session only
    pub policy: Option<CapabilityPolicy>,
    dirty: bool,
}

impl Session {
    pub fn new(id: SessionId, settings: WindowSettings) -> Self {
        Self::with_window(id, ContextWindow::new(settings))
    }

    pub fn with_window(id: SessionId, window: ContextWindow) -> Self {
        Self {
            id,
            window,
            policy: None,
            dirty: false,
        }
    }

    pub fn with_policy(mut self, policy: CapabilityPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

struct StoredSession {
    session: Session,
    dirty: bool,
    touched: Instant,
}

/// Keeps sessions in process memory, optionally expiring idle ones.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, StoredSession>>,
    ttl: Option<Duration>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions idle longer than `ttl` are reported as expired and dropped.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    /// Load the session, or start a fresh one with `settings`.
    pub async fn load_or_create(
        &self,
        id: &SessionId,
        settings: WindowSettings,
    ) -> Result<Session, SessionError> {
        match self.load(id).await? {
            Some(session) => Ok(session),
            None => Ok(Session::new(id.clone(), settings)),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    fn expired(&self, stored: &StoredSession) -> bool {
        self.ttl.is_some_and(|ttl| stored.touched.elapsed() > ttl)
    }
}

#[async_trait]
impl SessionStore<Session> for InMemorySessionStore {
    async fn load(&self, id: &SessionId) -> Result<Option<Session>, SessionError> {
        let mut sessions = self.sessions.write().await;
        let Some(stored) = sessions.get_mut(id) else {
            return Ok(None);
        };
        if self.expired(stored) {
            sessions.remove(id);
            debug!(session_id = %id, "Session expired");
            return Err(SessionError::Expired(id.to_string()));
        }
        stored.touched = Instant::now();
        Ok(Some(stored.session.clone()))
    }

    async fn save(&self, id: &SessionId, mut state: Session) -> Result<(), SessionError> {
        let dirty = state.dirty;
        state.dirty = false;
        self.sessions.write().await.insert(
            id.clone(),
            StoredSession {
                session: state,
                dirty,
                touched: Instant::now(),
            },
        );
        Ok(())
    }

    async fn mark_dirty(&self, id: &SessionId) -> Result<(), SessionError> {
        match self.sessions.write().await.get_mut(id) {
            Some(stored) => {
                stored.dirty = true;
                Ok(())
            }
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }

    async fn flush(&self) -> Result<usize, SessionError> {
        let mut sessions = self.sessions.write().await;
        let mut flushed = 0;
        for stored in sessions.values_mut().filter(|s| s.dirty) {
            stored.dirty = false;
            flushed += 1;
        }
        debug!(flushed, "Flushed sessions");
        Ok(flushed)
    }

    async fn remove(&self, id: &SessionId) -> Result<bool, SessionError> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }
}
