//! Session store contract.
//!
//! The runtime only needs load-by-id plus an opaque dirty/flush signal;
//! the persistence format belongs to the implementation. The store is
//! generic over the session state so the core crate never depends on the
//! agent's context window type.

use async_trait::async_trait;
use thiserror::Error;

use crate::message::SessionId;

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session expired: {0}")]
    Expired(String),

    #[error("Session storage failed: {0}")]
    Storage(String),
}

#[async_trait]
pub trait SessionStore<S>: Send + Sync
where
    S: Send + Sync + 'static,
{
    /// Load the session state for `id`, if the store knows it.
    async fn load(&self, id: &SessionId) -> std::result::Result<Option<S>, SessionError>;

    /// Replace the stored state for `id`.
    async fn save(&self, id: &SessionId, state: S) -> std::result::Result<(), SessionError>;

    /// Record that the state for `id` changed since the last flush.
    async fn mark_dirty(&self, id: &SessionId) -> std::result::Result<(), SessionError>;

    /// Persist every dirty session. Returns how many were flushed.
    async fn flush(&self) -> std::result::Result<usize, SessionError>;

    /// Drop the session entirely.
    async fn remove(&self, id: &SessionId) -> std::result::Result<bool, SessionError>;
}
