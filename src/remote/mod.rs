//! Remote collaborators: the hosted auth service and the row store.
//!
//! DESIGN
//! ======
//! Both services are black boxes reached by request/response calls. They are
//! modelled as async traits so the profile layer and auth state manager can
//! run against Supabase, a direct Postgres store, or in-process test doubles.
//!
//! Session-change notifications fan out through a `SessionBus`. Subscribers
//! hold a `SessionSubscription` handle; dropping or unsubscribing it removes
//! the subscriber, so repeated start/stop cycles never leak listeners.

#[cfg(test)]
pub mod memory;
pub mod supabase;

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::model::{
    Event, NewEvent, NewProfile, NewProject, ProfilePatch, ProjectPost, Provider, Session, UserProfile,
};

/// Postgres SQLSTATE for `unique_violation`.
pub const UNIQUE_VIOLATION_CODE: &str = "23505";

// =============================================================================
// ERROR
// =============================================================================

/// Failures reported by the auth service or the row store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// A unique constraint rejected the write.
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// Email/password (or refresh token) rejected.
    #[error("invalid login credentials")]
    InvalidCredentials,

    /// The access token was rejected or has expired.
    #[error("session rejected by remote service")]
    Unauthorized,

    /// Any other non-success status.
    #[error("remote returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The request never produced a response.
    #[error("request failed: {0}")]
    Transport(String),

    /// The response body did not match the expected shape.
    #[error("response parse failed: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Uniqueness violation on the profile `username` column.
    #[must_use]
    pub fn is_username_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { constraint } if constraint.contains("username"))
    }

    /// Uniqueness violation on a primary key (e.g. a concurrent insert of the same id).
    #[must_use]
    pub fn is_primary_key_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { constraint } if constraint.ends_with("_pkey"))
    }

    /// The remote service no longer accepts the current session.
    #[must_use]
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::InvalidCredentials)
    }
}

impl ErrorCode for RemoteError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UniqueViolation { .. } => "E_UNIQUE_VIOLATION",
            Self::InvalidCredentials => "E_INVALID_CREDENTIALS",
            Self::Unauthorized => "E_UNAUTHORIZED",
            Self::Status { .. } => "E_REMOTE_STATUS",
            Self::Transport(_) => "E_TRANSPORT",
            Self::Decode(_) => "E_DECODE",
        }
    }

    fn user_message(&self) -> String {
        match self {
            Self::InvalidCredentials => "Incorrect email or password.".to_owned(),
            Self::Unauthorized => "Your session has expired. Please sign in again.".to_owned(),
            _ => crate::error::GENERIC_FAILURE_MESSAGE.to_owned(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Status { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// SESSION NOTIFICATIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// A session-change notification. Consumers only look at whether `session`
/// is present; `kind` is informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: Option<Session>,
}

impl SessionEvent {
    #[must_use]
    pub fn signed_in(session: Session) -> Self {
        Self { kind: SessionEventKind::SignedIn, session: Some(session) }
    }

    #[must_use]
    pub fn signed_out() -> Self {
        Self { kind: SessionEventKind::SignedOut, session: None }
    }
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<SessionEvent>>,
}

/// Fan-out of session events to every live subscription.
#[derive(Clone, Default)]
pub struct SessionBus {
    inner: Arc<Mutex<BusInner>>,
}

impl SessionBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> SessionSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);
        SessionSubscription { id, rx, bus: Arc::downgrade(&self.inner) }
    }

    /// Deliver `event` to all subscribers, pruning any whose receiver is gone.
    pub fn emit(&self, event: &SessionEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}

/// Cancellable handle on the session-change stream.
pub struct SessionSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    bus: Weak<Mutex<BusInner>>,
}

impl SessionSubscription {
    /// Next notification, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Explicitly detach from the bus. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .remove(&self.id);
        }
    }
}

// =============================================================================
// COLLABORATOR TRAITS
// =============================================================================

/// Hosted auth service: session issuance, credential checks, OAuth, sign-out.
#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Session probe. Returns the current session, refreshing it when close
    /// to expiry, or `None` when signed out.
    async fn current_session(&self) -> Result<Option<Session>, RemoteError>;

    fn subscribe(&self) -> SessionSubscription;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, RemoteError>;

    /// Register a new account. Returns `None` when the service requires email
    /// confirmation before issuing a session.
    async fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>, RemoteError>;

    /// URL of the external consent page for `provider` (PKCE flow).
    fn oauth_authorize_url(
        &self,
        provider: Provider,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<String, RemoteError>;

    async fn exchange_code_for_session(&self, code: &str, code_verifier: &str) -> Result<Session, RemoteError>;

    /// Invalidate the session. The local session is cleared even when the
    /// remote call fails.
    async fn sign_out(&self) -> Result<(), RemoteError>;
}

/// Row operations on the profile table.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn select_profile(&self, id: Uuid) -> Result<Option<UserProfile>, RemoteError>;

    /// Any profile holding `username`, ignoring the row with id `excluding`.
    async fn select_profile_by_username(
        &self,
        username: &str,
        excluding: Option<Uuid>,
    ) -> Result<Option<UserProfile>, RemoteError>;

    async fn insert_profile(&self, row: &NewProfile) -> Result<UserProfile, RemoteError>;

    /// Returns `None` when no row with `id` exists.
    async fn update_profile(&self, id: Uuid, patch: &ProfilePatch) -> Result<Option<UserProfile>, RemoteError>;

    /// Up to `limit` rows, newest `created_at` first.
    async fn recent_profiles(&self, limit: u32) -> Result<Vec<UserProfile>, RemoteError>;
}

/// Row operations on the events and project-post tables.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn insert_event(&self, event: &NewEvent) -> Result<Event, RemoteError>;

    /// Up to `limit` events, soonest first.
    async fn list_events(&self, limit: u32) -> Result<Vec<Event>, RemoteError>;

    async fn insert_project(&self, project: &NewProject) -> Result<ProjectPost, RemoteError>;

    /// Up to `limit` public posts, newest first.
    async fn list_projects(&self, limit: u32) -> Result<Vec<ProjectPost>, RemoteError>;
}
