//! Session/auth state manager.
//!
//! DESIGN
//! ======
//! A single transition task owns the authoritative `AuthState` and publishes
//! it through a `watch` channel. Session notifications from the auth client
//! and local commands (`sign_out`, `refresh_profile`) are both funnelled into
//! that task, so every transition is applied in arrival order and readers
//! never observe a half-written state (identity without its profile reset, or
//! the reverse).
//!
//! SYSTEM CONTEXT
//! ==============
//! The manager subscribes to the auth client before running the initial
//! session probe. Notifications that arrive while the probe is in flight sit
//! in the subscription queue and are applied after the probe result, so the
//! last event processed wins.
//!
//! ERROR HANDLING
//! ==============
//! Probe failures and profile-fetch failures never surface as errors: the
//! first is treated as signed out, the second leaves `profile = None`. Both
//! are logged. Errors from explicit commands are returned to the caller.

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ErrorCode;
use crate::model::{Identity, Session, UserProfile};
use crate::remote::{AuthClient, RemoteError, SessionSubscription};
use crate::services::profile::{ProfileError, ProfileService};

const COMMAND_QUEUE: usize = 16;

// =============================================================================
// STATE
// =============================================================================

/// What the rest of the app knows about the signed-in user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthState {
    /// The initial session probe has not completed.
    #[default]
    Initializing,
    Unauthenticated,
    Authenticated {
        identity: Identity,
        /// `None` until loaded, or when loading failed.
        profile: Option<UserProfile>,
    },
}

impl AuthState {
    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Initializing)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Authenticated { identity, .. } => Some(identity),
            _ => None,
        }
    }

    #[must_use]
    pub fn profile(&self) -> Option<&UserProfile> {
        match self {
            Self::Authenticated { profile, .. } => profile.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error("auth state manager stopped")]
    ManagerStopped,
    #[error("oauth callback failed: {0}")]
    OAuthCallback(String),
}

impl ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Remote(e) => e.error_code(),
            Self::Profile(e) => e.error_code(),
            Self::ManagerStopped => "E_MANAGER_STOPPED",
            Self::OAuthCallback(_) => "E_OAUTH_CALLBACK",
        }
    }

    fn user_message(&self) -> String {
        match self {
            Self::Remote(e) => e.user_message(),
            Self::Profile(e) => e.user_message(),
            Self::ManagerStopped => crate::error::GENERIC_FAILURE_MESSAGE.to_owned(),
            Self::OAuthCallback(_) => "Sign-in with the provider did not complete. Please try again.".to_owned(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Remote(e) => e.retryable(),
            Self::Profile(e) => e.retryable(),
            Self::ManagerStopped | Self::OAuthCallback(_) => false,
        }
    }
}

enum Command {
    SignOut { reply: oneshot::Sender<Result<(), AuthError>> },
    RefreshProfile { reply: oneshot::Sender<Result<(), AuthError>> },
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable capability for reading auth state and issuing auth commands.
#[derive(Clone)]
pub struct AuthHandle {
    state_rx: watch::Receiver<AuthState>,
    commands: mpsc::Sender<Command>,
}

impl AuthHandle {
    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.state_rx.borrow().clone()
    }

    /// Receiver that observes every published state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state_rx.clone()
    }

    /// Wait for the initial session probe to finish.
    ///
    /// # Errors
    ///
    /// `ManagerStopped` if the manager stops before leaving `Initializing`.
    pub async fn wait_until_ready(&self) -> Result<AuthState, AuthError> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|s| !s.is_loading())
            .await
            .map_err(|_| AuthError::ManagerStopped)?;
        Ok(state.clone())
    }

    /// Invalidate the session remotely and clear local state. Local state is
    /// cleared even when the remote call fails.
    ///
    /// # Errors
    ///
    /// The remote failure, or `ManagerStopped`.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.call(|reply| Command::SignOut { reply }).await
    }

    /// Re-fetch the signed-in user's profile. No-op when signed out.
    ///
    /// # Errors
    ///
    /// The profile fetch failure, or `ManagerStopped`.
    pub async fn refresh_profile(&self) -> Result<(), AuthError> {
        self.call(|reply| Command::RefreshProfile { reply }).await
    }

    async fn call(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), AuthError>>) -> Command,
    ) -> Result<(), AuthError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| AuthError::ManagerStopped)?;
        rx.await.map_err(|_| AuthError::ManagerStopped)?
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Owner of the transition task. Dropping it aborts the task.
pub struct AuthManager {
    handle: AuthHandle,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AuthManager {
    /// Subscribe to session changes and start the transition task. The
    /// returned manager is in `Initializing` until the probe completes.
    #[must_use]
    pub fn start(auth: Arc<dyn AuthClient>, profiles: ProfileService) -> Self {
        let subscription = auth.subscribe();
        let (state_tx, state_rx) = watch::channel(AuthState::Initializing);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = Transitions { auth, profiles, state: state_tx };
        let task = tokio::spawn(worker.run(subscription, cmd_rx, shutdown_rx));

        Self {
            handle: AuthHandle { state_rx, commands: cmd_tx },
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    #[must_use]
    pub fn handle(&self) -> AuthHandle {
        self.handle.clone()
    }

    /// Unsubscribe from session changes and wait for the task to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "auth state task ended abnormally");
            }
        }
    }
}

impl Drop for AuthManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// TRANSITION TASK
// =============================================================================

struct Transitions {
    auth: Arc<dyn AuthClient>,
    profiles: ProfileService,
    state: watch::Sender<AuthState>,
}

impl Transitions {
    async fn run(
        self,
        mut subscription: SessionSubscription,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            probe = self.auth.current_session() => match probe {
                Ok(session) => self.apply_session(session).await,
                Err(e) => {
                    warn!(error = %e, "session probe failed; treating as signed out");
                    self.set_unauthenticated();
                }
            },
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                event = subscription.recv() => match event {
                    Some(event) => {
                        debug!(kind = ?event.kind, "session notification");
                        self.apply_session(event.session).await;
                    }
                    None => break,
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        debug!("auth state manager stopped");
    }

    async fn handle(&self, command: Command) {
        match command {
            Command::SignOut { reply } => {
                let result = self.auth.sign_out().await;
                self.set_unauthenticated();
                if let Err(e) = &result {
                    warn!(error = %e, "remote sign-out failed; local session cleared");
                }
                let _ = reply.send(result.map_err(AuthError::from));
            }
            Command::RefreshProfile { reply } => {
                let _ = reply.send(self.refresh_profile().await);
            }
        }
    }

    async fn apply_session(&self, session: Option<Session>) {
        let Some(Session { identity, .. }) = session else {
            self.set_unauthenticated();
            return;
        };

        // Some(has_profile) when the notification is for the signed-in identity.
        let cached = match &*self.state.borrow() {
            AuthState::Authenticated { identity: current, profile } if current.id == identity.id => {
                Some(profile.is_some())
            }
            _ => None,
        };
        if cached == Some(true) {
            // Token refresh: keep the cached profile.
            self.state.send_if_modified(|state| match state {
                AuthState::Authenticated { identity: current, .. } if *current != identity => {
                    *current = identity;
                    true
                }
                _ => false,
            });
            return;
        }

        let profile = self.fetch_profile(&identity).await;
        if cached.is_none() {
            info!(user_id = %identity.id, has_profile = profile.is_some(), "signed in");
        } else {
            debug!(user_id = %identity.id, recovered = profile.is_some(), "retried profile fetch on token refresh");
        }
        let next = AuthState::Authenticated { identity, profile };
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    async fn refresh_profile(&self) -> Result<(), AuthError> {
        let current = self.state.borrow().identity().cloned();
        let Some(identity) = current else {
            return Ok(());
        };
        let profile = self.profiles.load_own_profile(&identity).await?;
        self.state.send_if_modified(|state| match state {
            AuthState::Authenticated { identity: current, profile: slot } if current.id == identity.id => {
                *slot = Some(profile);
                true
            }
            _ => false,
        });
        Ok(())
    }

    async fn fetch_profile(&self, identity: &Identity) -> Option<UserProfile> {
        match self.profiles.load_own_profile(identity).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(user_id = %identity.id, error = %e, "profile fetch failed");
                None
            }
        }
    }

    fn set_unauthenticated(&self) {
        self.state.send_if_modified(|state| {
            if matches!(state, AuthState::Unauthenticated) {
                return false;
            }
            *state = AuthState::Unauthenticated;
            true
        });
    }
}
