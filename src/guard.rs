//! Route guard for protected views.
//!
//! SYSTEM CONTEXT
//! ==============
//! Every protected surface applies the same rule: show a loading placeholder
//! while the session probe runs, send the user to the sign-in page once auth
//! has settled with no user, and render content otherwise. Protected content
//! is never produced for an unauthenticated state.

#[cfg(test)]
#[path = "guard_test.rs"]
mod tests;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::state::{AuthHandle, AuthState};

pub const SIGN_IN_PATH: &str = "/auth/signin";
pub const CALLBACK_PATH: &str = "/auth/callback";

/// What a protected route should render for a given auth state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardView {
    Loading,
    Hidden,
    Protected,
}

#[must_use]
pub fn guard_view(state: &AuthState) -> GuardView {
    match state {
        AuthState::Initializing => GuardView::Loading,
        AuthState::Unauthenticated => GuardView::Hidden,
        AuthState::Authenticated { .. } => GuardView::Protected,
    }
}

/// Auth has loaded and no user is present.
#[must_use]
pub fn should_redirect_unauth(state: &AuthState) -> bool {
    matches!(state, AuthState::Unauthenticated)
}

/// Side effect used to leave a protected route.
pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str);
}

impl<T: Navigator + ?Sized> Navigator for Arc<T> {
    fn navigate(&self, path: &str) {
        (**self).navigate(path);
    }
}

/// Watches auth state for one protected view.
///
/// Issues exactly one navigation to [`SIGN_IN_PATH`] each time the state
/// settles as unauthenticated; the trigger re-arms once a user is present
/// again.
pub struct RouteGuard<N: Navigator> {
    rx: watch::Receiver<AuthState>,
    navigator: N,
    redirected: bool,
}

impl<N: Navigator> RouteGuard<N> {
    /// Evaluates the current state immediately, so an already-settled
    /// unauthenticated state redirects on construction.
    pub fn new(auth: &AuthHandle, navigator: N) -> Self {
        let mut guard = Self { rx: auth.subscribe(), navigator, redirected: false };
        guard.rx.borrow_and_update();
        guard.evaluate();
        guard
    }

    #[must_use]
    pub fn view(&self) -> GuardView {
        guard_view(&self.rx.borrow())
    }

    /// What the view should show: `content` when protected, the optional
    /// `placeholder` while loading, and nothing once the user is known to be
    /// signed out.
    pub fn render<T>(&self, content: impl FnOnce() -> T, placeholder: Option<T>) -> Option<T> {
        match self.view() {
            GuardView::Protected => Some(content()),
            GuardView::Loading => placeholder,
            GuardView::Hidden => None,
        }
    }

    /// Wait for the next state change and re-evaluate. `None` once the auth
    /// manager has stopped.
    pub async fn changed(&mut self) -> Option<GuardView> {
        self.rx.changed().await.ok()?;
        Some(self.evaluate())
    }

    /// Re-evaluate on every state change until the auth manager stops.
    pub async fn run(&mut self) {
        while self.changed().await.is_some() {}
    }

    fn evaluate(&mut self) -> GuardView {
        let view = self.view();
        match view {
            GuardView::Hidden if !self.redirected => {
                debug!(path = SIGN_IN_PATH, "redirecting unauthenticated view");
                self.redirected = true;
                self.navigator.navigate(SIGN_IN_PATH);
            }
            GuardView::Protected => self.redirected = false,
            GuardView::Hidden | GuardView::Loading => {}
        }
        view
    }
}
