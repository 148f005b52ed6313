//! `GET /auth/callback` handler.

#[cfg(test)]
#[path = "callback_test.rs"]
mod tests;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

const SUCCESS_PAGE: &str = "<!doctype html><title>Develoop</title><p>Signed in. You can close this window and return to the terminal.</p>";
const FAILURE_PAGE: &str = "<!doctype html><title>Develoop</title><p>Sign-in did not complete. Return to the terminal and try again.</p>";

#[derive(Clone)]
pub(crate) struct CallbackState {
    pub(crate) outcome: mpsc::Sender<CallbackOutcome>,
}

/// Query parameters the provider appends to the redirect.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Code(String),
    Denied { error: String, description: Option<String> },
}

impl CallbackQuery {
    /// An explicit provider error wins over any code; an empty code is treated
    /// as missing.
    #[must_use]
    pub fn into_outcome(self) -> CallbackOutcome {
        if let Some(error) = self.error {
            return CallbackOutcome::Denied { error, description: self.error_description };
        }
        match self.code.filter(|c| !c.trim().is_empty()) {
            Some(code) => CallbackOutcome::Code(code),
            None => CallbackOutcome::Denied { error: "missing_code".to_owned(), description: None },
        }
    }
}

pub(crate) async fn oauth_callback(State(state): State<CallbackState>, Query(query): Query<CallbackQuery>) -> Response {
    let outcome = query.into_outcome();
    let (status, page) = match outcome {
        CallbackOutcome::Code(_) => (StatusCode::OK, SUCCESS_PAGE),
        CallbackOutcome::Denied { .. } => (StatusCode::BAD_REQUEST, FAILURE_PAGE),
    };
    if state.outcome.try_send(outcome).is_err() {
        debug!("oauth callback already handled; ignoring repeat");
    }
    (status, Html(page)).into_response()
}
