//! Loopback HTTP surface for the OAuth redirect.
//!
//! SYSTEM CONTEXT
//! ==============
//! The provider redirects the browser to `http://127.0.0.1:<port>/auth/callback`.
//! This router serves that one path, hands the first outcome back to the
//! waiting sign-in flow, then shuts down gracefully.

pub mod callback;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::guard::CALLBACK_PATH;
use crate::state::AuthError;

pub use callback::{CallbackOutcome, CallbackQuery};

/// Error tag surfaced when the provider redirect carries no usable code.
pub const CALLBACK_ERROR: &str = "callback_error";

fn router(tx: mpsc::Sender<CallbackOutcome>) -> Router {
    Router::new()
        .route(CALLBACK_PATH, get(callback::oauth_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(callback::CallbackState { outcome: tx })
}

/// Serve the callback path on `listener` until the first redirect arrives
/// and return its authorization code.
///
/// # Errors
///
/// `OAuthCallback` when the provider reported an error, the code is missing,
/// or the server stopped before any redirect arrived.
pub async fn await_callback(listener: TcpListener) -> Result<String, AuthError> {
    let (tx, mut rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, path = CALLBACK_PATH, "waiting for oauth redirect");
    }
    let server = tokio::spawn(async move {
        axum::serve(listener, router(tx))
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let outcome = rx.recv().await;
    let _ = stop_tx.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "callback server failed"),
        Err(e) => warn!(error = %e, "callback server task failed"),
    }

    match outcome {
        Some(CallbackOutcome::Code(code)) => Ok(code),
        Some(CallbackOutcome::Denied { error, description }) => {
            warn!(%error, description = ?description, "oauth provider returned an error");
            Err(AuthError::OAuthCallback(CALLBACK_ERROR.to_owned()))
        }
        None => Err(AuthError::OAuthCallback(CALLBACK_ERROR.to_owned())),
    }
}
