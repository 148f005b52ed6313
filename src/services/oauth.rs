//! OAuth sign-in with PKCE over a loopback redirect.
//!
//! DESIGN
//! ======
//! The verifier never leaves this process; only its SHA-256 challenge goes to
//! the authorize URL. The provider redirects the browser to a short-lived
//! loopback server (`routes::await_callback`), and the returned code is
//! exchanged together with the verifier for a session.

#[cfg(test)]
#[path = "oauth_test.rs"]
mod tests;

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::info;

use crate::guard::CALLBACK_PATH;
use crate::model::{Provider, Session};
use crate::remote::{AuthClient, RemoteError};
use crate::routes;
use crate::state::AuthError;

/// PKCE verifier and its S256 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// 32 random bytes, base64url without padding (43 characters).
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::rng().random();
        Self::from_verifier(Base64UrlUnpadded::encode_string(&bytes))
    }

    #[must_use]
    pub fn from_verifier(verifier: String) -> Self {
        let digest = Sha256::digest(verifier.as_bytes());
        let challenge = Base64UrlUnpadded::encode_string(&digest);
        Self { verifier, challenge }
    }
}

#[must_use]
pub fn callback_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}{CALLBACK_PATH}")
}

/// Run the full redirect flow: build the authorize URL, hand it to `open`,
/// wait for the redirect on `listener`, and exchange the code.
///
/// # Errors
///
/// `OAuthCallback` when the redirect carries an error, otherwise the remote
/// failure from building the URL or exchanging the code.
pub async fn sign_in_with_oauth(
    auth: &dyn AuthClient,
    provider: Provider,
    listener: TcpListener,
    open: impl FnOnce(&str),
) -> Result<Session, AuthError> {
    let port = listener
        .local_addr()
        .map_err(|e| RemoteError::Transport(e.to_string()))?
        .port();
    let pkce = PkcePair::generate();
    let authorize_url = auth.oauth_authorize_url(provider, &callback_url(port), &pkce.challenge)?;

    info!(provider = provider.as_str(), port, "starting oauth sign-in");
    open(&authorize_url);

    let code = routes::await_callback(listener).await?;
    let session = auth.exchange_code_for_session(&code, &pkce.verifier).await?;
    info!(user_id = %session.identity.id, provider = provider.as_str(), "oauth sign-in complete");
    Ok(session)
}
