//! Supabase client: GoTrue auth (`/auth/v1`) and PostgREST rows (`/rest/v1`).
//!
//! DESIGN
//! ======
//! One client implements `AuthClient`, `ProfileStore`, and `PostStore` because
//! row requests must carry the signed-in user's access token for row-level
//! security. The session lives in memory and is optionally mirrored to a JSON
//! file so the CLI survives restarts.
//!
//! ERROR HANDLING
//! ==============
//! Error bodies come in three shapes (PostgREST `{code,message}`, legacy GoTrue
//! `{error,error_description}`, current GoTrue `{error_code,msg}`). They are
//! folded into `RemoteError` by `decode_error`; SQLSTATE `23505` becomes
//! `UniqueViolation` carrying the constraint name.

#[cfg(test)]
#[path = "supabase_test.rs"]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AuthClient, PostStore, ProfileStore, RemoteError, SessionBus, SessionEvent, SessionEventKind,
    SessionSubscription, UNIQUE_VIOLATION_CODE,
};
use crate::config::SupabaseConfig;
use crate::model::{
    Event, Identity, NewEvent, NewProfile, NewProject, ProfilePatch, ProjectPost, Provider, Session, UserProfile,
};

pub const PROFILE_TABLE: &str = "user_profiles";
pub const EVENT_TABLE: &str = "events";
pub const PROJECT_TABLE: &str = "project_posts";

/// Access tokens expiring within this window are refreshed before use.
const REFRESH_SKEW_SECS: i64 = 60;

/// GoTrue error codes that mean the session is gone for good.
const SESSION_ENDING_CODES: &[&str] =
    &["bad_jwt", "session_not_found", "session_expired", "refresh_token_not_found", "refresh_token_already_used"];

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_at: Option<i64>,
    expires_in: Option<i64>,
    user: GoTrueUser,
}

impl TokenResponse {
    fn into_session(self, now: i64) -> Session {
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_at.or(self.expires_in.map(|secs| now + secs)),
            identity: self.user.into_identity(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: Uuid,
    email: Option<String>,
    #[serde(default)]
    app_metadata: AppMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct AppMetadata {
    provider: Option<String>,
}

impl GoTrueUser {
    fn into_identity(self) -> Identity {
        Identity {
            id: self.id,
            email: self.email.unwrap_or_default(),
            provider: Provider::from_tag(self.app_metadata.provider.as_deref()),
        }
    }
}

#[derive(Serialize)]
struct PasswordCredentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<serde_json::Value>,
    error: Option<String>,
    error_code: Option<String>,
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

/// Classify a non-success response body.
pub(crate) fn decode_error(status: u16, body: &str) -> RemoteError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .clone()
        .or_else(|| parsed.msg.clone())
        .or_else(|| parsed.error_description.clone())
        .or_else(|| parsed.error.clone())
        .unwrap_or_else(|| body.trim().to_owned());

    if parsed.code.as_ref().and_then(serde_json::Value::as_str) == Some(UNIQUE_VIOLATION_CODE) {
        let constraint = constraint_name(&message).unwrap_or(message);
        return RemoteError::UniqueViolation { constraint };
    }

    if let Some(code) = parsed.error_code.as_deref() {
        if SESSION_ENDING_CODES.contains(&code) {
            return RemoteError::Unauthorized;
        }
        if code == "invalid_credentials" {
            return RemoteError::InvalidCredentials;
        }
    }
    if status == 400 && parsed.error.as_deref() == Some("invalid_grant") {
        return RemoteError::InvalidCredentials;
    }
    if status == 401 {
        return RemoteError::Unauthorized;
    }
    RemoteError::Status { status, message }
}

/// Extract `name` from `... violates unique constraint "name"`.
pub(crate) fn constraint_name(message: &str) -> Option<String> {
    let (_, rest) = message.split_once("constraint \"")?;
    let (name, _) = rest.split_once('"')?;
    Some(name.to_owned())
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// =============================================================================
// SESSION FILE
// =============================================================================

fn load_session(path: &Path) -> Option<Session> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(session) => Some(session),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable session file");
            None
        }
    }
}

fn persist_session(path: &Path, session: Option<&Session>) {
    let result = match session {
        Some(session) => serde_json::to_string(session)
            .map_err(std::io::Error::other)
            .and_then(|json| {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, json)
            }),
        None => match std::fs::remove_file(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "session file update failed");
    }
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct SupabaseClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    session_file: Option<PathBuf>,
    session: RwLock<Option<Session>>,
    bus: SessionBus,
}

impl SupabaseClient {
    /// Build the HTTP client and restore any persisted session.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: SupabaseConfig) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let restored = config.session_file.as_deref().and_then(load_session);
        if let Some(session) = &restored {
            debug!(user_id = %session.identity.id, "restored persisted session");
        }
        Ok(Self {
            http,
            base_url: config.url,
            anon_key: config.anon_key,
            session_file: config.session_file,
            session: RwLock::new(restored),
            bus: SessionBus::new(),
        })
    }

    #[must_use]
    pub fn bus(&self) -> &SessionBus {
        &self.bus
    }

    fn stored_session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap the local session, mirror it to disk, and notify subscribers.
    fn replace_session(&self, session: Option<Session>, kind: SessionEventKind) {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clone_from(&session);
        if let Some(path) = &self.session_file {
            persist_session(path, session.as_ref());
        }
        self.bus.emit(&SessionEvent { kind, session });
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.base_url)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    /// Every request carries the anon key; the bearer is the user's access
    /// token when signed in, the anon key otherwise.
    fn request(&self, method: Method, url: &str, bearer: Option<&str>) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .header(AUTHORIZATION, format!("Bearer {}", bearer.unwrap_or(&self.anon_key)))
    }

    async fn token_grant<B: Serialize + Sync>(&self, grant_type: &str, body: &B) -> Result<Session, RemoteError> {
        let url = self.auth_url("token");
        let resp: TokenResponse = send_json(
            self.request(Method::POST, &url, None)
                .query(&[("grant_type", grant_type)])
                .json(body),
        )
        .await?;
        Ok(resp.into_session(now_unix()))
    }

    async fn fetch_user(&self, access_token: &str) -> Result<Identity, RemoteError> {
        let url = self.auth_url("user");
        let user: GoTrueUser = send_json(self.request(Method::GET, &url, Some(access_token))).await?;
        Ok(user.into_identity())
    }

    fn bearer(&self) -> Option<String> {
        self.stored_session().map(|s| s.access_token)
    }

    async fn rest_select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, RemoteError> {
        let token = self.bearer();
        send_json(
            self.request(Method::GET, &self.rest_url(table), token.as_deref())
                .query(query),
        )
        .await
    }

    async fn rest_insert<B, T>(&self, table: &str, body: &B) -> Result<T, RemoteError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let token = self.bearer();
        let rows: Vec<T> = send_json(
            self.request(Method::POST, &self.rest_url(table), token.as_deref())
                .header("Prefer", "return=representation")
                .json(body),
        )
        .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RemoteError::Decode(format!("insert into {table} returned no rows")))
    }

    async fn rest_update<B, T>(&self, table: &str, query: &[(&str, String)], body: &B) -> Result<Vec<T>, RemoteError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let token = self.bearer();
        send_json(
            self.request(Method::PATCH, &self.rest_url(table), token.as_deref())
                .header("Prefer", "return=representation")
                .query(query)
                .json(body),
        )
        .await
    }
}

async fn send_raw(req: RequestBuilder) -> Result<String, RemoteError> {
    let resp = req
        .send()
        .await
        .map_err(|e| RemoteError::Transport(e.to_string()))?;
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| RemoteError::Transport(e.to_string()))?;
    if !status.is_success() {
        return Err(decode_error(status.as_u16(), &body));
    }
    Ok(body)
}

async fn send_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, RemoteError> {
    let body = send_raw(req).await?;
    serde_json::from_str(&body).map_err(|e| RemoteError::Decode(format!("{e}: {body}")))
}

// =============================================================================
// AUTH
// =============================================================================

#[async_trait]
impl AuthClient for SupabaseClient {
    async fn current_session(&self) -> Result<Option<Session>, RemoteError> {
        let Some(mut session) = self.stored_session() else {
            return Ok(None);
        };

        if session.expires_within(now_unix(), REFRESH_SKEW_SECS) {
            let body = serde_json::json!({ "refresh_token": session.refresh_token });
            match self.token_grant("refresh_token", &body).await {
                Ok(refreshed) => {
                    debug!(user_id = %refreshed.identity.id, "access token refreshed");
                    self.replace_session(Some(refreshed.clone()), SessionEventKind::TokenRefreshed);
                    session = refreshed;
                }
                Err(e) if e.ends_session() => {
                    info!(error = %e, "refresh rejected; clearing session");
                    self.replace_session(None, SessionEventKind::TokenRefreshed);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        match self.fetch_user(&session.access_token).await {
            Ok(identity) => Ok(Some(Session { identity, ..session })),
            Err(e) if e.ends_session() => {
                info!(error = %e, "access token rejected; clearing session");
                self.replace_session(None, SessionEventKind::SignedOut);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn subscribe(&self) -> SessionSubscription {
        self.bus.subscribe()
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, RemoteError> {
        let session = self
            .token_grant("password", &PasswordCredentials { email, password })
            .await?;
        info!(user_id = %session.identity.id, "signed in with password");
        self.replace_session(Some(session.clone()), SessionEventKind::SignedIn);
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>, RemoteError> {
        let url = self.auth_url("signup");
        let body = send_raw(
            self.request(Method::POST, &url, None)
                .json(&PasswordCredentials { email, password }),
        )
        .await?;

        // With email confirmation enabled the service returns a bare user.
        let Ok(token) = serde_json::from_str::<TokenResponse>(&body) else {
            info!(%email, "sign-up pending email confirmation");
            return Ok(None);
        };
        let session = token.into_session(now_unix());
        info!(user_id = %session.identity.id, "signed up");
        self.replace_session(Some(session.clone()), SessionEventKind::SignedIn);
        Ok(Some(session))
    }

    fn oauth_authorize_url(
        &self,
        provider: Provider,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<String, RemoteError> {
        let url = Url::parse_with_params(
            &self.auth_url("authorize"),
            &[
                ("provider", provider.as_str()),
                ("redirect_to", redirect_to),
                ("code_challenge", code_challenge),
                ("code_challenge_method", "s256"),
            ],
        )
        .map_err(|e| RemoteError::Decode(format!("authorize url: {e}")))?;
        Ok(url.into())
    }

    async fn exchange_code_for_session(&self, code: &str, code_verifier: &str) -> Result<Session, RemoteError> {
        let body = serde_json::json!({ "auth_code": code, "code_verifier": code_verifier });
        let session = self.token_grant("pkce", &body).await?;
        info!(user_id = %session.identity.id, provider = session.identity.provider.as_str(), "oauth sign-in complete");
        self.replace_session(Some(session.clone()), SessionEventKind::SignedIn);
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        let Some(session) = self.stored_session() else {
            return Ok(());
        };
        let url = self.auth_url("logout");
        let result = send_raw(self.request(Method::POST, &url, Some(&session.access_token))).await;
        self.replace_session(None, SessionEventKind::SignedOut);
        match result {
            Ok(_) => Ok(()),
            // Already invalid remotely; the local session is gone either way.
            Err(e) if e.ends_session() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// ROWS
// =============================================================================

#[async_trait]
impl ProfileStore for SupabaseClient {
    async fn select_profile(&self, id: Uuid) -> Result<Option<UserProfile>, RemoteError> {
        let rows: Vec<UserProfile> = self
            .rest_select(PROFILE_TABLE, &[("select", "*".to_owned()), ("id", format!("eq.{id}"))])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn select_profile_by_username(
        &self,
        username: &str,
        excluding: Option<Uuid>,
    ) -> Result<Option<UserProfile>, RemoteError> {
        let mut query = vec![
            ("select", "*".to_owned()),
            ("username", format!("eq.{username}")),
            ("limit", "1".to_owned()),
        ];
        if let Some(id) = excluding {
            query.push(("id", format!("neq.{id}")));
        }
        let rows: Vec<UserProfile> = self.rest_select(PROFILE_TABLE, &query).await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_profile(&self, row: &NewProfile) -> Result<UserProfile, RemoteError> {
        self.rest_insert(PROFILE_TABLE, row).await
    }

    async fn update_profile(&self, id: Uuid, patch: &ProfilePatch) -> Result<Option<UserProfile>, RemoteError> {
        let rows: Vec<UserProfile> = self
            .rest_update(PROFILE_TABLE, &[("id", format!("eq.{id}"))], patch)
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn recent_profiles(&self, limit: u32) -> Result<Vec<UserProfile>, RemoteError> {
        self.rest_select(
            PROFILE_TABLE,
            &[
                ("select", "*".to_owned()),
                ("order", "created_at.desc".to_owned()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }
}

#[async_trait]
impl PostStore for SupabaseClient {
    async fn insert_event(&self, event: &NewEvent) -> Result<Event, RemoteError> {
        self.rest_insert(EVENT_TABLE, event).await
    }

    async fn list_events(&self, limit: u32) -> Result<Vec<Event>, RemoteError> {
        self.rest_select(
            EVENT_TABLE,
            &[
                ("select", "*".to_owned()),
                ("order", "event_date.asc,start_time.asc".to_owned()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn insert_project(&self, project: &NewProject) -> Result<ProjectPost, RemoteError> {
        self.rest_insert(PROJECT_TABLE, project).await
    }

    async fn list_projects(&self, limit: u32) -> Result<Vec<ProjectPost>, RemoteError> {
        self.rest_select(
            PROJECT_TABLE,
            &[
                ("select", "*".to_owned()),
                ("is_public", "eq.true".to_owned()),
                ("order", "created_at.desc".to_owned()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }
}
