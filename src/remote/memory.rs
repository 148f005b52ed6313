//! In-process auth service and row store for tests.
//!
//! Mirrors the remote contract closely enough to exercise the profile layer
//! and auth state manager: uniqueness is enforced with the same constraint
//! names the migrations create, and every write is counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Notify;
use uuid::Uuid;

use super::{
    AuthClient, PostStore, ProfileStore, RemoteError, SessionBus, SessionEvent, SessionEventKind,
    SessionSubscription,
};
use crate::model::{
    Event, Identity, NewEvent, NewProfile, NewProject, ProfilePatch, ProjectPost, Provider, Session, UserProfile,
};

pub const PROFILE_PKEY: &str = "user_profiles_pkey";
pub const USERNAME_KEY: &str = "user_profiles_username_key";

#[must_use]
pub fn identity(email: &str) -> Identity {
    Identity { id: Uuid::new_v4(), email: email.to_owned(), provider: Provider::Email }
}

#[must_use]
pub fn session_for(identity: &Identity) -> Session {
    Session {
        access_token: format!("access-{}", identity.id),
        refresh_token: format!("refresh-{}", identity.id),
        expires_at: None,
        identity: identity.clone(),
    }
}

// =============================================================================
// AUTH
// =============================================================================

#[derive(Default)]
pub struct MemoryAuth {
    accounts: Mutex<HashMap<String, (String, Identity)>>,
    session: Mutex<Option<Session>>,
    bus: SessionBus,
    probe_gate: Mutex<Option<Arc<Notify>>>,
    probe_calls: AtomicUsize,
    sign_out_error: Mutex<Option<RemoteError>>,
}

impl MemoryAuth {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, email: &str, password: &str) -> Identity {
        let identity = identity(email);
        self.accounts
            .lock()
            .unwrap()
            .insert(email.to_owned(), (password.to_owned(), identity.clone()));
        identity
    }

    /// Set the session without emitting, as if restored from storage.
    pub fn restore(&self, identity: &Identity) {
        *self.session.lock().unwrap() = Some(session_for(identity));
    }

    /// Simulate an external sign-in notification.
    pub fn sign_in_as(&self, identity: &Identity) {
        let session = session_for(identity);
        *self.session.lock().unwrap() = Some(session.clone());
        self.bus.emit(&SessionEvent::signed_in(session));
    }

    /// Simulate the service terminating the session (e.g. expiry elsewhere).
    pub fn expire_session(&self) {
        *self.session.lock().unwrap() = None;
        self.bus.emit(&SessionEvent { kind: SessionEventKind::TokenRefreshed, session: None });
    }

    /// Hold the next session probe until the returned gate is notified.
    /// The probe reads the session before waiting, so it may return stale data.
    pub fn hold_next_probe(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.probe_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn fail_next_sign_out(&self, err: RemoteError) {
        *self.sign_out_error.lock().unwrap() = Some(err);
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }
}

#[async_trait]
impl AuthClient for MemoryAuth {
    async fn current_session(&self) -> Result<Option<Session>, RemoteError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.session.lock().unwrap().clone();
        let gate = self.probe_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(snapshot)
    }

    fn subscribe(&self) -> SessionSubscription {
        self.bus.subscribe()
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, RemoteError> {
        let found = self.accounts.lock().unwrap().get(email).cloned();
        match found {
            Some((expected, identity)) if expected == password => {
                self.sign_in_as(&identity);
                Ok(session_for(&identity))
            }
            _ => Err(RemoteError::InvalidCredentials),
        }
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>, RemoteError> {
        let identity = self.register(email, password);
        self.sign_in_as(&identity);
        Ok(Some(session_for(&identity)))
    }

    fn oauth_authorize_url(
        &self,
        provider: Provider,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<String, RemoteError> {
        Ok(format!(
            "memory://authorize?provider={}&redirect_to={redirect_to}&code_challenge={code_challenge}",
            provider.as_str()
        ))
    }

    async fn exchange_code_for_session(&self, code: &str, _code_verifier: &str) -> Result<Session, RemoteError> {
        let identity = Identity { id: Uuid::new_v4(), email: format!("{code}@discord.test"), provider: Provider::Discord };
        self.sign_in_as(&identity);
        Ok(session_for(&identity))
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        let had_session = self.session.lock().unwrap().take().is_some();
        if had_session {
            self.bus.emit(&SessionEvent::signed_out());
        }
        match self.sign_out_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Default)]
pub struct MemoryStore {
    profiles: Mutex<Vec<UserProfile>>,
    events: Mutex<Vec<Event>>,
    projects: Mutex<Vec<ProjectPost>>,
    clock: AtomicI64,
    writes: AtomicUsize,
    inserts: AtomicUsize,
    fail_selects: Mutex<Option<RemoteError>>,
    fail_next_insert: Mutex<Option<RemoteError>>,
    racing_insert: Mutex<Option<NewProfile>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Strictly increasing timestamps so ordering is deterministic.
    fn tick(&self) -> OffsetDateTime {
        let n = self.clock.fetch_add(1, Ordering::SeqCst);
        OffsetDateTime::UNIX_EPOCH + Duration::days(19_000) + Duration::seconds(n)
    }

    fn insert_row(&self, row: &NewProfile) -> Result<UserProfile, RemoteError> {
        let mut profiles = self.profiles.lock().unwrap();
        if profiles.iter().any(|p| p.id == row.id) {
            return Err(RemoteError::UniqueViolation { constraint: PROFILE_PKEY.to_owned() });
        }
        if let Some(name) = &row.username {
            if profiles.iter().any(|p| p.username.as_deref() == Some(name)) {
                return Err(RemoteError::UniqueViolation { constraint: USERNAME_KEY.to_owned() });
            }
        }
        let now = self.tick();
        let profile = UserProfile {
            id: row.id,
            username: row.username.clone(),
            icon_url: row.icon_url.clone(),
            profile_message: row.profile_message.clone(),
            created_at: now,
            updated_at: now,
        };
        profiles.push(profile.clone());
        Ok(profile)
    }

    /// Seed a row directly, bypassing write counters.
    pub fn seed_profile(&self, id: Uuid, username: &str) -> UserProfile {
        let row = NewProfile { id, username: Some(username.to_owned()), icon_url: None, profile_message: None };
        self.insert_row(&row).unwrap()
    }

    pub fn profile_rows(&self) -> Vec<UserProfile> {
        self.profiles.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn fail_selects(&self, err: Option<RemoteError>) {
        *self.fail_selects.lock().unwrap() = err;
    }

    pub fn fail_next_insert(&self, err: RemoteError) {
        *self.fail_next_insert.lock().unwrap() = Some(err);
    }

    /// On the next profile insert, land `row` first as if another tab won the race.
    pub fn race_next_insert_with(&self, row: NewProfile) {
        *self.racing_insert.lock().unwrap() = Some(row);
    }

    fn check_selects(&self) -> Result<(), RemoteError> {
        match self.fail_selects.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn select_profile(&self, id: Uuid) -> Result<Option<UserProfile>, RemoteError> {
        self.check_selects()?;
        Ok(self.profiles.lock().unwrap().iter().find(|p| p.id == id).cloned())
    }

    async fn select_profile_by_username(
        &self,
        username: &str,
        excluding: Option<Uuid>,
    ) -> Result<Option<UserProfile>, RemoteError> {
        self.check_selects()?;
        Ok(self
            .profiles
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.username.as_deref() == Some(username) && Some(p.id) != excluding)
            .cloned())
    }

    async fn insert_profile(&self, row: &NewProfile) -> Result<UserProfile, RemoteError> {
        if let Some(err) = self.fail_next_insert.lock().unwrap().take() {
            return Err(err);
        }
        let racing = self.racing_insert.lock().unwrap().take();
        if let Some(racing) = racing {
            self.insert_row(&racing)?;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let inserted = self.insert_row(row)?;
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(inserted)
    }

    async fn update_profile(&self, id: Uuid, patch: &ProfilePatch) -> Result<Option<UserProfile>, RemoteError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let now = self.tick();
        let mut profiles = self.profiles.lock().unwrap();
        if let Some(Some(name)) = &patch.username {
            if profiles.iter().any(|p| p.id != id && p.username.as_deref() == Some(name)) {
                return Err(RemoteError::UniqueViolation { constraint: USERNAME_KEY.to_owned() });
            }
        }
        let Some(row) = profiles.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };
        patch.apply_to(row);
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn recent_profiles(&self, limit: u32) -> Result<Vec<UserProfile>, RemoteError> {
        self.check_selects()?;
        let mut rows = self.profiles.lock().unwrap().clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}

#[async_trait]
impl PostStore for MemoryStore {
    async fn insert_event(&self, event: &NewEvent) -> Result<Event, RemoteError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let row = Event {
            id: Uuid::new_v4(),
            title: event.title.clone(),
            description: event.description.clone(),
            event_date: event.event_date,
            start_time: event.start_time,
            is_online: event.is_online,
            online_url: event.online_url.clone(),
            location: event.location.clone(),
            max_participants: event.max_participants,
            tags: event.tags.clone(),
            created_by: event.created_by,
            created_at: self.tick(),
        };
        self.events.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn list_events(&self, limit: u32) -> Result<Vec<Event>, RemoteError> {
        let mut rows = self.events.lock().unwrap().clone();
        rows.sort_by(|a, b| (a.event_date, a.start_time).cmp(&(b.event_date, b.start_time)));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn insert_project(&self, project: &NewProject) -> Result<ProjectPost, RemoteError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let now = self.tick();
        let row = ProjectPost {
            id: Uuid::new_v4(),
            title: project.title.clone(),
            description: project.description.clone(),
            content: project.content.clone(),
            tags: project.tags.clone(),
            progress: project.progress,
            status: project.status,
            is_public: project.is_public,
            author_id: project.author_id,
            created_at: now,
            updated_at: now,
        };
        self.projects.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn list_projects(&self, limit: u32) -> Result<Vec<ProjectPost>, RemoteError> {
        let mut rows: Vec<ProjectPost> = self
            .projects
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.is_public)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}
