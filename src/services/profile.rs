//! Profile access layer: lazy provisioning and partial updates.
//!
//! DESIGN
//! ======
//! A profile row is materialized on first access after sign-in rather than at
//! account creation. Both entry points that may create a row (`get_profile`
//! for the caller's own id, and `update_profile` when no row exists yet)
//! funnel through `provision`, which treats a primary-key collision as
//! "another tab created it first" and re-reads the winner. The result is
//! always exactly one row per identity.
//!
//! TRADE-OFFS
//! ==========
//! `update_profile` is check-then-act across two requests. Concurrent updates
//! from the same identity in different tabs can lose an update; the store has
//! no single-request upsert for partial patches through this interface.

#[cfg(test)]
#[path = "profile_test.rs"]
mod tests;

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::model::{Identity, NewProfile, ProfilePatch, UserProfile};
use crate::remote::{AuthClient, ProfileStore, RemoteError};

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("profile {id} not found")]
    NotFound { id: Uuid },
    #[error("username {username:?} is already taken")]
    UsernameConflict { username: String },
    #[error("username cannot be empty")]
    InvalidUsername,
    #[error("profile create failed: {0}")]
    ProfileCreateFailed(#[source] RemoteError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl ErrorCode for ProfileError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotAuthenticated => "E_NOT_AUTHENTICATED",
            Self::NotFound { .. } => "E_PROFILE_NOT_FOUND",
            Self::UsernameConflict { .. } => "E_USERNAME_CONFLICT",
            Self::InvalidUsername => "E_INVALID_USERNAME",
            Self::ProfileCreateFailed(_) => "E_PROFILE_CREATE_FAILED",
            Self::Remote(e) => e.error_code(),
        }
    }

    fn user_message(&self) -> String {
        match self {
            Self::NotAuthenticated => "Please sign in to continue.".to_owned(),
            Self::NotFound { .. } => "That profile does not exist.".to_owned(),
            Self::UsernameConflict { username } => {
                format!("The username \"{username}\" is already taken. Please choose another one.")
            }
            Self::InvalidUsername => "Please choose a username.".to_owned(),
            Self::ProfileCreateFailed(_) => "Could not create your profile. Please try again.".to_owned(),
            Self::Remote(e) => e.user_message(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::ProfileCreateFailed(e) | Self::Remote(e) => e.retryable(),
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct ProfileService {
    auth: Arc<dyn AuthClient>,
    store: Arc<dyn ProfileStore>,
}

impl ProfileService {
    #[must_use]
    pub fn new(auth: Arc<dyn AuthClient>, store: Arc<dyn ProfileStore>) -> Self {
        Self { auth, store }
    }

    async fn current_identity(&self) -> Result<Option<Identity>, ProfileError> {
        Ok(self.auth.current_session().await?.map(|s| s.identity))
    }

    async fn require_identity(&self) -> Result<Identity, ProfileError> {
        self.current_identity()
            .await?
            .ok_or(ProfileError::NotAuthenticated)
    }

    /// Fetch a profile by id, or the caller's own when `id` is `None`.
    ///
    /// A missing row for the caller's own id is auto-provisioned; a missing
    /// row for anyone else is `NotFound`.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` when `id` is `None` and there is no session,
    /// `UsernameConflict` / `ProfileCreateFailed` from provisioning, or the
    /// underlying remote error.
    pub async fn get_profile(&self, id: Option<Uuid>) -> Result<UserProfile, ProfileError> {
        let me = self.current_identity().await?;
        let target = match (id, &me) {
            (Some(id), _) => id,
            (None, Some(me)) => me.id,
            (None, None) => return Err(ProfileError::NotAuthenticated),
        };

        if let Some(row) = self.store.select_profile(target).await? {
            return Ok(row);
        }
        match me {
            Some(me) if me.id == target => Ok(self.provision(&me, &ProfilePatch::default()).await?.0),
            _ => Err(ProfileError::NotFound { id: target }),
        }
    }

    /// Own-profile lookup for an identity already known to be signed in.
    /// Skips the session probe; used by the auth state manager.
    ///
    /// # Errors
    ///
    /// Same as the provisioning path of [`Self::get_profile`].
    pub async fn load_own_profile(&self, identity: &Identity) -> Result<UserProfile, ProfileError> {
        match self.store.select_profile(identity.id).await? {
            Some(row) => Ok(row),
            None => Ok(self.provision(identity, &ProfilePatch::default()).await?.0),
        }
    }

    /// Apply `patch` to the caller's own profile, creating the row if absent.
    ///
    /// An empty patch (or one matching the current row) issues no write.
    /// A null username is only accepted while the row does not exist yet,
    /// where it falls back to the default.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated`, `InvalidUsername` for a blank username (or a null
    /// one on an existing row), `UsernameConflict`, `ProfileCreateFailed` on
    /// the insert path, or the underlying remote error.
    pub async fn update_profile(&self, patch: &ProfilePatch) -> Result<UserProfile, ProfileError> {
        if matches!(&patch.username, Some(Some(name)) if name.trim().is_empty()) {
            return Err(ProfileError::InvalidUsername);
        }
        let me = self.require_identity().await?;

        let existing = match self.store.select_profile(me.id).await? {
            Some(row) => row,
            None => match self.provision(&me, patch).await? {
                (row, true) => return Ok(row),
                // Lost the insert race: another tab's row won, apply on top of it.
                (row, false) => row,
            },
        };

        if matches!(patch.username, Some(None)) {
            return Err(ProfileError::InvalidUsername);
        }

        if !patch.changes(&existing) {
            debug!(user_id = %me.id, "profile update is a no-op");
            return Ok(existing);
        }

        match self.store.update_profile(me.id, patch).await {
            Ok(Some(row)) => {
                info!(user_id = %me.id, "profile updated");
                Ok(row)
            }
            Ok(None) => Err(ProfileError::NotFound { id: me.id }),
            Err(e) if e.is_username_violation() => Err(ProfileError::UsernameConflict {
                username: patch.username.clone().flatten().unwrap_or_default(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `candidate` is free for the caller. The caller's own current
    /// username counts as available.
    ///
    /// # Errors
    ///
    /// Returns the underlying remote error.
    pub async fn check_username_availability(&self, candidate: &str) -> Result<bool, ProfileError> {
        let me = self.current_identity().await?.map(|i| i.id);
        let holder = self
            .store
            .select_profile_by_username(candidate, me)
            .await?;
        Ok(holder.is_none())
    }

    /// Up to `limit` profiles, newest first.
    ///
    /// # Errors
    ///
    /// Returns the underlying remote error.
    pub async fn get_public_profiles(&self, limit: u32) -> Result<Vec<UserProfile>, ProfileError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self.store.recent_profiles(limit).await?)
    }

    /// Insert the row for `identity`. The flag is false when a concurrent
    /// insert won and the returned row is the winner's.
    async fn provision(
        &self,
        identity: &Identity,
        patch: &ProfilePatch,
    ) -> Result<(UserProfile, bool), ProfileError> {
        let row = NewProfile::for_identity(identity, patch);
        match self.store.insert_profile(&row).await {
            Ok(created) => {
                info!(user_id = %identity.id, username = ?created.username, "profile auto-provisioned");
                Ok((created, true))
            }
            Err(e) if e.is_primary_key_violation() => {
                debug!(user_id = %identity.id, "profile created concurrently; re-reading");
                let winner = self
                    .store
                    .select_profile(identity.id)
                    .await?
                    .ok_or(ProfileError::ProfileCreateFailed(e))?;
                Ok((winner, false))
            }
            Err(e) if e.is_username_violation() => {
                Err(ProfileError::UsernameConflict { username: row.username.unwrap_or_default() })
            }
            Err(e) => Err(ProfileError::ProfileCreateFailed(e)),
        }
    }
}
