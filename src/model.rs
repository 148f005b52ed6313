//! Domain types shared by the remote clients, services, and auth state.
//!
//! SYSTEM CONTEXT
//! ==============
//! `Identity` and `Session` are owned by the auth service and only ever read
//! here. `UserProfile`, `Event`, and `ProjectPost` mirror rows in the store.

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, Time};
use uuid::Uuid;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");
time::serde::format_description!(clock_time, Time, "[hour]:[minute]:[second]");

// =============================================================================
// IDENTITY & SESSION
// =============================================================================

/// Sign-in method recorded by the auth service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Email,
    Discord,
}

impl Provider {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Discord => "discord",
        }
    }

    /// Map the auth service's `app_metadata.provider` tag. Unknown tags are
    /// treated as email accounts.
    #[must_use]
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag {
            Some("discord") => Self::Discord,
            _ => Self::Email,
        }
    }
}

/// An authenticated principal issued by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub provider: Provider,
}

impl Identity {
    #[must_use]
    pub fn default_username(&self) -> String {
        default_username(&self.email)
    }
}

/// A live credential acting as one `Identity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds. `None` when the service did not report an expiry.
    pub expires_at: Option<i64>,
    pub identity: Identity,
}

impl Session {
    /// True when the access token expires within `skew_secs` of `now`.
    #[must_use]
    pub fn expires_within(&self, now: i64, skew_secs: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp - now <= skew_secs)
    }
}

/// Local part of an email address, used as the initial username.
#[must_use]
pub fn default_username(email: &str) -> String {
    email.split_once('@').map_or(email, |(local, _)| local).to_owned()
}

// =============================================================================
// USER PROFILE
// =============================================================================

/// Application-owned profile row, keyed 1:1 by the identity id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: Option<String>,
    pub icon_url: Option<String>,
    pub profile_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Partial profile update.
///
/// Outer `None` leaves the column untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_message: Option<Option<String>>,
}

impl ProfilePatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.icon_url.is_none() && self.profile_message.is_none()
    }

    /// True when applying the patch would change at least one column of `row`.
    #[must_use]
    pub fn changes(&self, row: &UserProfile) -> bool {
        fn differs(field: Option<&Option<String>>, current: &Option<String>) -> bool {
            field.is_some_and(|v| v != current)
        }
        differs(self.username.as_ref(), &row.username)
            || differs(self.icon_url.as_ref(), &row.icon_url)
            || differs(self.profile_message.as_ref(), &row.profile_message)
    }

    /// Apply to an in-memory row. Used by stores that hold rows locally.
    pub fn apply_to(&self, row: &mut UserProfile) {
        if let Some(v) = &self.username {
            row.username.clone_from(v);
        }
        if let Some(v) = &self.icon_url {
            row.icon_url.clone_from(v);
        }
        if let Some(v) = &self.profile_message {
            row.profile_message.clone_from(v);
        }
    }
}

/// Insert payload for a profile row. Timestamps come from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewProfile {
    pub id: Uuid,
    pub username: Option<String>,
    pub icon_url: Option<String>,
    pub profile_message: Option<String>,
}

impl NewProfile {
    /// Merge `patch` over the defaults for `identity`. A missing or null
    /// username falls back to the email local part.
    #[must_use]
    pub fn for_identity(identity: &Identity, patch: &ProfilePatch) -> Self {
        let username = patch
            .username
            .clone()
            .flatten()
            .unwrap_or_else(|| identity.default_username());
        Self {
            id: identity.id,
            username: Some(username),
            icon_url: patch.icon_url.clone().flatten(),
            profile_message: patch.profile_message.clone().flatten(),
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Validated event ready for insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewEvent {
    pub title: String,
    pub description: String,
    #[serde(with = "iso_date")]
    pub event_date: Date,
    #[serde(with = "clock_time")]
    pub start_time: Time,
    pub is_online: bool,
    pub online_url: Option<String>,
    pub location: Option<String>,
    pub max_participants: Option<i32>,
    pub tags: Vec<String>,
    pub created_by: Uuid,
}

/// Club event row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    #[serde(with = "iso_date")]
    pub event_date: Date,
    #[serde(with = "clock_time")]
    pub start_time: Time,
    pub is_online: bool,
    pub online_url: Option<String>,
    pub location: Option<String>,
    pub max_participants: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_by: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Whether an event is still ahead of a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Upcoming,
    Completed,
}

impl Event {
    /// Events held today still count as upcoming.
    #[must_use]
    pub fn status(&self, today: Date) -> EventStatus {
        if self.event_date < today { EventStatus::Completed } else { EventStatus::Upcoming }
    }
}

// =============================================================================
// PROJECT POSTS
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectStatus {
    #[default]
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "planning")]
    Planning,
}

impl ProjectStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Planning => "planning",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "in-progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "planning" => Some(Self::Planning),
            _ => None,
        }
    }
}

/// Validated project-progress post ready for insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewProject {
    pub title: String,
    pub description: String,
    pub content: String,
    pub tags: Vec<String>,
    pub progress: u8,
    pub status: ProjectStatus,
    pub is_public: bool,
    pub author_id: Uuid,
}

/// Project-progress post row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPost {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub progress: u8,
    pub status: ProjectStatus,
    pub is_public: bool,
    pub author_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
