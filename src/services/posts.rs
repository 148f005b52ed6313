//! Club events and project-progress posts.
//!
//! DESIGN
//! ======
//! Forms arrive as raw strings (CLI flags, form fields) and are validated
//! into typed insert payloads before any request is made. Creation requires
//! a signed-in identity, which is stamped as the author. Listing and the
//! status/search filters work the same way for both kinds of post.

#[cfg(test)]
#[path = "posts_test.rs"]
mod tests;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, Time};
use tracing::info;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::model::{Event, EventStatus, NewEvent, NewProject, ProjectPost, ProjectStatus};
use crate::remote::{AuthClient, PostStore, RemoteError};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormError {
    #[error("{field} is required")]
    MissingField { field: &'static str },
    #[error("invalid date {value:?}; expected YYYY-MM-DD")]
    InvalidDate { value: String },
    #[error("invalid time {value:?}; expected HH:MM")]
    InvalidTime { value: String },
    #[error("{field} must be a positive whole number, got {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("progress must be between 0 and 100, got {value:?}")]
    ProgressOutOfRange { value: String },
    #[error("online events need an online URL")]
    MissingOnlineUrl,
    #[error("unknown project status {value:?}")]
    UnknownStatus { value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PostError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error(transparent)]
    Invalid(#[from] FormError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl ErrorCode for PostError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotAuthenticated => "E_NOT_AUTHENTICATED",
            Self::Invalid(_) => "E_INVALID_FORM",
            Self::Remote(e) => e.error_code(),
        }
    }

    fn user_message(&self) -> String {
        match self {
            Self::NotAuthenticated => "Please sign in to continue.".to_owned(),
            Self::Invalid(e) => e.to_string(),
            Self::Remote(e) => e.user_message(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Remote(e) if e.retryable())
    }
}

// =============================================================================
// FORMS
// =============================================================================

/// Split a comma-separated tag field. Blank entries and duplicates are dropped;
/// first occurrence order is kept.
#[must_use]
pub fn parse_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_owned());
        }
    }
    tags
}

fn required(field: &'static str, value: &str) -> Result<String, FormError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(FormError::MissingField { field });
    }
    Ok(value.to_owned())
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_owned())
}

fn parse_date(raw: &str) -> Result<Date, FormError> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|_| FormError::InvalidDate { value: raw.to_owned() })
}

fn parse_time(raw: &str) -> Result<Time, FormError> {
    let raw_trim = raw.trim();
    Time::parse(raw_trim, format_description!("[hour]:[minute]"))
        .or_else(|_| Time::parse(raw_trim, format_description!("[hour]:[minute]:[second]")))
        .map_err(|_| FormError::InvalidTime { value: raw.to_owned() })
}

/// Event creation form, one field per input.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventForm {
    pub title: String,
    pub description: String,
    /// `YYYY-MM-DD`.
    pub date: String,
    /// `HH:MM`.
    pub time: String,
    pub is_online: bool,
    pub online_url: String,
    pub location: String,
    pub max_participants: String,
    /// Comma-separated.
    pub tags: String,
}

impl EventForm {
    /// # Errors
    ///
    /// The first invalid field.
    pub fn validate(&self, author: Uuid) -> Result<NewEvent, FormError> {
        let title = required("title", &self.title)?;
        let description = required("description", &self.description)?;
        let event_date = parse_date(&self.date)?;
        let start_time = parse_time(&self.time)?;

        let max_participants = match optional(&self.max_participants) {
            None => None,
            Some(raw) => match raw.parse::<i32>() {
                Ok(n) if n >= 1 => Some(n),
                _ => {
                    return Err(FormError::InvalidNumber { field: "max_participants", value: raw });
                }
            },
        };

        let (online_url, location) = if self.is_online {
            (Some(optional(&self.online_url).ok_or(FormError::MissingOnlineUrl)?), None)
        } else {
            (None, optional(&self.location))
        };

        Ok(NewEvent {
            title,
            description,
            event_date,
            start_time,
            is_online: self.is_online,
            online_url,
            location,
            max_participants,
            tags: parse_tags(&self.tags),
            created_by: author,
        })
    }
}

/// Project-progress form.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectForm {
    pub title: String,
    pub description: String,
    /// Markdown body.
    pub content: String,
    pub tags: String,
    pub progress: String,
    /// `in-progress`, `completed`, or `planning`. Empty means `in-progress`.
    pub status: String,
    pub is_public: bool,
}

impl Default for ProjectForm {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            content: String::new(),
            tags: String::new(),
            progress: "0".to_owned(),
            status: ProjectStatus::default().as_str().to_owned(),
            is_public: true,
        }
    }
}

impl ProjectForm {
    /// # Errors
    ///
    /// The first invalid field.
    pub fn validate(&self, author: Uuid) -> Result<NewProject, FormError> {
        let title = required("title", &self.title)?;
        let description = required("description", &self.description)?;
        let content = required("content", &self.content)?;

        let raw_progress = self.progress.trim();
        let progress = match raw_progress.parse::<i64>() {
            Ok(p) => u8::try_from(p)
                .ok()
                .filter(|p| *p <= 100)
                .ok_or_else(|| FormError::ProgressOutOfRange { value: raw_progress.to_owned() })?,
            Err(_) => {
                return Err(FormError::InvalidNumber { field: "progress", value: raw_progress.to_owned() });
            }
        };

        let status = match optional(&self.status) {
            None => ProjectStatus::default(),
            Some(raw) => ProjectStatus::parse(&raw).ok_or(FormError::UnknownStatus { value: raw })?,
        };

        Ok(NewProject {
            title,
            description,
            content,
            tags: parse_tags(&self.tags),
            progress,
            status,
            is_public: self.is_public,
            author_id: author,
        })
    }
}

// =============================================================================
// FILTERS
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventFilter {
    #[default]
    All,
    Upcoming,
    Completed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProjectFilter {
    #[default]
    All,
    Status(ProjectStatus),
}

fn matches_query(query: &str, title: &str, description: &str, tags: &[String]) -> bool {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    title.to_lowercase().contains(&needle)
        || description.to_lowercase().contains(&needle)
        || tags.iter().any(|t| t.to_lowercase().contains(&needle))
}

/// Keep events matching `filter` (relative to `today`) whose title,
/// description, or tags contain `query`, case-insensitively.
#[must_use]
pub fn filter_events<'a>(events: &'a [Event], filter: EventFilter, query: &str, today: Date) -> Vec<&'a Event> {
    events
        .iter()
        .filter(|e| match filter {
            EventFilter::All => true,
            EventFilter::Upcoming => e.status(today) == EventStatus::Upcoming,
            EventFilter::Completed => e.status(today) == EventStatus::Completed,
        })
        .filter(|e| matches_query(query, &e.title, &e.description, &e.tags))
        .collect()
}

#[must_use]
pub fn filter_projects<'a>(projects: &'a [ProjectPost], filter: ProjectFilter, query: &str) -> Vec<&'a ProjectPost> {
    projects
        .iter()
        .filter(|p| match filter {
            ProjectFilter::All => true,
            ProjectFilter::Status(status) => p.status == status,
        })
        .filter(|p| matches_query(query, &p.title, &p.description, &p.tags))
        .collect()
}

/// Summary counts shown above the project list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProjectStats {
    pub total: usize,
    /// Progress at 100.
    pub completed: usize,
    /// Progress strictly between 0 and 100.
    pub in_progress: usize,
}

impl ProjectStats {
    #[must_use]
    pub fn from_posts(posts: &[ProjectPost]) -> Self {
        Self {
            total: posts.len(),
            completed: posts.iter().filter(|p| p.progress == 100).count(),
            in_progress: posts.iter().filter(|p| p.progress > 0 && p.progress < 100).count(),
        }
    }
}

// =============================================================================
// SERVICE
// =============================================================================

#[derive(Clone)]
pub struct PostService {
    auth: Arc<dyn AuthClient>,
    store: Arc<dyn PostStore>,
}

impl PostService {
    #[must_use]
    pub fn new(auth: Arc<dyn AuthClient>, store: Arc<dyn PostStore>) -> Self {
        Self { auth, store }
    }

    async fn author(&self) -> Result<Uuid, PostError> {
        self.auth
            .current_session()
            .await?
            .map(|s| s.identity.id)
            .ok_or(PostError::NotAuthenticated)
    }

    /// # Errors
    ///
    /// `NotAuthenticated`, `Invalid`, or the store failure.
    pub async fn create_event(&self, form: &EventForm) -> Result<Event, PostError> {
        let author = self.author().await?;
        let event = self.store.insert_event(&form.validate(author)?).await?;
        info!(event_id = %event.id, user_id = %author, "event created");
        Ok(event)
    }

    /// Up to `limit` events, soonest first.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn list_events(&self, limit: u32) -> Result<Vec<Event>, PostError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self.store.list_events(limit).await?)
    }

    /// # Errors
    ///
    /// `NotAuthenticated`, `Invalid`, or the store failure.
    pub async fn create_project(&self, form: &ProjectForm) -> Result<ProjectPost, PostError> {
        let author = self.author().await?;
        let post = self.store.insert_project(&form.validate(author)?).await?;
        info!(post_id = %post.id, user_id = %author, "project post created");
        Ok(post)
    }

    /// Up to `limit` public posts, newest first.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn list_projects(&self, limit: u32) -> Result<Vec<ProjectPost>, PostError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self.store.list_projects(limit).await?)
    }
}
