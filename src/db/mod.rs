//! Direct PostgreSQL store.
//!
//! SYSTEM CONTEXT
//! ==============
//! Alternative to the PostgREST row store for self-hosted deployments and
//! local development. Implements the same `ProfileStore` / `PostStore` seams
//! against the tables created by `src/db/migrations`, so the profile layer
//! and post service are unaware which backend is in use.
//!
//! ERROR HANDLING
//! ==============
//! Unique violations keep their constraint name so the profile layer can tell
//! a primary-key race from a username collision. Everything else collapses
//! into `RemoteError::Transport`.

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::model::{Event, NewEvent, NewProfile, NewProject, ProfilePatch, ProjectPost, ProjectStatus, UserProfile};
use crate::remote::{PostStore, ProfileStore, RemoteError};

const PROFILE_COLUMNS: &str = "id, username, icon_url, profile_message, created_at, updated_at";
const EVENT_COLUMNS: &str = "id, title, description, event_date, start_time, is_online, online_url, location, \
                             max_participants, tags, created_by, created_at";
const PROJECT_COLUMNS: &str =
    "id, title, description, content, tags, progress, status, is_public, author_id, created_at, updated_at";

/// Initialize the PostgreSQL connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}

pub(crate) fn map_db_error(err: sqlx::Error) -> RemoteError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return RemoteError::UniqueViolation { constraint: db.constraint().unwrap_or_default().to_owned() };
        }
    }
    RemoteError::Transport(err.to_string())
}

fn profile_from_row(row: &PgRow) -> UserProfile {
    UserProfile {
        id: row.get("id"),
        username: row.get("username"),
        icon_url: row.get("icon_url"),
        profile_message: row.get("profile_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn event_from_row(row: &PgRow) -> Event {
    Event {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        event_date: row.get("event_date"),
        start_time: row.get("start_time"),
        is_online: row.get("is_online"),
        online_url: row.get("online_url"),
        location: row.get("location"),
        max_participants: row.get("max_participants"),
        tags: row.get("tags"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
    }
}

fn project_from_row(row: &PgRow) -> Result<ProjectPost, RemoteError> {
    let progress: i16 = row.get("progress");
    let status: String = row.get("status");
    Ok(ProjectPost {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        content: row.get("content"),
        tags: row.get("tags"),
        progress: u8::try_from(progress).map_err(|_| RemoteError::Decode(format!("progress {progress}")))?,
        status: ProjectStatus::parse(&status).ok_or_else(|| RemoteError::Decode(format!("status {status:?}")))?,
        is_public: row.get("is_public"),
        author_id: row.get("author_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Row store backed by a `PgPool`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn select_profile(&self, id: Uuid) -> Result<Option<UserProfile>, RemoteError> {
        let row = sqlx::query(&format!("SELECT {PROFILE_COLUMNS} FROM user_profiles WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(row.as_ref().map(profile_from_row))
    }

    async fn select_profile_by_username(
        &self,
        username: &str,
        excluding: Option<Uuid>,
    ) -> Result<Option<UserProfile>, RemoteError> {
        let row = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS} FROM user_profiles
             WHERE username = $1 AND ($2::uuid IS NULL OR id <> $2)
             LIMIT 1"
        ))
        .bind(username)
        .bind(excluding)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(row.as_ref().map(profile_from_row))
    }

    async fn insert_profile(&self, row: &NewProfile) -> Result<UserProfile, RemoteError> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO user_profiles (id, username, icon_url, profile_message)
             VALUES ($1, $2, $3, $4)
             RETURNING {PROFILE_COLUMNS}"
        ))
        .bind(row.id)
        .bind(&row.username)
        .bind(&row.icon_url)
        .bind(&row.profile_message)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(profile_from_row(&inserted))
    }

    async fn update_profile(&self, id: Uuid, patch: &ProfilePatch) -> Result<Option<UserProfile>, RemoteError> {
        let row = sqlx::query(&format!(
            "UPDATE user_profiles SET
                 username = CASE WHEN $2 THEN $3 ELSE username END,
                 icon_url = CASE WHEN $4 THEN $5 ELSE icon_url END,
                 profile_message = CASE WHEN $6 THEN $7 ELSE profile_message END,
                 updated_at = now()
             WHERE id = $1
             RETURNING {PROFILE_COLUMNS}"
        ))
        .bind(id)
        .bind(patch.username.is_some())
        .bind(patch.username.clone().flatten())
        .bind(patch.icon_url.is_some())
        .bind(patch.icon_url.clone().flatten())
        .bind(patch.profile_message.is_some())
        .bind(patch.profile_message.clone().flatten())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(row.as_ref().map(profile_from_row))
    }

    async fn recent_profiles(&self, limit: u32) -> Result<Vec<UserProfile>, RemoteError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS} FROM user_profiles ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(rows.iter().map(profile_from_row).collect())
    }
}

#[async_trait]
impl PostStore for PgStore {
    async fn insert_event(&self, event: &NewEvent) -> Result<Event, RemoteError> {
        let row = sqlx::query(&format!(
            "INSERT INTO events (title, description, event_date, start_time, is_online, online_url,
                                 location, max_participants, tags, created_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {EVENT_COLUMNS}"
        ))
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.event_date)
        .bind(event.start_time)
        .bind(event.is_online)
        .bind(&event.online_url)
        .bind(&event.location)
        .bind(event.max_participants)
        .bind(&event.tags)
        .bind(event.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(event_from_row(&row))
    }

    async fn list_events(&self, limit: u32) -> Result<Vec<Event>, RemoteError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY event_date ASC, start_time ASC LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(rows.iter().map(event_from_row).collect())
    }

    async fn insert_project(&self, project: &NewProject) -> Result<ProjectPost, RemoteError> {
        let row = sqlx::query(&format!(
            "INSERT INTO project_posts (title, description, content, tags, progress, status, is_public, author_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(&project.title)
        .bind(&project.description)
        .bind(&project.content)
        .bind(&project.tags)
        .bind(i16::from(project.progress))
        .bind(project.status.as_str())
        .bind(project.is_public)
        .bind(project.author_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        project_from_row(&row)
    }

    async fn list_projects(&self, limit: u32) -> Result<Vec<ProjectPost>, RemoteError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM project_posts WHERE is_public ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(project_from_row).collect()
    }
}
