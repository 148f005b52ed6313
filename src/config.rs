//! Runtime configuration parsed from environment variables.
//!
//! `main` loads `.env` via `dotenvy` before calling [`AppConfig::from_env`].

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

use std::path::PathBuf;

pub const DEFAULT_CALLBACK_PORT: u16 = 54321;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required env var {var}")]
    Missing { var: &'static str },
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

impl crate::error::ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Missing { .. } => "E_CONFIG_MISSING",
            Self::Invalid { .. } => "E_CONFIG_INVALID",
        }
    }

    fn user_message(&self) -> String {
        format!("Configuration error: {self}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self { request_secs: DEFAULT_REQUEST_TIMEOUT_SECS, connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS }
    }
}

/// Connection settings for the hosted auth + REST service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupabaseConfig {
    /// Project base URL without trailing slash, e.g. `https://xyz.supabase.co`.
    pub url: String,
    pub anon_key: String,
    /// Where the current session is persisted between runs. `None` keeps it in memory only.
    pub session_file: Option<PathBuf>,
    pub timeouts: HttpTimeouts,
}

/// Which row store backs profiles and posts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// PostgREST on the same project as the auth service.
    Supabase,
    /// Direct Postgres connection.
    Postgres { database_url: String, max_connections: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub supabase: SupabaseConfig,
    pub store: StoreBackend,
    /// Loopback port for the OAuth callback listener.
    pub callback_port: u16,
}

impl AppConfig {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `SUPABASE_URL`
    /// - `SUPABASE_ANON_KEY`
    ///
    /// Optional:
    /// - `DEVELOOP_STORE`: `supabase` (default) or `postgres`
    /// - `DATABASE_URL`: required when the store is `postgres`
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - `DEVELOOP_SESSION_FILE`: path of the persisted session
    /// - `DEVELOOP_CALLBACK_PORT`: default 54321
    /// - `DEVELOOP_REQUEST_TIMEOUT_SECS`: default 30
    /// - `DEVELOOP_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = required("SUPABASE_URL")?;
        let anon_key = required("SUPABASE_ANON_KEY")?;
        let supabase = SupabaseConfig {
            url: normalize_base_url(&url).ok_or(ConfigError::Invalid { var: "SUPABASE_URL", value: url.clone() })?,
            anon_key,
            session_file: std::env::var("DEVELOOP_SESSION_FILE").ok().map(PathBuf::from),
            timeouts: HttpTimeouts {
                request_secs: env_parse("DEVELOOP_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
                connect_secs: env_parse("DEVELOOP_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
            },
        };

        let store = parse_store_backend(
            std::env::var("DEVELOOP_STORE").ok().as_deref(),
            std::env::var("DATABASE_URL").ok(),
            env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
        )?;

        Ok(Self { supabase, store, callback_port: env_parse("DEVELOOP_CALLBACK_PORT", DEFAULT_CALLBACK_PORT) })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing { var })
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Trim whitespace and trailing slashes; reject anything that is not http(s).
pub(crate) fn normalize_base_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        Some(trimmed.to_owned())
    } else {
        None
    }
}

pub(crate) fn parse_store_backend(
    raw: Option<&str>,
    database_url: Option<String>,
    max_connections: u32,
) -> Result<StoreBackend, ConfigError> {
    match raw.map(str::trim).unwrap_or("supabase") {
        "supabase" => Ok(StoreBackend::Supabase),
        "postgres" => {
            let database_url = database_url
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing { var: "DATABASE_URL" })?;
            Ok(StoreBackend::Postgres { database_url, max_connections })
        }
        other => Err(ConfigError::Invalid { var: "DEVELOOP_STORE", value: other.to_owned() }),
    }
}
