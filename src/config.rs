//! Server configuration from environment variables

use crate::runtime::traits::{AvatarQuality, StartOptions};
use crate::state_machine::state::DEFAULT_GREETING;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_TOKEN_URL: &str = "http://127.0.0.1:3000/api/get-access-token";
pub const DEFAULT_LANGUAGE: &str = "nl";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid port: {0}")]
    InvalidPort(String),
    #[error("Invalid avatar quality: {0} (expected low, medium or high)")]
    InvalidQuality(String),
}

/// Settings shared by every console
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSettings {
    pub start_options: StartOptions,
    pub greeting: String,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            start_options: StartOptions::default(),
            greeting: DEFAULT_GREETING.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub token_url: String,
    pub console: ConsoleSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let db_path = get("AVATAR_SESSION_DB_PATH").map_or_else(
            || {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".avatar-session").join("sessions.db")
            },
            PathBuf::from,
        );

        let port = match get("AVATAR_SESSION_PORT") {
            Some(p) => p.parse().map_err(|_| ConfigError::InvalidPort(p))?,
            None => DEFAULT_PORT,
        };

        let quality = match get("AVATAR_QUALITY") {
            Some(q) => AvatarQuality::parse(&q).ok_or(ConfigError::InvalidQuality(q))?,
            None => AvatarQuality::High,
        };

        let start_options = StartOptions {
            quality,
            avatar_name: get("AVATAR_ID").unwrap_or_default(),
            knowledge_id: get("AVATAR_KNOWLEDGE_ID"),
            language: get("AVATAR_LANGUAGE").unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            disable_idle_timeout: true,
        };

        Ok(Self {
            db_path,
            port,
            token_url: get("AVATAR_TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            console: ConsoleSettings {
                start_options,
                greeting: get("AVATAR_GREETING").unwrap_or_else(|| DEFAULT_GREETING.to_string()),
            },
        })
    }
}
