//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::Amount;
use crate::engine::{
    EngineConfig, DEFAULT_MAX_COMMIT_ATTEMPTS, DEFAULT_RETRY_BACKOFF, DEFAULT_VALIDATION_TIMEOUT,
};

/// Signup bonus in minor units (50.00)
pub const DEFAULT_SIGNUP_BONUS_MINOR: i64 = 5000;
pub const DEFAULT_IDEMPOTENCY_TTL_HOURS: i64 = 24;

/// Which storage backend the process runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(ConfigError::InvalidValue("STORAGE_BACKEND")),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub storage_backend: StorageBackend,

    /// Database connection URL (required for the postgres backend)
    pub database_url: Option<String>,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    /// Credited on account opening; 0 disables the bonus
    pub signup_bonus_minor: i64,

    pub idempotency_ttl_hours: i64,

    pub validation_timeout_ms: u64,

    pub max_commit_attempts: u32,

    pub agent_float_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let storage_backend: StorageBackend = parse_or("STORAGE_BACKEND", StorageBackend::Postgres)?;

        let database_url = env::var("DATABASE_URL").ok();
        if storage_backend == StorageBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingEnv("DATABASE_URL"));
        }

        let database_max_connections = parse_or("DATABASE_MAX_CONNECTIONS", 10)?;
        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_or("PORT", 3000)?;
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let signup_bonus_minor: i64 = parse_or("SIGNUP_BONUS_MINOR", DEFAULT_SIGNUP_BONUS_MINOR)?;
        if signup_bonus_minor < 0 {
            return Err(ConfigError::InvalidValue("SIGNUP_BONUS_MINOR"));
        }

        let idempotency_ttl_hours: i64 =
            parse_or("IDEMPOTENCY_TTL_HOURS", DEFAULT_IDEMPOTENCY_TTL_HOURS)?;
        if idempotency_ttl_hours <= 0 {
            return Err(ConfigError::InvalidValue("IDEMPOTENCY_TTL_HOURS"));
        }

        let validation_timeout_ms = parse_or(
            "VALIDATION_TIMEOUT_MS",
            DEFAULT_VALIDATION_TIMEOUT.as_millis() as u64,
        )?;
        let max_commit_attempts: u32 = parse_or("MAX_COMMIT_ATTEMPTS", DEFAULT_MAX_COMMIT_ATTEMPTS)?;
        if max_commit_attempts == 0 {
            return Err(ConfigError::InvalidValue("MAX_COMMIT_ATTEMPTS"));
        }
        let agent_float_enabled = parse_or("AGENT_FLOAT_ENABLED", true)?;

        Ok(Self {
            storage_backend,
            database_url,
            database_max_connections,
            host,
            port,
            environment,
            signup_bonus_minor,
            idempotency_ttl_hours,
            validation_timeout_ms,
            max_commit_attempts,
            agent_float_enabled,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn signup_bonus(&self) -> Option<Amount> {
        Amount::new(self.signup_bonus_minor).ok()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            validation_timeout: Duration::from_millis(self.validation_timeout_ms),
            max_commit_attempts: self.max_commit_attempts,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            agent_float: self.agent_float_enabled,
            idempotency_ttl: chrono::Duration::hours(self.idempotency_ttl_hours),
        }
    }
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
