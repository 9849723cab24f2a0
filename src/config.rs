//! Process configuration loaded from environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DATABASE_PATH: &str = "todo.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    pub environment: Environment,
    /// Insert sample todos when the table is empty.
    pub seed_demo: bool,
}

impl Config {
    /// Loads the configuration from the process environment.
    ///
    /// # Environment Variables
    /// - `HOST` (default `0.0.0.0`)
    /// - `PORT` (default `3000`)
    /// - `DATABASE_PATH` (default `todo.db`)
    /// - `APP_ENV`, falling back to `NODE_ENV`: `production` skips schema sync
    /// - `SEED_DEMO`: `1`, `true` or `yes` seeds an empty table
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("PORT must be a valid port number, got {raw:?}"))?,
            None => DEFAULT_PORT,
        };
        let database_path = lookup("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));
        let environment = match lookup("APP_ENV").or_else(|| lookup("NODE_ENV")).as_deref() {
            Some("production") => Environment::Production,
            _ => Environment::Development,
        };
        let seed_demo = lookup("SEED_DEMO").is_some_and(|raw| {
            matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
        });

        Ok(Self {
            host,
            port,
            database_path,
            environment,
            seed_demo,
        })
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
