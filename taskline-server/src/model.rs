//! Service global context

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;

pub mod auth;
pub mod chat;
pub mod users;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;

use crate::config;
use crate::dispatch::MessageDispatcher;
use crate::model::auth::TokenCodec;
use crate::presence::PresenceRegistry;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Invalid SQLite path: {path}")]
    InvalidSQLitePath { path: PathBuf },
}

/// Secret used by the test model to sign session tokens
#[cfg(test)]
pub const TEST_TOKEN_SECRET: &str = "TasklineTestTokenSecret";

/// Context shared by all the request handlers and live connections
#[derive(Clone)]
pub struct Model {
    /// Database access
    db: sqlx::SqlitePool,
    /// Session tokens codec
    codec: TokenCodec,
    /// Live connections of the users
    presence: Arc<PresenceRegistry>,
}

impl Model {
    /// Context for testing purposes - using the in-memory SQLite database
    #[cfg(test)]
    pub async fn test() -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true)
            .foreign_keys(true);

        // In-memory database lives only as long as its connection
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy_with(opts);

        sqlx::migrate!("model/migrations").run(&db).await?;

        let codec = TokenCodec::new(TEST_TOKEN_SECRET, Duration::from_secs(24 * 3600))?;
        Ok(Self::new(db, codec))
    }

    /// Context from configuration
    ///
    /// If the database is created in-memory, the migrations are being executed automatically. If database is
    /// file based migrations would be executed only if requested by configuration.
    pub async fn with_config(db: config::Database, auth: config::Auth) -> Result<Self> {
        use config::Database::*;

        let db = match db {
            Memory { max_connections } => {
                // Every pool connection sees the same named in-memory database
                let opts: SqliteConnectOptions = "sqlite::memory:".parse()?;
                let opts = opts.foreign_keys(true);

                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_lazy_with(opts);

                sqlx::migrate!("model/migrations").run(&pool).await?;
                pool
            }

            SqLite {
                path,
                max_connections,
                migrate,
            } => {
                let path = path
                    .as_path()
                    .to_str()
                    .ok_or_else(|| Error::InvalidSQLitePath { path: path.clone() })?;

                let opts = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .foreign_keys(true);

                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect_lazy_with(opts);

                if migrate {
                    sqlx::migrate!("model/migrations").run(&pool).await?;
                }

                pool
            }
        };

        let ttl = Duration::from_secs(u64::from(auth.token_ttl_hours) * 3600);
        let codec = TokenCodec::new(auth.secret, ttl)?;

        Ok(Self::new(db, codec))
    }

    /// Model with an empty presence registry
    pub fn new(db: sqlx::SqlitePool, codec: TokenCodec) -> Self {
        Self {
            db,
            codec,
            presence: Arc::new(PresenceRegistry::new()),
        }
    }

    /// Accesses the DB pool
    pub fn db(&self) -> &sqlx::SqlitePool {
        &self.db
    }

    /// Session tokens codec
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Users presence registry
    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    /// Chat operations
    pub fn dispatcher(&self) -> MessageDispatcher<'_> {
        MessageDispatcher::new(&self.db, &self.presence)
    }
}
