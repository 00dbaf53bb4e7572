//! Postgres-backed repository implementations.
//!
//! Queries are runtime-bound (`sqlx::query` + `.bind()`), so the crate
//! builds without a live database; schema drift surfaces in the
//! database-gated integration tests instead of at compile time.

mod records;

use std::sync::Arc;

use sqlx::error::ErrorKind;
use sqlx::{
    Postgres, Transaction,
    postgres::{PgPool, PgPoolOptions},
    query,
};

use crate::application::repos::RepoError;

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
    /// Per-subject, per-scope live-relation ceiling checked inside every
    /// write transaction.
    relation_cap: u32,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool, relation_cap: u32) -> Self {
        Self {
            pool: Arc::new(pool),
            relation_cap,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }
}

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::UniqueViolation => RepoError::Duplicate {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            },
            ErrorKind::ForeignKeyViolation => RepoError::InvalidInput {
                message: db.message().to_string(),
            },
            ErrorKind::NotNullViolation | ErrorKind::CheckViolation => RepoError::Integrity {
                message: db.message().to_string(),
            },
            _ if db
                .message()
                .contains("canceling statement due to user request") =>
            {
                RepoError::Timeout
            }
            _ => RepoError::Persistence(db.message().to_string()),
        },
        other => RepoError::from_persistence(other),
    }
}
