use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

const STAGES: &[(&str, &str)] = &[
    ("schema", include_str!("sql/schema.sql")),
    ("indexes", include_str!("sql/indexes.sql")),
];

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database error executing bootstrap stage '{stage}': {source}")]
    Sql {
        stage: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Applies the embedded bootstrap scripts in order. Every statement is
/// idempotent, so running this on an already-bootstrapped database is
/// a no-op.
pub async fn run(pool: &PgPool) -> Result<(), BootstrapError> {
    for (stage, sql) in STAGES {
        info!(stage, "applying bootstrap stage");
        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .map_err(|source| BootstrapError::Sql { stage, source })?;
    }
    Ok(())
}

/// Simple liveness check used during startup.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// Readiness probe: the schema must actually be in place.
pub async fn ensure_readiness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT count(*) FROM chats")
        .execute(pool)
        .await
        .map(|_| ())
}
