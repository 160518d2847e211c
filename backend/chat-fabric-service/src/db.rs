use crate::error::AppError;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;

const MIGRATION: &str = include_str!("../migrations/0001_chat_fabric.sql");

const DEFAULT_MAX_CONNECTIONS: usize = 20;

pub async fn init_pool(database_url: &str) -> Result<Pool, AppError> {
    let pg_config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|e| AppError::Config(format!("DATABASE_URL: {e}")))?;

    let max_size = std::env::var("DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);

    let manager = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| AppError::StartServer(format!("db pool: {e}")))?;

    run_migrations(&pool).await?;
    tracing::info!(max_size, "postgres pool ready");
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<(), AppError> {
    let client = pool.get().await?;
    client.batch_execute(MIGRATION).await?;
    Ok(())
}
