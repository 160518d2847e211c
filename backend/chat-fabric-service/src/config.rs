use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Where durable records, presence and the envelope key ring live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Postgres for records, Redis for presence, key ring and fanout.
    Postgres,
    /// Everything in process. Single instance only; used by tests and local dev.
    Memory,
}

impl StoreBackend {
    fn parse(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(AppError::Config(format!(
                "STORE_BACKEND must be 'postgres' or 'memory', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub database_url: Option<String>,
    pub store_backend: StoreBackend,
    pub jwt_secret: String,
    pub key_rotation_interval: Duration,
    pub expiry_sweep_interval: Duration,
    /// Sessions of an instance are reaped this long after its last heartbeat.
    pub presence_ttl: Duration,
    pub s3: S3Config,
    /// Identifies this process in logs and fanout envelopes.
    pub instance_id: String,
}

const DEFAULT_KEY_ROTATION_SECS: u64 = 24 * 60 * 60;
const DEFAULT_EXPIRY_SWEEP_SECS: u64 = 60;
const DEFAULT_PRESENCE_TTL_SECS: u64 = 30;

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenv();

        let store_backend =
            StoreBackend::parse(&env::var("STORE_BACKEND").unwrap_or_else(|_| "postgres".into()))?;

        let database_url = env::var("DATABASE_URL").ok();
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(AppError::Config(
                "DATABASE_URL is required when STORE_BACKEND=postgres".into(),
            ));
        }

        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8085);

        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| AppError::Config("JWT_SECRET is required".into()))?;

        let key_rotation_interval = Duration::from_secs(parse_secs(
            "KEY_ROTATION_INTERVAL_SECS",
            DEFAULT_KEY_ROTATION_SECS,
        )?);
        let expiry_sweep_interval = Duration::from_secs(parse_secs(
            "EXPIRY_SWEEP_INTERVAL_SECS",
            DEFAULT_EXPIRY_SWEEP_SECS,
        )?);

        let presence_ttl = Duration::from_secs(parse_secs(
            "PRESENCE_TTL_SECS",
            DEFAULT_PRESENCE_TTL_SECS,
        )?);

        let s3 = S3Config {
            bucket: env::var("S3_BUCKET").unwrap_or_else(|_| "chat-media".to_string()),
            region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint: env::var("S3_ENDPOINT").ok(),
        };

        let instance_id = env::var("INSTANCE_ID")
            .unwrap_or_else(|_| format!("fabric-{}", uuid::Uuid::new_v4().simple()));

        Ok(Self {
            port,
            redis_url,
            database_url,
            store_backend,
            jwt_secret,
            key_rotation_interval,
            expiry_sweep_interval,
            presence_ttl,
            s3,
            instance_id,
        })
    }
}

fn parse_secs(var: &str, default: u64) -> Result<u64, AppError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.parse::<u64>() {
            Ok(0) => Err(AppError::Config(format!("{var} must be greater than zero"))),
            Ok(secs) => Ok(secs),
            Err(e) => Err(AppError::Config(format!("{var}: {e}"))),
        },
    }
}
