use actix_web::{middleware::Logger, web, App, HttpServer};
use chat_fabric_service::{
    config::{Config, StoreBackend},
    db,
    error::AppError,
    jobs::{ExpirySweepJob, KeyRotationJob, PresenceHeartbeatJob},
    logging,
    middleware::{CredentialValidator, RequestIdMiddleware},
    redis_client::RedisClient,
    routes,
    services::{ChatFabric, Collaborators},
    state::AppState,
    store::{
        memory::MemoryBackend,
        postgres::{PgDirectory, PgKeyLedger, PgMessageStore},
        redis::{RedisKeyRing, RedisPresenceStore},
        s3::S3MediaStore,
    },
    websocket::RedisBroker,
};
use std::sync::Arc;

async fn production_collaborators(cfg: &Config) -> Result<Collaborators, AppError> {
    let database_url = cfg
        .database_url
        .as_deref()
        .ok_or_else(|| AppError::Config("DATABASE_URL is required".into()))?;
    let pool = db::init_pool(database_url).await?;

    let redis = RedisClient::from_url(&cfg.redis_url)
        .await
        .map_err(|e| AppError::StartServer(format!("redis: {e}")))?;

    let directory = Arc::new(PgDirectory::new(pool.clone()));
    Ok(Collaborators {
        conversations: directory.clone(),
        users: directory,
        messages: Arc::new(PgMessageStore::new(pool.clone())),
        media: Arc::new(S3MediaStore::from_config(&cfg.s3).await),
        key_ledger: Arc::new(PgKeyLedger::new(pool)),
        key_ring: Arc::new(RedisKeyRing::new(redis.clone())),
        presence: Arc::new(RedisPresenceStore::new(redis.clone())),
        broker: Arc::new(RedisBroker::new(redis)),
    })
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Arc::new(Config::from_env()?);
    let validator = CredentialValidator::from_secret(&cfg.jwt_secret)?;

    let collaborators = match cfg.store_backend {
        StoreBackend::Postgres => production_collaborators(&cfg).await?,
        StoreBackend::Memory => {
            tracing::warn!("STORE_BACKEND=memory: state is process-local, run a single instance only");
            Collaborators::from(&MemoryBackend::new())
        }
    };

    let fabric = ChatFabric::with_presence_ttl(collaborators, &cfg.instance_id, cfg.presence_ttl);
    fabric.envelope.ensure_ring().await?;

    let _fanout_listener = fabric.bus.start_listener().await?;
    let _key_rotation = KeyRotationJob::new(
        fabric.envelope.clone(),
        cfg.key_rotation_interval,
        cfg.instance_id.clone(),
    )
    .spawn();
    let _expiry_sweep =
        ExpirySweepJob::new(fabric.messages.clone(), cfg.expiry_sweep_interval).spawn();
    let _presence_heartbeat = PresenceHeartbeatJob::new(fabric.clone()).spawn();

    let state = AppState {
        config: cfg.clone(),
        fabric,
        validator,
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, instance_id = %cfg.instance_id, "starting chat-fabric-service");

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(RequestIdMiddleware)
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind {bind_addr}: {e}")))?
    .run()
    .await
    .map_err(|e| AppError::StartServer(format!("run: {e}")))
}
