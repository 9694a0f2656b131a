use actix_web::{web, App, HttpServer};
use session_chat_service::{
    config::Config,
    crypto::{HandshakeService, ServerIdentity},
    db,
    error::AppError,
    logging,
    redis_client::RedisClient,
    relay::{ChannelNames, LocalBus, PendingReader, PubSubRelay, RedisRelay},
    routes,
    services::MessageGateway,
    state::AppState,
    store::{
        KeyStore, KeyValueStore, MemoryKeyValueStore, MemoryMessageStore, MessageCache,
        MessageStore, PgMessageStore, RedisKeyValueStore,
    },
    websocket::SessionConnectionRegistry,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Arc::new(Config::from_env()?);

    let identity = match &cfg.server_private_key {
        Some(encoded) => ServerIdentity::from_base64(encoded)
            .map_err(|e| AppError::Config(format!("SERVER_PRIVATE_KEY: {e}")))?,
        None => {
            tracing::warn!(
                "SERVER_PRIVATE_KEY not set; using an ephemeral server key, clients must repeat the handshake after a restart"
            );
            ServerIdentity::generate()
        }
    };

    let messages: Arc<dyn MessageStore> = match &cfg.database_url {
        Some(url) => {
            let pool = db::init_pool(url)
                .await
                .map_err(|e| AppError::StartServer(format!("db: {e}")))?;
            Arc::new(PgMessageStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; messages are kept in memory only");
            Arc::new(MemoryMessageStore::new())
        }
    };

    let (kv, relay, reader): (Arc<dyn KeyValueStore>, Arc<dyn PubSubRelay>, PendingReader) =
        match &cfg.redis_url {
            Some(url) => {
                let redis = RedisClient::connect(url)
                    .await
                    .map_err(|e| AppError::StartServer(format!("redis: {e}")))?;
                let (relay, reader) = RedisRelay::new(
                    redis.clone(),
                    ChannelNames::new(cfg.redis_channel_prefix.clone()),
                );
                let kv: Arc<dyn KeyValueStore> = Arc::new(RedisKeyValueStore::new(redis));
                let relay: Arc<dyn PubSubRelay> = Arc::new(relay);
                (kv, relay, PendingReader::Redis(reader))
            }
            None => {
                tracing::warn!("REDIS_URL not set; running single-node with an in-process relay");
                let (relay, reader) = LocalBus::new().attach().await;
                let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
                let relay: Arc<dyn PubSubRelay> = Arc::new(relay);
                (kv, relay, PendingReader::Local(reader))
            }
        };

    let keys = KeyStore::new(kv.clone(), cfg.key_ttl);
    let cache = MessageCache::new(kv, cfg.message_cache_ttl);
    let registry = SessionConnectionRegistry::new(relay.clone());
    let gateway = Arc::new(MessageGateway::new(
        keys.clone(),
        messages,
        cache,
        relay,
        registry.clone(),
        cfg.fanout_mode,
    ));
    let reader = reader.spawn(gateway.clone());
    let handshake = Arc::new(HandshakeService::new(identity, keys));

    let state = AppState {
        config: cfg.clone(),
        registry: registry.clone(),
        gateway,
        handshake,
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(
        %bind_addr,
        fanout_mode = cfg.fanout_mode.as_str(),
        "starting session-chat-service"
    );

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind: {e}")))?
    .run()
    .await
    .map_err(|e| AppError::StartServer(format!("server: {e}")))?;

    registry.shutdown().await;
    drop(reader);
    tracing::info!("session-chat-service stopped");
    Ok(())
}
