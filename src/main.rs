mod config;

use feed_gateway::{
    CredentialStore, DataSource, Gateway, MemoryCredentialStore, MemorySource, TokenService,
};
use feed_gateway_redis::{RedisCredentialStore, RedisDataSource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{parse_flag, AppConfig};

const DEMO_EMAIL: &str = "bob@test.com";
const DEMO_PASSWORD: &str = "password";
const DEMO_DATA: &str = "name,age";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // redis connects over tokio-rustls; pick the process-wide provider up front
    let _ = rustls::crypto::ring::default_provider().install_default();

    let test_mode = match std::env::var("TEST_MODE") {
        Ok(v) => parse_flag(&v)?,
        Err(_) => false,
    };
    let config = AppConfig::load(test_mode)?;

    tracing::info!(
        http_port = config.server.http_port,
        feed_port = config.server.feed_port,
        feed_id = %config.feed.feed_id,
        policy = ?config.feed.policy,
        poll_interval_secs = config.feed.poll_interval_secs,
        require_auth = config.feed.require_auth,
        test_mode,
        "Feed server starting"
    );

    let tokens = TokenService::with_ttl(&config.auth.jwt_secret, config.token_ttl())?;

    let builder = Gateway::builder()
        .http_port(config.server.http_port)
        .feed_port(config.server.feed_port)
        .feed_id(&config.feed.feed_id)
        .tokens(tokens)
        .poll_interval(config.poll_interval())
        .policy(config.feed.policy)
        .write_timeout(config.write_timeout())
        .require_auth(config.feed.require_auth)
        .replay_latest(config.feed.replay_latest)
        .close_on_expiry(config.feed.close_on_expiry);

    let builder = if test_mode {
        tracing::info!("Running in TEST MODE - in-memory stores with demo data");

        let source = MemorySource::new();
        source.store(&config.feed.feed_id, DEMO_DATA.into()).await?;

        let credentials = MemoryCredentialStore::new();
        credentials.create(DEMO_EMAIL, DEMO_PASSWORD).await?;

        builder.source(source).credentials(credentials)
    } else {
        let redis_url = config.redis.url.as_deref().unwrap_or_default();

        let source = RedisDataSource::new();
        source.connect(redis_url).await?;

        let credentials = RedisCredentialStore::new();
        credentials.connect(redis_url).await?;

        builder.source(source).credentials(credentials)
    };

    builder.build()?.run().await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feed_server=info,feed_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
