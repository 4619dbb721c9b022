use feed_gateway::BroadcastPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Feed identifier used when running in test mode
pub const TEST_FEED_ID: &str = "LDRIFARMDATA";
const TEST_JWT_SECRET: &str = "test-secret";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub feed: FeedConfig,
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_port: u16,
    pub feed_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 3000,
            feed_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_secs: 3 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub feed_id: String,
    pub poll_interval_secs: u64,
    pub policy: BroadcastPolicy,
    pub write_timeout_ms: u64,
    pub require_auth: bool,
    pub replay_latest: bool,
    pub close_on_expiry: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            feed_id: String::new(),
            poll_interval_secs: 60,
            policy: BroadcastPolicy::OnChange,
            write_timeout_ms: 5000,
            require_auth: true,
            replay_latest: true,
            close_on_expiry: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RedisConfig {
    /// Redis URL, e.g., "redis://localhost:6379" or "rediss://:password@host:6380"
    #[serde(default)]
    pub url: Option<String>,
}

impl AppConfig {
    pub fn load(test_mode: bool) -> anyhow::Result<Self> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = Self::from_file(Path::new(&config_path))?;
        config.apply_env(|key| std::env::var(key).ok())?;
        if test_mode {
            config.apply_test_defaults();
        }
        config.validate(test_mode)?;

        Ok(config)
    }

    /// Read YAML from `path`, or fall back to defaults when it does not exist
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Environment variables override the config file
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(secret) = env("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(feed_id) = env("FEED_ID").or_else(|| env("FARM_DATA_ID")) {
            self.feed.feed_id = feed_id;
        }
        if let Some(port) = env("HTTP_PORT") {
            self.server.http_port = port.parse()?;
        }
        if let Some(port) = env("FEED_PORT") {
            self.server.feed_port = port.parse()?;
        }
        if let Some(url) = env("REDIS_URL") {
            self.redis.url = Some(url);
        }
        if let Some(secs) = env("POLL_INTERVAL_SECS") {
            self.feed.poll_interval_secs = secs.parse()?;
        }
        if let Some(policy) = env("BROADCAST_POLICY") {
            self.feed.policy = policy.parse()?;
        }
        if let Some(flag) = env("REQUIRE_AUTH") {
            self.feed.require_auth = parse_flag(&flag)?;
        }
        if let Some(flag) = env("CLOSE_ON_EXPIRY") {
            self.feed.close_on_expiry = parse_flag(&flag)?;
        }
        Ok(())
    }

    /// Fill what test mode can run without
    fn apply_test_defaults(&mut self) {
        if self.auth.jwt_secret.is_empty() {
            tracing::warn!("JWT_SECRET not set, using the test-mode secret");
            self.auth.jwt_secret = TEST_JWT_SECRET.to_string();
        }
        if self.feed.feed_id.is_empty() {
            self.feed.feed_id = TEST_FEED_ID.to_string();
        }
    }

    pub fn validate(&self, test_mode: bool) -> anyhow::Result<()> {
        if self.auth.jwt_secret.is_empty() {
            anyhow::bail!("JWT_SECRET environment variable is required");
        }
        if self.feed.feed_id.trim().is_empty() {
            anyhow::bail!("FEED_ID environment variable is required");
        }
        if !test_mode && self.redis.url.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("REDIS_URL environment variable is required");
        }
        if self.feed.poll_interval_secs == 0 {
            anyhow::bail!("POLL_INTERVAL_SECS must be positive");
        }
        if self.auth.token_ttl_secs == 0 {
            anyhow::bail!("auth.token_ttl_secs must be positive");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.feed.poll_interval_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.feed.write_timeout_ms)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.token_ttl_secs)
    }
}

/// Parse a boolean environment flag ("1"/"true" or "0"/"false")
pub fn parse_flag(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => anyhow::bail!("invalid boolean flag: {}", other),
    }
}
