use std::fmt;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::error::Result;

/// Full service configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub kafka: KafkaConfig,
    pub store: StoreConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            kafka: KafkaConfig::from_env(),
            store: StoreConfig::from_env(),
        }
    }
}

/// Kafka subscription settings.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Kafka brokers (comma-separated)
    pub bootstrap_servers: String,
    /// Consumer group ID
    pub group_id: String,
    /// CDC topic for the upstream orders table
    pub topic: String,
    /// Position to start from when the group has no committed offset
    /// (`earliest` or `latest`)
    pub auto_offset_reset: String,
    /// Upper bound on a single poll before reporting "no record"
    pub poll_timeout: Duration,
}

impl KafkaConfig {
    pub fn from_env() -> Self {
        Self {
            bootstrap_servers: std::env::var("KAFKA_BOOTSTRAP_SERVERS")
                .unwrap_or_else(|_| "localhost:29092".to_string()),
            group_id: std::env::var("KAFKA_GROUP_ID")
                .unwrap_or_else(|_| "analytics-consumer-group".to_string()),
            topic: std::env::var("KAFKA_TOPIC")
                .unwrap_or_else(|_| "dbserver1.public.orders".to_string()),
            auto_offset_reset: std::env::var("KAFKA_AUTO_OFFSET_RESET")
                .unwrap_or_else(|_| "earliest".to_string()),
            poll_timeout: Duration::from_millis(
                std::env::var("POLL_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
        }
    }
}

/// Analytics store connection settings.
#[derive(Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Maximum number of pooled connections
    pub max_connections: u32,
    /// Store write attempts per record before the loop gives up and halts
    pub max_retries: u32,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("PG_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5433),
            database: std::env::var("PG_DB").unwrap_or_else(|_| "analyticsdb".to_string()),
            user: std::env::var("PG_USER").unwrap_or_else(|_| "dbz_analytics".to_string()),
            password: std::env::var("PG_PASSWORD").unwrap_or_else(|_| "dbz_analytics".to_string()),
            max_connections: std::env::var("PG_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            max_retries: std::env::var("STORE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        }
    }

    /// Open the PostgreSQL pool for the analytics table.
    pub async fn connect(&self) -> Result<PgPool> {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password);

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        Ok(pool)
    }
}
