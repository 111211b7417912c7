//! Configuration management

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/csvq";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default broker URL. `memory://` selects the in-process broker.
pub const DEFAULT_AMQP_URL: &str = "amqp://127.0.0.1:5672/%2f";

/// Default queue that carries uploaded records.
pub const DEFAULT_AMQP_QUEUE: &str = "csv_records";

/// Default number of unacknowledged deliveries the broker may push to the consumer.
pub const DEFAULT_AMQP_PREFETCH: u16 = 16;

/// Default pause before the consumer re-subscribes after losing its delivery stream.
pub const DEFAULT_AMQP_RECONNECT_DELAY_SECS: u64 = 5;

/// Default cache URL.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default time-to-live of cached records (1 hour).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// Default number of bytes read from an upload per chunk.
pub const DEFAULT_INGEST_CHUNK_SIZE: usize = csvq_ingest::decoder::DEFAULT_CHUNK_SIZE;

/// Default upper bound for one CSV line.
pub const DEFAULT_INGEST_MAX_LINE_BYTES: usize = csvq_ingest::decoder::DEFAULT_MAX_LINE_BYTES;

/// Default request body limit for uploads (1 GiB).
pub const DEFAULT_UPLOAD_MAX_BYTES: usize = 1024 * 1024 * 1024;

/// Default number of consumer workers. One keeps processing strictly sequential.
pub const DEFAULT_CONSUMER_WORKERS: usize = 1;

/// Default CORS allowed origin for local development.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub cache: CacheConfig,
    pub ingest: IngestConfig,
    pub consumer: ConsumerConfig,
    pub cors: CorsConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Message broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    /// Overrides the user in `url` when set
    pub username: Option<String>,
    /// Overrides the password in `url` when set
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub queue: String,
    pub prefetch: u16,
    pub reconnect_delay_secs: u64,
}

impl BrokerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Record cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub url: String,
    pub ttl_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Upload decoding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub chunk_size: usize,
    pub max_line_bytes: usize,
    pub max_upload_bytes: usize,
}

/// Record consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub workers: usize,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

/// Read `key` and parse it, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            server: ServerConfig {
                host: env_string("CSVQ_HOST", DEFAULT_SERVER_HOST),
                port: env_or("CSVQ_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_or("CSVQ_SHUTDOWN_TIMEOUT", DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            },
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            broker: BrokerConfig {
                url: env_string("AMQP_URL", DEFAULT_AMQP_URL),
                username: env_optional("AMQP_USERNAME"),
                password: env_optional("AMQP_PASSWORD"),
                queue: env_string("AMQP_QUEUE", DEFAULT_AMQP_QUEUE),
                prefetch: env_or("AMQP_PREFETCH", DEFAULT_AMQP_PREFETCH),
                reconnect_delay_secs: env_or(
                    "AMQP_RECONNECT_DELAY",
                    DEFAULT_AMQP_RECONNECT_DELAY_SECS,
                ),
            },
            cache: CacheConfig {
                url: env_string("REDIS_URL", DEFAULT_REDIS_URL),
                ttl_secs: env_or("CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS),
            },
            ingest: IngestConfig {
                chunk_size: env_or("INGEST_CHUNK_SIZE", DEFAULT_INGEST_CHUNK_SIZE),
                max_line_bytes: env_or("INGEST_MAX_LINE_BYTES", DEFAULT_INGEST_MAX_LINE_BYTES),
                max_upload_bytes: env_or("UPLOAD_MAX_BYTES", DEFAULT_UPLOAD_MAX_BYTES),
            },
            consumer: ConsumerConfig {
                workers: env_or("CONSUMER_WORKERS", DEFAULT_CONSUMER_WORKERS),
            },
            cors: CorsConfig {
                allowed_origins: env_string("CORS_ALLOWED_ORIGINS", DEFAULT_CORS_ALLOWED_ORIGIN)
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                allow_credentials: env_or("CORS_ALLOW_CREDENTIALS", true),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.broker.queue.trim().is_empty() {
            anyhow::bail!("AMQP queue name cannot be empty");
        }

        if self.broker.prefetch == 0 {
            anyhow::bail!("AMQP prefetch must be greater than 0");
        }

        if self.cache.ttl_secs == 0 {
            anyhow::bail!("Cache TTL must be greater than 0");
        }

        if self.ingest.chunk_size == 0 {
            anyhow::bail!("Ingest chunk size must be greater than 0");
        }

        if self.ingest.max_line_bytes < self.ingest.chunk_size {
            tracing::warn!(
                chunk_size = self.ingest.chunk_size,
                max_line_bytes = self.ingest.max_line_bytes,
                "Maximum line length is smaller than the read chunk size"
            );
        }

        if self.consumer.workers == 0 {
            anyhow::bail!("Consumer workers must be greater than 0");
        }

        if self.cors.allowed_origins.is_empty() {
            tracing::warn!("No CORS origins configured - all origins will be allowed");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            broker: BrokerConfig {
                url: DEFAULT_AMQP_URL.to_string(),
                username: None,
                password: None,
                queue: DEFAULT_AMQP_QUEUE.to_string(),
                prefetch: DEFAULT_AMQP_PREFETCH,
                reconnect_delay_secs: DEFAULT_AMQP_RECONNECT_DELAY_SECS,
            },
            cache: CacheConfig {
                url: DEFAULT_REDIS_URL.to_string(),
                ttl_secs: DEFAULT_CACHE_TTL_SECS,
            },
            ingest: IngestConfig {
                chunk_size: DEFAULT_INGEST_CHUNK_SIZE,
                max_line_bytes: DEFAULT_INGEST_MAX_LINE_BYTES,
                max_upload_bytes: DEFAULT_UPLOAD_MAX_BYTES,
            },
            consumer: ConsumerConfig {
                workers: DEFAULT_CONSUMER_WORKERS,
            },
            cors: CorsConfig {
                allowed_origins: vec![DEFAULT_CORS_ALLOWED_ORIGIN.to_string()],
                allow_credentials: true,
            },
        }
    }
}
