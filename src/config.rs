use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub nats_url: String,
    /// Number of concurrent lead-processing workers to spawn.
    pub consumer_workers: usize,
    /// Messages fetched per consumer pull.
    pub consumer_batch_size: usize,
    /// Seconds a consumer pull waits for messages before returning empty.
    pub consumer_max_wait_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable required"))
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DATABASE_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            nats_url: std::env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string()),
            consumer_workers: std::env::var("CONSUMER_WORKERS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CONSUMER_WORKERS must be a positive number"))
                .and_then(|n: usize| {
                    if n == 0 {
                        anyhow::bail!("CONSUMER_WORKERS must be at least 1");
                    }
                    Ok(n)
                })?,
            consumer_batch_size: std::env::var("CONSUMER_BATCH_SIZE")
                .unwrap_or_else(|_| "25".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CONSUMER_BATCH_SIZE must be a positive number"))?,
            consumer_max_wait_secs: std::env::var("CONSUMER_MAX_WAIT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CONSUMER_MAX_WAIT_SECS must be a number"))?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("NATS URL: {}", config.nats_url);
        tracing::debug!("Server Port: {}", config.port);
        tracing::debug!("Consumer workers: {}", config.consumer_workers);

        Ok(config)
    }
}
