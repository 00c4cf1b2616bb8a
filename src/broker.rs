use anyhow::{Context, Result};
use async_nats::jetstream::{self, stream::Config as StreamConfig};
use std::time::Duration;

pub const STREAM_LEADS: &str = "LEADS";
pub const SUBJECT_LEAD_PROCESS: &str = "leads.process";

pub const STREAM_LOGS: &str = "LOGS";
pub const SUBJECT_LOG_WRITE: &str = "logs.write";

/// JetStream connection owning the two work streams.
///
/// `LEADS` carries async lead submissions, `LOGS` carries audit records. Both
/// are created on startup when missing so the process is self-bootstrapping
/// against an empty broker.
pub struct Broker {
    jetstream: jetstream::Context,
}

impl Broker {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        tracing::info!("Connecting to NATS at {} (timeout={:?})", url, timeout);

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = jetstream::new(client);

        tracing::info!("Successfully connected to NATS");
        Ok(Self { jetstream })
    }

    /// Creates the lead and log streams when they do not already exist.
    pub async fn ensure_streams(&self) -> Result<()> {
        self.ensure_stream(STREAM_LEADS, SUBJECT_LEAD_PROCESS, "Async lead submissions")
            .await?;
        self.ensure_stream(STREAM_LOGS, SUBJECT_LOG_WRITE, "Audit log records")
            .await?;
        Ok(())
    }

    async fn ensure_stream(&self, name: &str, subject: &str, description: &str) -> Result<()> {
        match self.jetstream.get_stream(name).await {
            Ok(_) => {
                tracing::info!("Stream '{}' already exists", name);
            }
            Err(_) => {
                self.jetstream
                    .create_stream(StreamConfig {
                        name: name.to_string(),
                        subjects: vec![subject.to_string()],
                        description: Some(description.to_string()),
                        ..Default::default()
                    })
                    .await
                    .with_context(|| format!("Failed to create stream '{}'", name))?;
                tracing::info!("Created stream '{}'", name);
            }
        }

        Ok(())
    }

    pub fn jetstream(&self) -> jetstream::Context {
        self.jetstream.clone()
    }
}
