use crate::audit::{generate_thread_key, AuditLogger, LogMessage};
use crate::broker::{STREAM_LEADS, STREAM_LOGS, SUBJECT_LEAD_PROCESS, SUBJECT_LOG_WRITE};
use crate::models::ProcessLeadMessage;
use crate::processor::LeadProcessor;
use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Three-way verdict for one delivered message.
///
/// `Commit` removes the message, `Terminate` drops it without redelivery
/// (malformed or permanently unprocessable), `Retry` schedules redelivery for
/// transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Commit,
    Terminate,
    Retry,
}

/// Pull consumer draining `leads.process` through the shared processor.
///
/// Delivery is at-least-once; the processor's idempotent conflict handling
/// makes a redelivered duplicate converge on `Terminate` instead of looping.
pub struct LeadConsumer {
    consumer: PullConsumer,
    processor: Arc<LeadProcessor>,
    audit: AuditLogger,
    batch_size: usize,
    max_wait: Duration,
}

impl LeadConsumer {
    pub async fn new(
        jetstream: &jetstream::Context,
        processor: Arc<LeadProcessor>,
        audit: AuditLogger,
        batch_size: usize,
        max_wait_secs: u64,
    ) -> Result<Self> {
        let consumer = durable_consumer(jetstream, STREAM_LEADS, "lead-processor", SUBJECT_LEAD_PROCESS)
            .await?;

        Ok(Self {
            consumer,
            processor,
            audit,
            batch_size,
            max_wait: Duration::from_secs(max_wait_secs),
        })
    }

    /// Fetch-and-process loop; returns once the token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Lead consumer started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Lead consumer stopping");
                    break;
                }
                result = self.fetch_and_process() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Error processing lead batch");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        Ok(())
    }

    async fn fetch_and_process(&self) -> Result<()> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(self.batch_size)
            .expires(self.max_wait)
            .messages()
            .await
            .context("Failed to fetch lead messages")?;

        while let Some(result) = messages.next().await {
            let message = match result {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "Error receiving lead message");
                    continue;
                }
            };

            let outcome = self.handle_message(&message.payload).await;
            settle(&message, outcome).await;
        }

        Ok(())
    }

    /// Classifies one message into its acknowledgment outcome.
    ///
    /// An undeserializable payload can never succeed and is terminated. A
    /// processed lead commits; validation failures and duplicate emails are
    /// deterministic rejections and terminate; everything else is transient
    /// and retried.
    async fn handle_message(&self, payload: &[u8]) -> MessageOutcome {
        let thread_key = generate_thread_key();

        let message: ProcessLeadMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, "Discarding malformed lead message");
                return MessageOutcome::Terminate;
            }
        };

        let email = message
            .lead_payload
            .get("email")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        self.audit.info(
            &thread_key,
            "PROCESSING_LEAD_ASYNC",
            json!({ "email": email, "batch_id": message.batch_id }),
        );

        match self.processor.process(&message.lead_payload).await {
            Ok(lead) => {
                self.audit.info(
                    &thread_key,
                    "LEAD_PROCESSED_SUCCESSFULLY",
                    json!({
                        "lead_id": lead.lead.id,
                        "email": lead.lead.email,
                        "batch_id": message.batch_id,
                    }),
                );
                MessageOutcome::Commit
            }
            Err(e) if !e.is_retryable() => {
                self.audit.log_error(
                    &thread_key,
                    "LEAD_VALIDATION_FAILED",
                    &e,
                    json!({ "email": email, "batch_id": message.batch_id }),
                );
                MessageOutcome::Terminate
            }
            Err(e) => {
                self.audit.log_error(
                    &thread_key,
                    "FAILED_TO_PROCESS_LEAD",
                    &e,
                    json!({ "email": email, "batch_id": message.batch_id }),
                );
                MessageOutcome::Retry
            }
        }
    }
}

/// Pull consumer draining `logs.write` into the process's structured log
/// output. Log handling is terminal either way; a record that cannot be
/// parsed is dropped, never redelivered.
pub struct LogConsumer {
    consumer: PullConsumer,
    batch_size: usize,
    max_wait: Duration,
}

impl LogConsumer {
    pub async fn new(
        jetstream: &jetstream::Context,
        batch_size: usize,
        max_wait_secs: u64,
    ) -> Result<Self> {
        let consumer =
            durable_consumer(jetstream, STREAM_LOGS, "log-writer", SUBJECT_LOG_WRITE).await?;

        Ok(Self {
            consumer,
            batch_size,
            max_wait: Duration::from_secs(max_wait_secs),
        })
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Log consumer started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Log consumer stopping");
                    break;
                }
                result = self.drain() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Error draining log batch");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(self.batch_size)
            .expires(self.max_wait)
            .messages()
            .await
            .context("Failed to fetch log messages")?;

        while let Some(result) = messages.next().await {
            let message = match result {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "Error receiving log message");
                    continue;
                }
            };

            let outcome = match serde_json::from_slice::<LogMessage>(&message.payload) {
                Ok(record) => {
                    tracing::info!(
                        target: "audit",
                        thread_key = %record.thread_key,
                        name = %record.name,
                        timestamp = %record.timestamp,
                        data = %serde_json::to_string(&record.data).unwrap_or_default(),
                        "audit record"
                    );
                    MessageOutcome::Commit
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding malformed audit record");
                    MessageOutcome::Terminate
                }
            };

            settle(&message, outcome).await;
        }

        Ok(())
    }
}

async fn durable_consumer(
    jetstream: &jetstream::Context,
    stream: &str,
    name: &str,
    subject: &str,
) -> Result<PullConsumer> {
    let consumer = jetstream
        .create_consumer_on_stream(
            jetstream::consumer::pull::Config {
                name: Some(name.to_string()),
                durable_name: Some(name.to_string()),
                filter_subject: subject.to_string(),
                ack_policy: jetstream::consumer::AckPolicy::Explicit,
                ..Default::default()
            },
            stream,
        )
        .await
        .with_context(|| format!("Failed to create consumer '{}'", name))?;

    tracing::info!(stream, consumer = name, "Consumer created");
    Ok(consumer)
}

async fn settle(message: &jetstream::Message, outcome: MessageOutcome) {
    let result = match outcome {
        MessageOutcome::Commit => message.ack().await,
        MessageOutcome::Terminate => message.ack_with(AckKind::Term).await,
        MessageOutcome::Retry => message.ack_with(AckKind::Nak(None)).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, ?outcome, "Failed to settle message");
    }
}
