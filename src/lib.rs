//! Lead Intake API Library
//!
//! Asynchronous lead-ingestion pipeline: an HTTP API accepts lead payloads
//! synchronously or enqueues them onto NATS JetStream for background
//! processing, persists leads with dynamic typed attributes in Postgres, and
//! serves cached listings and statistics.
//!
//! # Modules
//!
//! - `attributes`: Dynamic attribute typing and canonical text encoding.
//! - `audit`: Fire-and-forget audit log channel and request middleware.
//! - `broker`: NATS JetStream connection and stream bootstrap.
//! - `cache`: Checksummed read caches and their keys.
//! - `config`: Configuration management.
//! - `consumer`: Queue consumers for lead and log messages.
//! - `db`: Database connection and pool management.
//! - `dispatch`: Bulk and single-lead queue publishing.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers.
//! - `models`: Core data models.
//! - `processor`: Lead normalization, validation, and persistence.
//! - `store`: Database storage operations.

pub mod attributes;
pub mod audit;
pub mod broker;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod processor;
pub mod store;
