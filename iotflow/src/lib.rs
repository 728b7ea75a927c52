//! Telemetry ingestion, device liveness tracking and time-range queries for
//! authenticated IoT devices.

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod errors;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod query;
pub mod reconcile;
pub mod rest;
pub mod service;
pub mod store;
pub mod validate;

pub use errors::{Error, Result};
pub use service::{ServiceSettings, TelemetryService};
