//! # Structured Logging Module
//!
//! Environment-aware structured logging for the controller and for embedding
//! processes. `RUST_LOG` overrides the configured level.

use crate::config::{LogFormat, LoggingConfig};
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

        let layer = match config.format {
            LogFormat::Json => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed(),
        };

        // An embedding process may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }

        tracing::info!(
            pid = std::process::id(),
            level = %config.level,
            format = ?config.format,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Log structured data for queue item operations
pub fn log_queue_operation(
    operation: &str,
    tenant_id: Uuid,
    step_run_uuid: Option<Uuid>,
    step_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    let step_run = step_run_uuid.map(|id| id.to_string());
    tracing::info!(
        operation = %operation,
        tenant_id = %tenant_id,
        step_run_uuid = step_run.as_deref(),
        step_id = step_id,
        status = %status,
        details = details,
        "📋 QUEUE_OPERATION"
    );
}
