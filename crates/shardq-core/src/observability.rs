//! Logging setup and span helpers.
//!
//! Everything logs through `tracing`; binaries call [`init_logging`] once and
//! library code only emits events inside the spans built here.

use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::domain::{DispatcherId, PartitionId};
use crate::verification::SubjectId;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines, for production.
    Json,
    /// Human readable, for development.
    #[default]
    Pretty,
}

/// Installs the global subscriber. `RUST_LOG` filters (default `info`).
/// Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // try_init: a test harness may already own the global subscriber
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
    });
}

/// Span around one dispatcher's work on one partition.
#[must_use]
pub fn dispatch_span(dispatcher: DispatcherId, partition: &PartitionId) -> Span {
    tracing::info_span!(
        "dispatch",
        dispatcher = %dispatcher,
        partition = %partition,
    )
}

/// Span around a verification operation.
#[must_use]
pub fn verification_span(operation: &str, subject: SubjectId) -> Span {
    tracing::info_span!("verification", op = operation, subject = %subject)
}
