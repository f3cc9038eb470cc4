//! Error types for pipeline assembly and export.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while assembling a tracing pipeline.
///
/// These surface synchronously from [`bootstrap`](crate::bootstrap) and
/// [`run_scoped`](crate::run_scoped) and are fatal to that call, not to the
/// process.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The export target could not be parsed.
    #[error("invalid export endpoint {endpoint}: {reason}")]
    InvalidEndpoint {
        /// The offending endpoint string.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A configuration value is invalid.
    #[error("{name}: {reason}")]
    InvalidConfig {
        /// The configuration name.
        name: &'static str,
        /// The reason the configuration is invalid.
        reason: String,
    },
}

/// Errors raised inside the pipeline while exporting spans.
///
/// These never cross the harness API: background export failures are logged
/// and otherwise invisible, since test infrastructure must not fail tests
/// over export-side issues.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExportError {
    /// The export did not complete within the configured timeout.
    #[error("export timed out after {0:?}")]
    Timeout(Duration),

    /// The pipeline was already shut down.
    #[error("span pipeline already shut down")]
    AlreadyShutdown,

    /// Other failures not covered by the variants above.
    #[error("{0}")]
    InternalFailure(String),
}

/// Result of handing a batch to an exporter.
pub type ExportResult = Result<(), ExportError>;
