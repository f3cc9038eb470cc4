//! # Trace Harness
//!
//! A self-contained span pipeline for test binaries: bootstrap it once per
//! process, run test operations while the pipeline is live, and flush what
//! was recorded before the process exits. The pipeline is assembled from
//! small, injectable collaborators (id generation through [`id_generator`],
//! sampling through [`sampler`], batching through [`processor`], delivery
//! through [`export`]) and supervised by the [`lifecycle`] controller.
//!
//! Most callers only need the three free functions:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! # async fn doc() {
//! let result = trace_harness::run_scoped("checkout-tests", || async {
//!     // run the code under test while spans are being collected
//!     42
//! })
//! .await;
//! assert_eq!(result.unwrap(), 42);
//!
//! trace_harness::flush_and_wait(Duration::from_secs(2)).await;
//! # }
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod error;
pub mod export;
pub mod id_generator;
pub mod lifecycle;
pub mod pipeline;
pub mod processor;
pub mod propagation;
pub mod resource;
pub mod sampler;
pub mod span;

pub use error::{ConfigError, ExportError, ExportResult};
pub use lifecycle::{bootstrap, flush_and_wait, run_scoped, tracer, LifecycleState};
pub use pipeline::{PipelineBuilder, TracerHandle};
pub use resource::Resource;
