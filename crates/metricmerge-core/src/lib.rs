//! metricmerge-core library.
//!
//! Incremental merge-and-wrangle pipeline for post metric CSV exports:
//!
//! - [`table`]: in-memory table model plus the chunked CSV reader and the
//!   append-only writer.
//! - [`wrangle`]: numeric normalization, base-time extraction and per-key
//!   record consolidation.
//! - [`merge`]: the chunked merge engine that maintains the canonical output.
//! - [`staging`]: collaborator traits for remote sources and credentials,
//!   the processed-file registry, and the coarse merge of staged files.
//!
//! # Conventions
//!
//! - **Errors**: library operations return [`error::MergeError`]; config
//!   loading uses `anyhow::Result` with context.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod config;
pub mod error;
pub mod lock;
pub mod merge;
pub mod staging;
pub mod table;
pub mod wrangle;

pub use error::{ErrorCode, MergeError, StructuralError};
pub use merge::{MergeEngine, MergeReport, MergeState, process_csv_file};
