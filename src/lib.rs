// src/lib.rs
// Public library surface for the binary and the integration tests.

pub mod error;
pub mod retry;
pub mod types;
pub mod store;
pub mod config;
pub mod metrics;

// Live polling
pub mod source;
pub mod dedup_index;
pub mod status;
pub mod poller;

// Daily batch
pub mod aggregate;
pub mod refine;
pub mod categories;
pub mod classify;
pub mod notify;
pub mod stages;
pub mod coordinator;

pub mod api;

pub use crate::api::router;
pub use crate::coordinator::PipelineCoordinator;
pub use crate::error::{ErrorKind, HarvestError};
pub use crate::retry::RetryPolicy;
