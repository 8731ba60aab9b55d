//! # jobchain core
//!
//! Shared building blocks for the jobchain engine: the TOML configuration,
//! the error taxonomy and the data model that flows between the Status
//! Store, the Task Runner, the Notifier and the workflows.

pub mod config;
pub mod error;
pub mod types;

pub use config::JobchainConfig;
pub use error::{JobchainError, Result};
pub use types::{
    FailureNotice, Invocation, InvocationRecord, JobDefinition, JobStatus, TaskSpec,
};
