//! # texflow-core
//!
//! Core types, traits, and abstractions for texflow.
//!
//! This crate provides the record schemas, the document store interface,
//! configuration and error types that the other texflow crates depend on.

pub mod config;
pub mod defaults;
pub mod error;
pub mod ids;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::{CompilerConfig, SandboxConfig, Strategy, TemplateConfig, TimeoutPolicy};
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
