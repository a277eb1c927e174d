//! # texflow-jobs
//!
//! The compilation engine for texflow.
//!
//! This crate provides:
//! - Structure template resolution and placeholder rendering
//! - Compile jobs: scratch directories, staged images and class files
//! - Two worker pool strategies: in-process workers with a compile timeout,
//!   and persistent sandboxes with marker-file completion
//! - A polling scheduler that leases tasks and publishes results
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use texflow_db::{ConnectOptions, Records};
//! use texflow_jobs::{CompileContext, CompilerConfig, ProcessPool, Scheduler};
//!
//! let config = Arc::new(CompilerConfig::load("config.json")?);
//! let records = Records::connect("postgres://...", ConnectOptions::for_workers(4)).await?;
//!
//! let ctx = CompileContext::new(config.clone(), records.clone()).await?;
//! let handle = Scheduler::new(records, ProcessPool::start(ctx), config).start();
//!
//! // Listen for events
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! handle.join().await?;
//! ```

pub mod command;
pub mod job;
pub mod pool;
pub mod publisher;
pub mod scheduler;
pub mod template;

// Re-export core types
pub use texflow_core::*;

pub use command::{CompileCommand, CompileOutput};
pub use job::{CompileContext, CompileJob};
pub use pool::{
    Completion, DockerRuntime, LocalRuntime, Outcome, PoolStats, ProcessPool, SandboxPool,
    SandboxRuntime, WorkerPool,
};
pub use publisher::{Published, ResultPublisher};
pub use scheduler::{PassSummary, Scheduler, SchedulerEvent, SchedulerHandle, LEASE_EXPIRED};
