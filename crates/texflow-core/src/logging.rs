//! Structured logging schema for texflow.
//!
//! All crates log through `tracing` with the field names below, so log
//! aggregation can query every subsystem the same way.
//!
//! ## Fields
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `subsystem` | Originating subsystem: `scheduler`, `pool`, `compile`, `publisher`, `store`, `server` |
//! | `component` | Part of a subsystem: `process`, `sandbox`, `local`, `memory`, `postgres` |
//! | `op` | Logical operation, e.g. `connect`, `insert`, `update` |
//! | `worker` | Worker or sandbox name |
//! | `task_id`, `user_id`, `pdf_id` | Entity ids |
//! | `collection` | Store collection affected |
//! | `duration_ms` | Wall-clock duration in milliseconds |
//! | `idle`, `leased`, `pending`, `queued`, `busy`, `results` | Per-pass scheduler counts |
//! | `error` | Error message when an operation fails |
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue (skipped image, stale lease, failed task) |
//! | INFO  | Lifecycle events (startup, shutdown), task dispatch and completion |
//! | DEBUG | Decision points, queue sizes, config choices |
//! | TRACE | Per-item iteration |
