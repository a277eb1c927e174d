//! Centralized default constants for texflow.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration, the scheduler and the worker pools reference these
//! constants instead of defining their own magic numbers.

// =============================================================================
// SCHEDULING
// =============================================================================

/// Default store scan interval in seconds.
pub const DB_SCAN_INTERVAL_SECS: f64 = 1.0;

/// Pause after a failed scheduler pass before scanning again (seconds).
pub const SCAN_ERROR_BACKOFF_SECS: f64 = 10.0;

/// Capacity of the scheduler event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// COMPILATION
// =============================================================================

/// Default hard timeout for one compiler invocation (seconds).
pub const COMPILE_TIMEOUT_SECS: u64 = 300;

/// Default scratch root for compile jobs.
pub const COMPILE_TMP_DIR: &str = "compiler-tmp";

/// Default structure template directory.
pub const STRUCTURE_DIR: &str = "structures";

/// Placeholder replaced by the rendered source path in `compile_cmd`.
pub const FILEPATH_PLACEHOLDER: &str = "{filepath}";

/// Placeholder replaced by the scratch directory in `compile_cmd`.
pub const OUTDIR_PLACEHOLDER: &str = "{outdir}";

/// Argument key that requests the bibliography-capable structure variant.
pub const BIBLIOGRAPHY_KEY: &str = "references";

/// Suffix of a structure file name that has a bibliography variant.
pub const STRUCTURE_SUFFIX: &str = ".structure";

/// Suffix replacing [`STRUCTURE_SUFFIX`] in the bibliography variant.
pub const BIBLIOGRAPHY_STRUCTURE_SUFFIX: &str = "-biber.structure";

/// Extension of the rendered source document.
pub const SOURCE_EXTENSION: &str = "tex";

/// Extension of the expected artifact.
pub const ARTIFACT_EXTENSION: &str = "pdf";

// =============================================================================
// SANDBOX
// =============================================================================

/// Name of the marker file written after a sandboxed compile finishes.
pub const MARKER_FILE_NAME: &str = "finished";

/// Default prefix for deterministic sandbox names.
pub const SANDBOX_NAME_PREFIX: &str = "texlive-";

/// Command kept running in each persistent sandbox.
pub const SANDBOX_IDLE_COMMAND: &str = "/bin/bash";

/// Timeout for one sandbox runtime management command (seconds).
pub const SANDBOX_COMMAND_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Default configuration file path.
pub const CONFIG_PATH: &str = "config.json";

/// Environment variable holding the configuration file path.
pub const ENV_CONFIG_PATH: &str = "TEXFLOW_CONFIG";

/// Number of workers when `compiler_number` is not configured.
pub fn compiler_number() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
