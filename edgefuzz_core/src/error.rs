use std::path::PathBuf;
use thiserror::Error;

/// Fatal conditions raised by the engine.
///
/// Anything that reaches the caller as a `FuzzError` ends the session; recoverable
/// problems (single timeouts, calibration retries, failed best-effort deletes) are
/// handled inside the engine and never surface here.
#[derive(Error, Debug)]
pub enum FuzzError {
    /// The target could not be executed at all.
    #[error("Unable to execute target application: {0}")]
    TargetExecution(String),

    #[error("Input and output directories can't be the same: {0:?}")]
    SameInputOutput(PathBuf),

    /// Two settings were combined that cannot be used together.
    #[error("Settings '{0}' and '{1}' are mutually exclusive")]
    MutuallyExclusive(&'static str, &'static str),

    /// A setting has a value the engine cannot run with.
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Resume attempted but old output directory {0:?} not found")]
    ResumeWithoutOutput(PathBuf),

    /// The output directory holds the results of a long session and would be wiped.
    #[error("At-risk data found in {0:?}")]
    AtRiskOutput(PathBuf),

    /// Cleaning up an old output directory left files the engine did not create.
    #[error("Output directory cleanup failed at {0:?}")]
    OutputCleanup(PathBuf),

    #[error("No usable test cases in {0:?}")]
    NoSeeds(PathBuf),

    #[error("Test case {path:?} is too big ({len} bytes, limit is {limit})")]
    SeedTooBig {
        path: PathBuf,
        len: u64,
        limit: usize,
    },

    #[error("Test case '{0}' results in a crash")]
    SeedCrashes(String),

    /// In crash mode every seed must crash.
    #[error("Test case '{0}' does not crash")]
    SeedDoesNotCrash(String),

    #[error("Test case '{name}' results in a timeout ({timeout_ms} ms)")]
    SeedTimesOut { name: String, timeout_ms: u64 },

    #[error("No instrumentation detected while running '{0}'")]
    NoInstrumentation(String),

    #[error("All test cases time out or crash, giving up")]
    AllSeedsRejected,

    /// A user dictionary could not be loaded.
    #[error("Dictionary error: {0}")]
    Dictionary(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// Reading or writing `fuzzer_stats` failed.
    #[error("Statistics error: {0}")]
    Stats(String),
}

impl From<std::io::Error> for FuzzError {
    fn from(err: std::io::Error) -> Self {
        FuzzError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for FuzzError {
    fn from(err: serde_json::Error) -> Self {
        FuzzError::Stats(format!("JSON operation error: {err}"))
    }
}

/// Wraps an I/O error with the path it happened on.
pub(crate) fn io_error(path: &std::path::Path, err: std::io::Error) -> FuzzError {
    FuzzError::Io(format!("{}: {}", path.display(), err))
}
