mod compile;
mod process;
mod testing;

pub use compile::compile;
pub use process::{BoundedCommand, Capture, ProcessOutput, run_bounded};
pub use testing::{TIMEOUT_MARKER, run_test, test_selector};

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Faults that are never the submitter's doing
///
/// These abort the pipeline and are reported verbatim to the operator.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("{context}: a directory that should exist does not exist\n{}", .path.display())]
    MissingDirectory {
        context: &'static str,
        path: PathBuf,
    },

    #[error("{context}: a file that should exist does not exist\n{}", .path.display())]
    MissingFile {
        context: &'static str,
        path: PathBuf,
    },

    #[error("{}\ncaused by: {command}\nreturn code: {}", .output.trim(), return_code(.code))]
    CommandFailed {
        command: String,
        output: String,
        code: Option<i32>,
    },

    #[error("could not launch {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} did not finish within {} seconds", .limit.as_secs_f64())]
    TimedOut { command: String, limit: Duration },

    #[error("{context}: {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("grading was cancelled")]
    Cancelled,
}

fn return_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_string(), |c| c.to_string())
}

/// Outcome of one compile invocation over a list of files
#[derive(Debug)]
pub enum BuildResult {
    Success,
    /// Submitted code did not compile; `output` is the verbatim compiler diagnostic
    CompileFailure { file: String, output: String },
    InfrastructureError(SystemError),
}

/// Outcome of one test unit
#[derive(Debug)]
pub enum TestRunResult {
    Success { report: String },
    TestFailure { report: String },
    Timeout { stderr: String },
    InfrastructureError(SystemError),
}
