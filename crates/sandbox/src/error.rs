use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors emitted by the execution sandbox.
/// 執行沙箱可能產生的錯誤。
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to compile {path}: {reason}")]
    Compile { path: PathBuf, reason: String },
    #[error("module {path} failed during execution: {reason}")]
    Execution { path: PathBuf, reason: String },
    #[error("call to '{function}' exported by {path} failed: {reason}")]
    Call {
        path: PathBuf,
        function: String,
        reason: String,
    },
    #[error("invalid function name '{0}'")]
    InvalidFunctionName(String),
    #[error("module not found: {0}")]
    ModuleNotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
