use std::io;
use std::path::PathBuf;

use thiserror::Error;
use verlay_sandbox::SandboxError;

/// Errors raised while loading a configuration file.
/// 載入設定檔時可能發生的錯誤。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid ignore pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors raised by the version tree engine.
/// 版本樹引擎可能產生的錯誤。
#[derive(Debug, Error)]
pub enum VerlayError {
    /// A source or target root is missing or unreadable.
    #[error("invalid root {path}: {reason}")]
    Configuration { path: PathBuf, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Re-synthesizing one leaf failed; the build recovers from this.
    #[error("failed to synthesize {path}: {source}")]
    Synthesis {
        path: PathBuf,
        #[source]
        source: Box<VerlayError>,
    },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("module not found: {0}")]
    ModuleNotFound(PathBuf),
    #[error("circular import through {0}")]
    CircularImport(PathBuf),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("version tree has not been built")]
    NotBuilt,
}

impl VerlayError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        VerlayError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<VerlayError> for SandboxError {
    fn from(err: VerlayError) -> Self {
        match err {
            VerlayError::Sandbox(inner) => inner,
            VerlayError::ModuleNotFound(path) => SandboxError::ModuleNotFound(path),
            VerlayError::Io { path, source } => SandboxError::Read { path, source },
            VerlayError::CircularImport(path) => SandboxError::Execution {
                reason: format!("circular import through {}", path.display()),
                path,
            },
            other => SandboxError::Execution {
                path: PathBuf::new(),
                reason: other.to_string(),
            },
        }
    }
}
