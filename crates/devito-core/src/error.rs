//! Error types for devito-core.

use devito_cache::{Abandoned, CacheError};
use devito_graph::{AnalyzeError, RuntimeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One compiler diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub text: String,
}

/// The compiler reported errors and produced no usable output.
///
/// Also the payload of the bus `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileFailure {
    pub message: String,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            diagnostics: Vec::new(),
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: Diagnostic) -> Self {
        self.diagnostics.push(diagnostic);
        self
    }
}

impl fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for d in &self.diagnostics {
            match (&d.file, d.line, d.column) {
                (Some(file), Some(line), Some(col)) => write!(f, "\n  {file}:{line}:{col}: {}", d.text)?,
                (Some(file), _, _) => write!(f, "\n  {file}: {}", d.text)?,
                _ => write!(f, "\n  {}", d.text)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for CompileFailure {}

/// Errors surfaced by builds and on-demand artifacts.
///
/// Clone so a single build result can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("{0}")]
    Compile(CompileFailure),

    /// Superseded by a newer generation before settling. Consumed inside the
    /// coordinator; callers of `wait_for_build` never see it.
    #[error("build {generation} interrupted by a newer build")]
    Interrupted { generation: u64 },

    #[error("compiler produced no output")]
    NoOutput,

    #[error("watch error: {0}")]
    Watch(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("analysis failed: {0}")]
    Analyze(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl BuildError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, BuildError::Interrupted { .. })
    }

    /// Payload for the bus `error` message.
    pub fn to_failure(&self) -> CompileFailure {
        match self {
            BuildError::Compile(failure) => failure.clone(),
            other => CompileFailure::new(other.to_string()),
        }
    }
}

impl From<CompileFailure> for BuildError {
    fn from(failure: CompileFailure) -> Self {
        BuildError::Compile(failure)
    }
}

impl From<Abandoned> for BuildError {
    fn from(_: Abandoned) -> Self {
        BuildError::Interrupted { generation: 0 }
    }
}

impl From<AnalyzeError> for BuildError {
    fn from(err: AnalyzeError) -> Self {
        BuildError::Analyze(err.to_string())
    }
}

impl From<RuntimeError> for BuildError {
    fn from(err: RuntimeError) -> Self {
        BuildError::Runtime(err.to_string())
    }
}

impl From<notify::Error> for BuildError {
    fn from(err: notify::Error) -> Self {
        BuildError::Watch(err.to_string())
    }
}

/// A bus send to one client failed. Logged and isolated to that client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("client {0} disconnected")]
    Closed(u64),

    #[error("client {0} did not accept the message in time")]
    Timeout(u64),
}

impl TransportFailure {
    pub fn client_id(&self) -> u64 {
        match self {
            TransportFailure::Closed(id) | TransportFailure::Timeout(id) => *id,
        }
    }
}

/// Result type for devito-core operations.
pub type Result<T> = std::result::Result<T, BuildError>;
