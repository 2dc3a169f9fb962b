//! Error types for the CQF services

use thiserror::Error;

/// Result type for CQF operations
pub type CqfResult<T> = Result<T, CqfError>;

/// A single diagnostic reported by the CQL compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerDiagnostic {
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl CompilerDiagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl std::fmt::Display for CompilerDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "[{line}:{column}] {}", self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

/// Errors that can occur during CQF operations
#[derive(Debug, Error)]
pub enum CqfError {
    /// Malformed or missing input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing measure, library, or pool for a data type
    #[error("Not found: {0}")]
    NotFound(String),

    /// Library id already cached under another version
    #[error(
        "Could not load library {id}, version {requested} because version {loaded} is already loaded"
    )]
    VersionConflict {
        id: String,
        requested: String,
        loaded: String,
    },

    /// Library compilation failed; every diagnostic is kept
    #[error("Errors occurred compiling library {library}: {}", join_diagnostics(.diagnostics))]
    CompileFailure {
        library: String,
        diagnostics: Vec<CompilerDiagnostic>,
    },

    /// Unexpected evaluation or infrastructure fault
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] octofhir_storage::StorageError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CqfError {
    /// OperationOutcome issue code the boundary layer should report.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid",
            Self::NotFound(_) => "not-found",
            Self::VersionConflict { .. } => "conflict",
            Self::CompileFailure { .. } => "processing",
            Self::Storage(e) if e.is_not_found() => "not-found",
            Self::InternalError(_) | Self::Storage(_) | Self::Serialization(_) => "exception",
        }
    }
}

impl From<anyhow::Error> for CqfError {
    fn from(err: anyhow::Error) -> Self {
        CqfError::InternalError(format!("{err:#}"))
    }
}

fn join_diagnostics(diagnostics: &[CompilerDiagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
