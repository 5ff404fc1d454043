use crate::diagnostics::{error_count, Diagnostic};
use thiserror::Error;
use uuid::Uuid;

/// Failure of the build step.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Invalid compilation options: {0}")]
    InvalidOptions(String),

    #[error("Failed to read source: {0}")]
    Source(#[from] std::io::Error),

    #[error("Failed to parse `{target}`: {} error(s)", error_count(.diagnostics))]
    Parse {
        target: String,
        diagnostics: Vec<Diagnostic>,
    },

    #[error("Failed to emit `{target}`: {} error(s)", error_count(.diagnostics))]
    Emit {
        target: String,
        diagnostics: Vec<Diagnostic>,
    },

    #[error("Background compilation failed: {0}")]
    Background(String),
}

impl CompileError {
    /// Diagnostics carried by the failure, empty for non-compiler failures
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            Self::Parse { diagnostics, .. } | Self::Emit { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }
}

/// Failure to load a binary image into a unit.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Unresolved dependency `{dependency}` required by `{artifact}`")]
    UnresolvedDependency {
        artifact: String,
        dependency: String,
    },

    #[error("Cyclic dependency through `{0}`")]
    CyclicDependency(String),

    #[error("Artifact `{0}` is already loaded in unit {1}")]
    DuplicateArtifact(String, Uuid),

    #[error("Unit {0} is unloading")]
    UnitUnloading(Uuid),

    #[error("Failed to link `{artifact}`: {message}")]
    Link { artifact: String, message: String },
}

impl LoadError {
    pub(crate) fn link(artifact: &str, err: anyhow::Error) -> Self {
        Self::Link {
            artifact: artifact.to_string(),
            message: format!("{:#}", err),
        }
    }
}

/// Failure to use a loaded artifact.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Type not found: {0}")]
    UnknownType(String),

    #[error("Method not found: {class}.{method}")]
    UnknownMethod { class: String, method: String },

    #[error("Field not found: {class}.{field}")]
    UnknownField { class: String, field: String },

    #[error("{method} expects {expected} argument(s), got {found}")]
    Arity {
        method: String,
        expected: usize,
        found: usize,
    },

    #[error("Argument {index} of {method} must be {expected}")]
    ArgumentType {
        method: String,
        index: usize,
        expected: String,
    },

    #[error("{0}")]
    StaticMismatch(String),

    #[error("Cannot return an object of foreign class `{0}`")]
    ForeignObject(String),

    #[error("Export not found: {0}")]
    MissingExport(String),

    #[error("Artifact `{0}` has no entry point")]
    NoEntryPoint(String),

    #[error("Trap occurred: {0}")]
    Trap(String),
}

impl From<anyhow::Error> for InvokeError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(trap) = err.downcast_ref::<wasmtime::Trap>() {
            return Self::Trap(trap.to_string());
        }
        Self::Trap(format!("{:#}", err))
    }
}

/// Failure to load a runtime configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Could not find {0}")]
    NotFound(String),
}

/// Failure of the combined compile-and-load path.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl Error {
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            Self::Compile(err) => err.diagnostics(),
            Self::Load(_) => &[],
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::codes;

    #[test]
    fn test_emit_error_message_counts_errors() {
        let err = CompileError::Emit {
            target: "App".to_string(),
            diagnostics: vec![
                Diagnostic::warning(codes::UNUSED_VARIABLE, "unused"),
                Diagnostic::error(codes::UNKNOWN_TYPE, "unknown type `Foo`"),
            ],
        };
        assert_eq!(err.to_string(), "Failed to emit `App`: 1 error(s)");
        assert_eq!(err.diagnostics().len(), 2);
    }

    #[test]
    fn test_facade_error_is_transparent() {
        let err: Error = LoadError::CyclicDependency("Lib".to_string()).into();
        assert_eq!(err.to_string(), "Cyclic dependency through `Lib`");
        assert!(err.diagnostics().is_empty());
    }
}
