//! Error types for the dynrun CLI.

use dynrun_core::{CompileError, ConfigError, Error, InvokeError, LoadError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid command arguments: {0}")]
    InvalidArguments(String),
}

impl From<Error> for CliError {
    fn from(err: Error) -> Self {
        match err {
            Error::Compile(err) => Self::Compile(err),
            Error::Load(err) => Self::Load(err),
        }
    }
}
