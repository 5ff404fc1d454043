//! Configuration for compilation, isolation units and unload confirmation.
//!
//! All values deserialize from TOML with documented defaults, so a
//! `DynRun.toml` only needs to name the fields it changes:
//!
//! ```toml
//! [compilation]
//! output_kind = "executable"
//! reference_paths = ["libs/Geometry.wasm"]
//!
//! [unload]
//! max_attempts = 20
//! yield_strategy = { kind = "sleep", millis = 5 }
//! ```

use crate::error::{CompileError, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file searched by [`RuntimeConfig::from_project_root`]
pub const CONFIG_FILE_NAME: &str = "DynRun.toml";

/// Default number of confirmation rounds before a unit is reported still alive
pub const DEFAULT_MAX_UNLOAD_ATTEMPTS: u32 = 10;

/// Default per-unit linear memory cap
pub const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

/// Version of the source language accepted by the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LanguageVersion {
    /// Block-bodied members only
    #[serde(rename = "v1")]
    V1,
    /// Adds expression-bodied members and `while` loops
    #[serde(rename = "v2", alias = "latest")]
    V2,
}

impl LanguageVersion {
    pub const LATEST: Self = Self::V2;
}

impl Default for LanguageVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Requires a static `Main` entry point
    Executable,
    #[default]
    DynamicLibrary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    Debug,
    #[default]
    Release,
}

/// Options for a single compile call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilationOptions {
    /// Name of the produced image; derived from the input when absent
    pub target_name: Option<String>,

    pub language_version: LanguageVersion,

    pub output_kind: OutputKind,

    pub optimization_level: OptimizationLevel,

    /// Extra reference images, resolved at compile time
    pub reference_paths: Vec<PathBuf>,

    /// Treat every warning as an error
    pub warnings_as_errors: bool,

    /// Resolution root for load-time dependencies of an isolated load.
    /// Falls back to the first reference path.
    pub dependency_root: Option<PathBuf>,
}

impl CompilationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = Some(name.into());
        self
    }

    pub fn with_language_version(mut self, version: LanguageVersion) -> Self {
        self.language_version = version;
        self
    }

    pub fn with_output_kind(mut self, kind: OutputKind) -> Self {
        self.output_kind = kind;
        self
    }

    pub fn with_optimization_level(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    pub fn with_reference_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.reference_paths.push(path.into());
        self
    }

    pub fn with_warnings_as_errors(mut self, enabled: bool) -> Self {
        self.warnings_as_errors = enabled;
        self
    }

    pub fn with_dependency_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.dependency_root = Some(root.into());
        self
    }

    /// Validate the explicitly configured fields
    pub fn validate(&self) -> Result<(), CompileError> {
        if let Some(name) = &self.target_name {
            if !is_identifier(name) {
                return Err(CompileError::InvalidOptions(format!(
                    "target name `{}` is not an identifier",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Resolve the target name, deriving it from the input when absent.
    ///
    /// Paths use their sanitized file stem; buffers and streams get a
    /// `submission_` name derived from a hash of their content, so identical
    /// input yields an identical name.
    pub fn resolve_target_name(
        &self,
        origin: Option<&Path>,
        content: &[u8],
    ) -> Result<String, CompileError> {
        self.validate()?;
        if let Some(name) = &self.target_name {
            return Ok(name.clone());
        }

        let name = match origin {
            Some(path) => path
                .file_stem()
                .map(|stem| sanitize_identifier(&stem.to_string_lossy()))
                .unwrap_or_default(),
            None => {
                let mut hasher = DefaultHasher::new();
                content.hash(&mut hasher);
                format!("submission_{:016x}", hasher.finish())
            }
        };

        if name.is_empty() {
            return Err(CompileError::InvalidOptions(
                "target name is empty after defaulting".to_string(),
            ));
        }
        Ok(name)
    }

    /// Load-time resolution root for isolated loads
    pub fn resolution_root(&self) -> Option<&Path> {
        self.dependency_root
            .as_deref()
            .or_else(|| self.reference_paths.first().map(PathBuf::as_path))
    }
}

/// How the confirmation loop gives other work a chance to release references
/// between liveness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum YieldStrategy {
    None,
    Yield,
    Sleep { millis: u64 },
}

impl Default for YieldStrategy {
    fn default() -> Self {
        Self::Yield
    }
}

impl YieldStrategy {
    /// Block the current thread according to the strategy
    pub fn pause(&self) {
        match self {
            Self::None => {}
            Self::Yield => std::thread::yield_now(),
            Self::Sleep { millis } => std::thread::sleep(Duration::from_millis(*millis)),
        }
    }
}

/// Bounds for unload confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnloadPolicy {
    pub max_attempts: u32,
    pub yield_strategy: YieldStrategy,
}

impl Default for UnloadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_UNLOAD_ATTEMPTS,
            yield_strategy: YieldStrategy::default(),
        }
    }
}

/// Resource limits applied to every isolation unit's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitLimits {
    /// Maximum linear memory size in bytes
    pub memory_limit: usize,
}

impl Default for UnitLimits {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub compilation: CompilationOptions,
    pub unload: UnloadPolicy,
    pub unit: UnitLimits,
}

impl RuntimeConfig {
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(config_path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn from_project_root() -> Result<Self, ConfigError> {
        // Try to find DynRun.toml in current directory or parent directories
        let mut current_dir = std::env::current_dir()?;

        loop {
            let config_path = current_dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load(config_path);
            }

            if !current_dir.pop() {
                break;
            }
        }

        Err(ConfigError::NotFound(CONFIG_FILE_NAME.to_string()))
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn sanitize_identifier(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}
