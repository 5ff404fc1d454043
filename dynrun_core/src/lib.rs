//! Compile class-language sources to WebAssembly artifacts and run them either
//! in the shared host context or in isolated, collectible units.

pub mod artifact;
pub mod builder;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod frontend;
pub mod host;
pub mod image;
pub mod isolation;
pub mod orchestrator;
pub mod runtime;
pub mod source;
pub mod tracker;

pub use artifact::{ArtifactType, LoadedArtifact, ObjectHandle, Value};
pub use builder::ArtifactBuilder;
pub use config::{
    CompilationOptions, LanguageVersion, OptimizationLevel, OutputKind, RuntimeConfig,
    UnitLimits, UnloadPolicy, YieldStrategy,
};
pub use diagnostics::{Diagnostic, Location, Severity};
pub use error::{CompileError, ConfigError, Error, InvokeError, LoadError, Result};
pub use frontend::{ClassFrontend, Frontend};
pub use host::HostContext;
pub use image::{BinaryImage, ImageMetadata};
pub use isolation::{DependencyResolver, IsolationUnit, UnitOptions, UnitState};
pub use orchestrator::Orchestrator;
pub use source::SourceInput;
pub use tracker::{LifecycleTracker, ObservationHandle, UnloadReport, UnloadStatus};
