//! Subcommands and the argument groups they share.

pub mod check;
pub mod run;

use clap::{Args, ValueEnum};
use dynrun_core::{
    CompilationOptions, Diagnostic, LanguageVersion, OptimizationLevel, OutputKind,
};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Library,
    Executable,
}

impl From<KindArg> for OutputKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Library => OutputKind::DynamicLibrary,
            KindArg::Executable => OutputKind::Executable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VersionArg {
    V1,
    V2,
}

impl From<VersionArg> for LanguageVersion {
    fn from(version: VersionArg) -> Self {
        match version {
            VersionArg::V1 => LanguageVersion::V1,
            VersionArg::V2 => LanguageVersion::V2,
        }
    }
}

/// Compilation flags common to `check` and `run`
#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Source file to compile
    #[arg(value_name = "FILE")]
    pub source: PathBuf,

    /// Artifact name, derived from the file name when omitted
    #[arg(short, long)]
    pub name: Option<String>,

    /// Reference image to compile against (repeatable)
    #[arg(short = 'r', long = "reference", value_name = "PATH")]
    pub references: Vec<PathBuf>,

    /// Directory searched for dependencies at load time
    #[arg(long, value_name = "DIR")]
    pub dependency_root: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub kind: Option<KindArg>,

    #[arg(long = "language-version", value_enum)]
    pub language_version: Option<VersionArg>,

    /// Compile without constant folding
    #[arg(long)]
    pub debug: bool,

    #[arg(long)]
    pub warnings_as_errors: bool,
}

impl BuildArgs {
    /// Layer the command line flags over the configured defaults
    pub fn options(&self, base: &CompilationOptions) -> CompilationOptions {
        let mut options = base.clone();
        if let Some(name) = &self.name {
            options.target_name = Some(name.clone());
        }
        options.reference_paths.extend(self.references.iter().cloned());
        if let Some(root) = &self.dependency_root {
            options.dependency_root = Some(root.clone());
        }
        if let Some(kind) = self.kind {
            options.output_kind = kind.into();
        }
        if let Some(version) = self.language_version {
            options.language_version = version.into();
        }
        if self.debug {
            options.optimization_level = OptimizationLevel::Debug;
        }
        options.warnings_as_errors |= self.warnings_as_errors;
        options
    }
}

pub fn print_diagnostics(source: &Path, diagnostics: &[Diagnostic], json: bool) {
    if json {
        if let Ok(text) = serde_json::to_string_pretty(diagnostics) {
            println!("{}", text);
        }
        return;
    }
    for diagnostic in diagnostics {
        eprintln!("{}: {}", source.display(), diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(source: &str) -> BuildArgs {
        BuildArgs {
            source: PathBuf::from(source),
            name: None,
            references: Vec::new(),
            dependency_root: None,
            kind: None,
            language_version: None,
            debug: false,
            warnings_as_errors: false,
        }
    }

    #[test]
    fn test_flags_override_config() {
        let base = CompilationOptions::new()
            .with_reference_path("base.wasm")
            .with_warnings_as_errors(true);
        let mut build = args("calc.dyn");
        build.name = Some("Calc".to_string());
        build.references.push(PathBuf::from("extra.wasm"));
        build.kind = Some(KindArg::Executable);
        build.language_version = Some(VersionArg::V1);
        build.debug = true;

        let options = build.options(&base);
        assert_eq!(options.target_name.as_deref(), Some("Calc"));
        assert_eq!(
            options.reference_paths,
            vec![PathBuf::from("base.wasm"), PathBuf::from("extra.wasm")]
        );
        assert_eq!(options.output_kind, OutputKind::Executable);
        assert_eq!(options.language_version, LanguageVersion::V1);
        assert_eq!(options.optimization_level, OptimizationLevel::Debug);
        assert!(options.warnings_as_errors);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let base = CompilationOptions::new().with_output_kind(OutputKind::Executable);
        assert_eq!(args("calc.dyn").options(&base), base);
    }
}
