//! Compiler frontend seam.
//!
//! The [`Frontend`] trait is the boundary between the artifact builder and a
//! language implementation. [`ClassFrontend`] is the bundled implementation for
//! the small class-based `.dyn` language, lowering to WebAssembly.

pub mod ast;
mod lexer;
mod lower;
mod parser;
mod symbols;

use crate::config::{LanguageVersion, OptimizationLevel, OutputKind};
use crate::diagnostics::{codes, has_errors, Diagnostic};
use crate::image::{append_custom_section, BinaryImage, ImageMetadata, METADATA_SECTION};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

pub use lower::ENTRY_EXPORT;

/// Where a compile-time reference came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceOrigin {
    /// The `core` library every compilation sees
    BaseRuntime,
    /// An image loaded into the host default context
    Host,
    /// An explicit reference path
    Path(PathBuf),
}

/// A library whose public classes a compilation may use
#[derive(Debug, Clone)]
pub struct ReferenceBinary {
    pub name: String,
    pub origin: ReferenceOrigin,
    pub metadata: ImageMetadata,
}

#[derive(Debug, Clone)]
pub struct EmitOptions {
    pub target_name: String,
    pub output_kind: OutputKind,
    pub optimization_level: OptimizationLevel,
    pub language_version: LanguageVersion,
}

#[derive(Debug, Clone, Default)]
pub struct EmitResult {
    pub success: bool,
    pub diagnostics: Vec<Diagnostic>,
    /// Empty unless `success`
    pub image_bytes: Vec<u8>,
}

impl EmitResult {
    fn failed(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            success: false,
            diagnostics,
            image_bytes: Vec::new(),
        }
    }
}

/// A language implementation the builder drives.
pub trait Frontend: Send + Sync + fmt::Debug + 'static {
    /// Parsed form of one source text
    type Syntax;

    /// Parse source text. Any error diagnostic fails the parse; warnings may
    /// accompany a successful one only through `emit`.
    fn parse(&self, text: &str, version: LanguageVersion) -> Result<Self::Syntax, Vec<Diagnostic>>;

    /// Combine the base reference set with explicit reference paths.
    /// Problems are reported as diagnostics, never as faults.
    fn resolve_references(
        &self,
        base: &[ReferenceBinary],
        explicit: &[PathBuf],
    ) -> (Vec<ReferenceBinary>, Vec<Diagnostic>);

    /// Check and lower a parsed unit to image bytes
    fn emit(
        &self,
        syntax: &Self::Syntax,
        references: &[ReferenceBinary],
        options: &EmitOptions,
    ) -> EmitResult;
}

/// Frontend for the bundled class language
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassFrontend;

impl ClassFrontend {
    pub fn new() -> Self {
        Self
    }
}

impl Frontend for ClassFrontend {
    type Syntax = ast::CompilationUnit;

    fn parse(&self, text: &str, version: LanguageVersion) -> Result<Self::Syntax, Vec<Diagnostic>> {
        parser::parse(text, version)
    }

    fn resolve_references(
        &self,
        base: &[ReferenceBinary],
        explicit: &[PathBuf],
    ) -> (Vec<ReferenceBinary>, Vec<Diagnostic>) {
        let mut references = Vec::with_capacity(base.len() + explicit.len());
        let mut diagnostics = Vec::new();
        let mut names = BTreeSet::new();

        for reference in base {
            if names.insert(reference.name.clone()) {
                references.push(reference.clone());
            }
        }

        for path in explicit {
            if !path.exists() {
                diagnostics.push(Diagnostic::error(
                    codes::REFERENCE_NOT_FOUND,
                    format!("reference `{}` was not found", path.display()),
                ));
                continue;
            }
            let image = match BinaryImage::from_file(path) {
                Ok(image) => image,
                Err(err) => {
                    diagnostics.push(Diagnostic::error(
                        codes::INVALID_REFERENCE,
                        format!("reference `{}` is not a valid image: {}", path.display(), err),
                    ));
                    continue;
                }
            };
            let metadata = image.metadata().clone();
            if !names.insert(metadata.name.clone()) {
                diagnostics.push(Diagnostic::warning(
                    codes::DUPLICATE_REFERENCE,
                    format!(
                        "library `{}` is referenced more than once; `{}` is ignored",
                        metadata.name,
                        path.display()
                    ),
                ));
                continue;
            }
            debug!("Resolved reference {} from {}", metadata.name, path.display());
            references.push(ReferenceBinary {
                name: metadata.name.clone(),
                origin: ReferenceOrigin::Path(path.clone()),
                metadata,
            });
        }

        (references, diagnostics)
    }

    fn emit(
        &self,
        syntax: &Self::Syntax,
        references: &[ReferenceBinary],
        options: &EmitOptions,
    ) -> EmitResult {
        let mut diagnostics = Vec::new();
        let symbols =
            symbols::SymbolTable::build(syntax, &options.target_name, references, &mut diagnostics);
        let module = lower::lower(syntax, &symbols, options, &mut diagnostics);
        if has_errors(&diagnostics) {
            return EmitResult::failed(diagnostics);
        }

        let mut bytes = match wat::parse_str(&module.wat) {
            Ok(bytes) => bytes,
            Err(err) => {
                diagnostics.push(Diagnostic::error(
                    codes::ASSEMBLY_FAILED,
                    format!("failed to assemble `{}`: {}", options.target_name, err),
                ));
                return EmitResult::failed(diagnostics);
            }
        };
        match module.metadata.encode() {
            Ok(encoded) => append_custom_section(&mut bytes, METADATA_SECTION, &encoded),
            Err(err) => {
                diagnostics.push(Diagnostic::error(
                    codes::ASSEMBLY_FAILED,
                    format!("failed to encode metadata of `{}`: {}", options.target_name, err),
                ));
                return EmitResult::failed(diagnostics);
            }
        }

        EmitResult {
            success: true,
            diagnostics,
            image_bytes: bytes,
        }
    }
}
