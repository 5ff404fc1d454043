use crate::config::CompilationOptions;
use crate::diagnostics::{
    codes, error_count, escalate_warnings, has_errors, warning_count, Diagnostic,
};
use crate::error::CompileError;
use crate::frontend::{ClassFrontend, EmitOptions, Frontend};
use crate::host::HostContext;
use crate::image::BinaryImage;
use crate::source::SourceInput;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns source text into a [`BinaryImage`] through a [`Frontend`].
///
/// The builder reads the host reference set but never changes it, so one
/// builder may serve any number of compilations.
pub struct ArtifactBuilder<F: Frontend = ClassFrontend> {
    frontend: Arc<F>,
    host: Arc<HostContext>,
}

impl<F: Frontend> Clone for ArtifactBuilder<F> {
    fn clone(&self) -> Self {
        Self {
            frontend: self.frontend.clone(),
            host: self.host.clone(),
        }
    }
}

impl<F: Frontend> fmt::Debug for ArtifactBuilder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactBuilder")
            .field("frontend", &self.frontend)
            .finish_non_exhaustive()
    }
}

impl ArtifactBuilder<ClassFrontend> {
    /// Create a builder for the bundled class language
    pub fn new(host: Arc<HostContext>) -> Self {
        Self::with_frontend(ClassFrontend::new(), host)
    }
}

impl<F: Frontend> ArtifactBuilder<F> {
    pub fn with_frontend(frontend: F, host: Arc<HostContext>) -> Self {
        Self {
            frontend: Arc::new(frontend),
            host,
        }
    }

    /// The same frontend on another host
    pub(crate) fn rehost(&self, host: Arc<HostContext>) -> Self {
        Self {
            frontend: self.frontend.clone(),
            host,
        }
    }

    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    /// Compile one source into an image.
    ///
    /// Either every error-free step succeeds and the image is returned at
    /// offset 0, or a [`CompileError`] carries all diagnostics collected so
    /// far. The source is consumed and released before this returns.
    pub fn build(
        &self,
        source: SourceInput,
        options: &CompilationOptions,
    ) -> Result<BinaryImage, CompileError> {
        options.validate()?;

        let origin = source.origin().map(|path| path.to_path_buf());
        let content = source.read_all()?;
        let target = options.resolve_target_name(origin.as_deref(), &content)?;
        info!("Compiling {} ({} bytes)", target, content.len());

        let text = match String::from_utf8(content) {
            Ok(text) => text,
            Err(err) => {
                let diagnostics = vec![Diagnostic::error(
                    codes::INVALID_ENCODING,
                    format!("source is not valid UTF-8: {}", err),
                )];
                return Err(self.fail_parse(target, diagnostics));
            }
        };

        let tree = match self.frontend.parse(&text, options.language_version) {
            Ok(tree) => tree,
            Err(diagnostics) => return Err(self.fail_parse(target, diagnostics)),
        };

        let base = self.host.reference_set();
        let (references, mut diagnostics) = self
            .frontend
            .resolve_references(&base, &options.reference_paths);
        debug!(
            "Compiling {} against {} reference(s)",
            target,
            references.len()
        );

        let emit_options = EmitOptions {
            target_name: target.clone(),
            output_kind: options.output_kind,
            optimization_level: options.optimization_level,
            language_version: options.language_version,
        };
        let result = self.frontend.emit(&tree, &references, &emit_options);
        diagnostics.extend(result.diagnostics);

        if options.warnings_as_errors {
            escalate_warnings(&mut diagnostics);
        }
        for diagnostic in &diagnostics {
            debug!("{}: {}", target, diagnostic);
        }

        if !result.success || has_errors(&diagnostics) {
            info!(
                "Compilation of {} failed with {} error(s)",
                target,
                error_count(&diagnostics)
            );
            return Err(CompileError::Emit {
                target,
                diagnostics,
            });
        }

        let image = BinaryImage::from_bytes(result.image_bytes).map_err(|err| {
            CompileError::Emit {
                target: target.clone(),
                diagnostics: vec![Diagnostic::error(
                    codes::ASSEMBLY_FAILED,
                    format!("emitted image is unreadable: {}", err),
                )],
            }
        })?;
        info!(
            "Compiled {} ({} bytes, {} warning(s))",
            target,
            image.len(),
            warning_count(&diagnostics)
        );
        Ok(image.with_diagnostics(diagnostics))
    }

    /// Run [`build`](Self::build) on tokio's blocking pool
    pub async fn build_async(
        &self,
        source: SourceInput,
        options: CompilationOptions,
    ) -> Result<BinaryImage, CompileError> {
        let builder = self.clone();
        tokio::task::spawn_blocking(move || builder.build(source, &options))
            .await
            .map_err(|err| CompileError::Background(err.to_string()))?
    }

    fn fail_parse(&self, target: String, diagnostics: Vec<Diagnostic>) -> CompileError {
        for diagnostic in &diagnostics {
            debug!("{}: {}", target, diagnostic);
        }
        info!(
            "Parsing {} failed with {} error(s)",
            target,
            error_count(&diagnostics)
        );
        CompileError::Parse {
            target,
            diagnostics,
        }
    }
}
