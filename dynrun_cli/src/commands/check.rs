//! Compile a source file and report its diagnostics.

use super::{print_diagnostics, BuildArgs};
use crate::error::CliError;
use dynrun_core::{CompilationOptions, Orchestrator, SourceInput};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Execute the check command, writing the image to `output` when given
pub fn execute(
    orchestrator: &Orchestrator,
    build: &BuildArgs,
    base: &CompilationOptions,
    output: Option<PathBuf>,
    json: bool,
) -> Result<(), CliError> {
    let options = build.options(base);
    let image = match orchestrator.compile(SourceInput::from_path(&build.source), &options) {
        Ok(image) => image,
        Err(err) => {
            print_diagnostics(&build.source, err.diagnostics(), json);
            return Err(err.into());
        }
    };
    print_diagnostics(&build.source, image.diagnostics(), json);

    if let Some(path) = output {
        fs::write(&path, image.as_bytes())?;
        info!("Wrote {} to {}", image.name(), path.display());
    }
    if !json {
        println!(
            "{}: ok ({} bytes, {} class(es))",
            image.name(),
            image.len(),
            image.metadata().classes.len()
        );
    }
    Ok(())
}
