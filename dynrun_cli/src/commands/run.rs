//! Compile a source file, load it and invoke a method or its entry point.

use super::{print_diagnostics, BuildArgs};
use crate::error::CliError;
use dynrun_core::{
    CompilationOptions, InvokeError, LoadedArtifact, Orchestrator, SourceInput, UnloadReport,
    Value,
};
use serde_json::json;
use tracing::{debug, info};

/// What to call once the artifact is loaded
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub type_name: Option<String>,
    pub method: Option<String>,
    pub args: Vec<String>,
}

/// A returned value, rendered while its unit is still loaded
#[derive(Debug, Clone, PartialEq)]
struct Outcome {
    text: Option<String>,
    json: serde_json::Value,
}

impl Outcome {
    /// Takes the value so an object handle is released here
    fn render(value: Value) -> Self {
        let json = match &value {
            Value::Int(v) => json!(v),
            Value::Bool(v) => json!(v),
            Value::Void => serde_json::Value::Null,
            Value::Object(_) => json!(value.to_string()),
        };
        let text = (value != Value::Void).then(|| value.to_string());
        Self { text, json }
    }
}

/// Execute the run command.
pub fn execute(
    orchestrator: Orchestrator,
    build: &BuildArgs,
    base: &CompilationOptions,
    isolate: bool,
    invocation: &Invocation,
    json: bool,
) -> Result<(), CliError> {
    let (outcome, report) = run(orchestrator, build, base, isolate, invocation, json)?;
    print_outcome(&outcome, &report, json)
}

/// Compile, load and invoke, then unload.
///
/// Every handle into the unit is gone before the orchestrator unloads, so an
/// isolated unit is normally reported as unloaded.
fn run(
    orchestrator: Orchestrator,
    build: &BuildArgs,
    base: &CompilationOptions,
    isolate: bool,
    invocation: &Invocation,
    json: bool,
) -> Result<(Outcome, UnloadReport), CliError> {
    let options = build.options(base);
    let artifact =
        match orchestrator.compile_and_load(SourceInput::from_path(&build.source), &options, isolate) {
            Ok(artifact) => artifact,
            Err(err) => {
                print_diagnostics(&build.source, err.diagnostics(), json);
                return Err(err.into());
            }
        };
    info!(
        "Loaded {} ({})",
        artifact.name(),
        if artifact.is_isolated() { "isolated" } else { "host" }
    );

    let outcome = invoke(&artifact, invocation).map(Outcome::render);
    drop(artifact);
    let report = orchestrator.release();
    Ok((outcome?, report))
}

fn invoke(artifact: &LoadedArtifact, invocation: &Invocation) -> Result<Value, CliError> {
    let args = invocation
        .args
        .iter()
        .map(|arg| parse_value(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let (type_name, method) = match (&invocation.type_name, &invocation.method) {
        (Some(type_name), Some(method)) => (type_name, method),
        (None, None) => {
            if !args.is_empty() {
                return Err(CliError::InvalidArguments(
                    "the entry point takes no arguments".to_string(),
                ));
            }
            return Ok(artifact.run()?);
        }
        _ => {
            return Err(CliError::InvalidArguments(
                "--type and --method must be given together".to_string(),
            ))
        }
    };

    let ty = artifact
        .get_type(type_name)
        .ok_or_else(|| InvokeError::UnknownType(type_name.clone()))?;
    let is_static = ty
        .methods()
        .iter()
        .find(|info| &info.name == method)
        .map(|info| info.is_static)
        .ok_or_else(|| InvokeError::UnknownMethod {
            class: type_name.clone(),
            method: method.clone(),
        })?;

    debug!("Invoking {}.{} with {} argument(s)", type_name, method, args.len());
    let value = if is_static {
        ty.invoke_static(method, &args)?
    } else {
        ty.create_instance()?.invoke(method, &args)?
    };
    Ok(value)
}

/// Command line arguments are `true`, `false` or 32-bit integers
fn parse_value(arg: &str) -> Result<Value, CliError> {
    match arg {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        _ => arg
            .parse::<i32>()
            .map(Value::Int)
            .map_err(|_| CliError::InvalidArguments(format!("`{}` is not an int or bool", arg))),
    }
}

fn print_outcome(outcome: &Outcome, report: &UnloadReport, json: bool) -> Result<(), CliError> {
    if json {
        let output = json!({ "value": outcome.json, "unload": report });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if let Some(text) = &outcome.text {
        println!("{}", text);
    }
    if report.units_unloaded > 0 || report.units_still_alive > 0 {
        println!(
            "Unloaded {} unit(s), {} still alive",
            report.units_unloaded, report.units_still_alive
        );
    }
    Ok(())
}
