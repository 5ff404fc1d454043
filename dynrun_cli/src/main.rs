//! dynrun - compile class-language sources at run time and run them in
//! unloadable isolation units.

mod commands;
mod error;

use clap::{ArgAction, Parser, Subcommand};
use commands::{run::Invocation, BuildArgs};
use dynrun_core::{ConfigError, Orchestrator, RuntimeConfig};
use error::CliError;
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dynrun")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compile sources at run time and load them into unloadable units", long_about = None)]
struct Cli {
    /// Sets the level of verbosity
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Configuration file, `DynRun.toml` is searched for when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compile a source file and print its diagnostics
    Check {
        #[command(flatten)]
        build: BuildArgs,

        /// Write the compiled image to this path
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Compile, load and invoke a source file
    Run {
        #[command(flatten)]
        build: BuildArgs,

        /// Load into a fresh isolation unit instead of the host context
        #[arg(long)]
        isolate: bool,

        /// Class to invoke, the entry point runs when omitted
        #[arg(short, long = "type", value_name = "CLASS")]
        type_name: Option<String>,

        #[arg(short, long)]
        method: Option<String>,

        /// Method arguments: integers, `true` or `false`
        #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig, CliError> {
    match path {
        Some(path) => Ok(RuntimeConfig::load(path)?),
        None => match RuntimeConfig::from_project_root() {
            Ok(config) => Ok(config),
            Err(ConfigError::NotFound(name)) => {
                debug!("No {} found, using defaults", name);
                Ok(RuntimeConfig::default())
            }
            Err(err) => Err(err.into()),
        },
    }
}

fn execute(cli: Cli) -> Result<(), CliError> {
    let config = load_config(cli.config.as_ref())?;
    let orchestrator = Orchestrator::from_config(&config);

    match cli.command {
        Commands::Check { build, output } => {
            commands::check::execute(&orchestrator, &build, &config.compilation, output, cli.json)
        }
        Commands::Run {
            build,
            isolate,
            type_name,
            method,
            args,
        } => {
            let invocation = Invocation {
                type_name,
                method,
                args,
            };
            commands::run::execute(
                orchestrator,
                &build,
                &config.compilation,
                isolate,
                &invocation,
                cli.json,
            )
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = execute(cli) {
        error!("{}", err);
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "dynrun",
            "run",
            "demos/calculator.dyn",
            "--isolate",
            "--type",
            "Calculator",
            "--method",
            "Sum",
            "2",
            "-40",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                build,
                isolate,
                type_name,
                method,
                args,
            } => {
                assert_eq!(build.source, PathBuf::from("demos/calculator.dyn"));
                assert!(isolate);
                assert_eq!(type_name.as_deref(), Some("Calculator"));
                assert_eq!(method.as_deref(), Some("Sum"));
                assert_eq!(args, vec!["2".to_string(), "-40".to_string()]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_check_arguments() {
        let cli = Cli::try_parse_from([
            "dynrun",
            "--json",
            "check",
            "app.dyn",
            "-r",
            "shapes.wasm",
            "-r",
            "core.wasm",
            "--kind",
            "executable",
            "--language-version",
            "v1",
        ])
        .unwrap();

        assert!(cli.json);
        match cli.command {
            Commands::Check { build, output } => {
                assert_eq!(build.references.len(), 2);
                assert_eq!(build.kind, Some(commands::KindArg::Executable));
                assert_eq!(build.language_version, Some(commands::VersionArg::V1));
                assert!(output.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("DynRun.toml");
        fs::write(&path, "[unload]\nmax_attempts = 4\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.unload.max_attempts, 4);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            load_config(Some(&missing)),
            Err(CliError::Config(ConfigError::Io(_)))
        ));
    }
}
