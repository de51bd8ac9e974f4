//! # jsexec CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Start a worker on the in-memory broker with a lightweight engine pool
//! jsexec run --engine-mode lightweight --max-active-scripts 500
//!
//! # Same, configured from the environment
//! JSEXEC_USE_SANDBOX=false JSEXEC_MAX_ACTIVE_SCRIPTS=500 jsexec run
//!
//! # Run a script body once locally (prints the result to stdout)
//! jsexec eval '(a, b) => a * b' 6 7
//! ```

use anyhow::Result;
use argh::FromArgs;
use jsexec_cli::settings::{process_env, RunArgs};
use jsexec_cli::worker;
use jsexec_server::{BoaEngine, ResourceLimits};
use std::process::ExitCode;
use std::time::Duration;

#[derive(FromArgs)]
/// jsexec - remote script execution worker
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Run(RunArgs),
    Eval(EvalArgs),
}

/// Arguments for running a single script locally.
///
/// Compiles the body and executes it once in a sandboxed engine, printing the
/// result string to stdout. Errors go to stderr with a non-zero exit code.
#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "eval")]
/// compile and run a script body once, printing the result
struct EvalArgs {
    /// script body, e.g. '(a, b) => a + b'
    #[argh(positional)]
    body: String,

    /// positional arguments; json text is parsed, anything else is passed as a string
    #[argh(positional)]
    args: Vec<String>,

    /// execution timeout in milliseconds
    #[argh(option, short = 't', default = "5000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli: Cli = argh::from_env();

    // eval keeps stdout clean for piping
    if !matches!(cli.command, Commands::Eval(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let outcome = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Eval(args) => eval(args).await.map(|_| ExitCode::SUCCESS),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let config = args.resolve(&process_env)?;
    let reason = worker::run(config).await?;
    Ok(reason.exit_code())
}

async fn eval(args: EvalArgs) -> Result<()> {
    let limits = ResourceLimits::default().with_execution_timeout(Duration::from_millis(args.timeout_ms));
    let engine = BoaEngine::sandboxed(limits);
    let result = worker::eval_once(&engine, &args.body, &args.args).await?;
    println!("{}", result);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run_defaults() {
        let args: Cli = Cli::from_args(&["jsexec"], &["run"]).unwrap();
        match args.command {
            Commands::Run(run) => assert_eq!(run, RunArgs::default()),
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parse_run_with_options() {
        let args: Cli = Cli::from_args(
            &["jsexec"],
            &[
                "run",
                "-q", "kafka",
                "--max-active-scripts", "50",
                "--engine-mode", "lightweight",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Run(run) => {
                assert_eq!(run.queue_type, Some(jsexec_server::QueueType::Kafka));
                assert_eq!(run.max_active_scripts, Some(50));
                assert_eq!(run.engine_mode, Some(jsexec_server::EngineMode::Lightweight));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parse_eval() {
        let args: Cli = Cli::from_args(&["jsexec"], &["eval", "(a, b) => a + b", "1", "2"]).unwrap();
        match args.command {
            Commands::Eval(EvalArgs { body, args, timeout_ms }) => {
                assert_eq!(body, "(a, b) => a + b");
                assert_eq!(args, vec!["1".to_string(), "2".to_string()]);
                assert_eq!(timeout_ms, 5000); // default
            }
            _ => panic!("Expected Eval command"),
        }
    }

    #[test]
    fn test_cli_parse_eval_with_timeout() {
        let args: Cli = Cli::from_args(&["jsexec"], &["eval", "-t", "250", "() => 1"]).unwrap();
        match args.command {
            Commands::Eval(EvalArgs { timeout_ms, args, .. }) => {
                assert_eq!(timeout_ms, 250);
                assert!(args.is_empty());
            }
            _ => panic!("Expected Eval command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_subcommand() {
        assert!(Cli::from_args(&["jsexec"], &["node"]).is_err());
    }
}
