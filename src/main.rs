//! mirrord driver - runs the mirrord CLI and prints the launch environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mirrord_driver::cli::MirrordCommand;
use mirrord_driver::commands::{list_targets, verify_config, NO_TARGETS_MESSAGE};
use mirrord_driver::config::{ConfigLoader, DriverConfig};
use mirrord_driver::display;
use mirrord_driver::supervisor::{
    check_leftover_env, is_enabled, resolve_config_path, ExecSupervisor, ExecutionOutcome,
};

#[derive(Parser)]
#[command(
    name = "mirrord-driver",
    about = "Run mirrord and print the environment for the target process",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Driver configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the mirrord binary, overriding the configuration.
    #[arg(long, global = true)]
    binary: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the environment for a process and print it as JSON.
    Ext {
        /// Target to impersonate.
        #[arg(short, long)]
        target: Option<String>,
        /// mirrord configuration file.
        #[arg(short = 'f', long)]
        config_file: Option<String>,
        /// Executable the environment is prepared for.
        #[arg(short, long)]
        executable: Option<String>,
        /// Seconds to wait for mirrord to become ready.
        #[arg(long)]
        timeout: Option<u64>,
        /// Project directory, used for `$ProjectPath$` and as working directory.
        #[arg(long)]
        project_dir: Option<PathBuf>,
        /// Show full status text without truncation.
        #[arg(long)]
        raw: bool,
    },
    /// List the targets available in the cluster.
    Ls {
        /// mirrord configuration file.
        #[arg(short = 'f', long)]
        config_file: Option<String>,
    },
    /// Check a mirrord configuration file.
    VerifyConfig {
        /// Path of the mirrord configuration file.
        path: String,
    },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let loader = match cli.config {
        Some(path) => ConfigLoader::explicit(path),
        None => ConfigLoader::new(),
    };
    let mut config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    if let Some(binary) = cli.binary {
        config.binary = binary;
    }

    match cli.command {
        Commands::Ext {
            target,
            config_file,
            executable,
            timeout,
            project_dir,
            raw,
        } => {
            let args = ExtArgs {
                target,
                config_file,
                executable,
                timeout: timeout.map(Duration::from_secs),
                project_dir,
                raw,
            };
            run_ext(&config, args).await
        }
        Commands::Ls { config_file } => {
            match list_targets(&config.binary, config_file.as_deref(), config.timeout()).await {
                Ok(targets) => {
                    if targets.is_empty() {
                        eprintln!("{NO_TARGETS_MESSAGE}");
                    }
                    for target in targets {
                        println!("{target}");
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    display::print_error(&e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::VerifyConfig { path } => {
            match verify_config(&config.binary, &path, config.timeout()).await {
                Ok(verified) => {
                    display::print_verified(&verified);
                    if verified.is_error() {
                        ExitCode::FAILURE
                    } else {
                        ExitCode::SUCCESS
                    }
                }
                Err(e) => {
                    display::print_error(&e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

struct ExtArgs {
    target: Option<String>,
    config_file: Option<String>,
    executable: Option<String>,
    timeout: Option<Duration>,
    project_dir: Option<PathBuf>,
    raw: bool,
}

async fn run_ext(config: &DriverConfig, args: ExtArgs) -> ExitCode {
    let mut project_env: BTreeMap<String, String> = std::env::vars().collect();
    project_env.extend(config.env.clone());

    if let Err(e) = check_leftover_env(&project_env) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    if !is_enabled(&project_env, config.enabled) {
        tracing::info!("mirrord is disabled, nothing to do");
        println!("{{}}");
        return ExitCode::SUCCESS;
    }

    let config_file = args
        .config_file
        .or_else(|| resolve_config_path(&project_env, args.project_dir.as_deref()));

    if let Some(path) = &config_file {
        match verify_config(&config.binary, path, config.timeout()).await {
            Ok(verified) if verified.is_error() => {
                display::print_verified(&verified);
                return ExitCode::FAILURE;
            }
            Ok(verified) => {
                for warning in &verified.warnings {
                    display::print_warning(warning, None);
                }
            }
            Err(e) => {
                display::print_error(&e);
                return ExitCode::FAILURE;
            }
        }
    }

    let mut command = MirrordCommand::ext().envs(config.env.clone());
    if let Some(target) = args.target {
        command = command.target(target);
    }
    if let Some(path) = config_file {
        command = command.config_file(path);
    }
    if let Some(executable) = args.executable {
        command = command.executable(executable);
    }
    if let Some(dir) = args.project_dir {
        command = command.working_dir(dir);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut supervisor = ExecSupervisor::from_config(config).with_cancellation(cancel);
    if let Some(timeout) = args.timeout {
        supervisor = supervisor.with_timeout(timeout);
    }

    let outcome = supervisor
        .execute(&command, |progress| {
            display::print_progress(progress, &config.suppressed_warnings, args.raw);
        })
        .await;

    match outcome {
        ExecutionOutcome::Success(result) => {
            display::print_done(&result);
            match serde_json::to_string_pretty(&result) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to serialize result: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        ExecutionOutcome::Cancelled => {
            display::print_cancelled();
            ExitCode::FAILURE
        }
        ExecutionOutcome::Failed(e) => {
            display::print_error(&e);
            ExitCode::FAILURE
        }
    }
}
