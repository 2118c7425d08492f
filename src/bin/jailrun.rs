//! jailrun - FreeBSD jail task runner
//!
//! Runs a single workload file through the jail driver, or shows what the
//! driver would do with it.
//!
//! ## Usage
//!
//! ```sh
//! jailrun run <workload.yaml> [--config <driver.yaml>]
//! jailrun params <workload.yaml>
//! jailrun limits <workload.yaml>
//! jailrun pull <image> <dir> [--config <driver.yaml>] [--repackage]
//! ```
//!
//! A workload file is a task config in YAML:
//!
//! ```yaml
//! id: web-1
//! name: web
//! alloc_id: abc
//! alloc_dir: /var/alloc/abc
//! driver_config:
//!   Docker: library/nginx latest
//!   Rctl:
//!     Memoryuse: { Action: deny, Amount: 512m }
//! ```
//!
//! Logging follows `RUST_LOG` and defaults to `info`.

use anyhow::{Context, bail};
use jailrun::{
    DriverConfig, ImagePuller, ImageReference, JailDriver, PullOptions, TaskConfig, params, rctl,
};
use jailrun::registry::HttpRegistry;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Run {
        workload: PathBuf,
        config: Option<PathBuf>,
    },
    Params {
        workload: PathBuf,
    },
    Limits {
        workload: PathBuf,
    },
    Pull {
        image: String,
        dir: PathBuf,
        config: Option<PathBuf>,
        repackage: bool,
    },
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    let config = option_value(&args, "--config", "-c")?.map(PathBuf::from);

    match args[1].as_str() {
        "run" => Ok(Command::Run {
            workload: positional(&args, 2, "run requires <workload.yaml>")?.into(),
            config,
        }),
        "params" => Ok(Command::Params {
            workload: positional(&args, 2, "params requires <workload.yaml>")?.into(),
        }),
        "limits" => Ok(Command::Limits {
            workload: positional(&args, 2, "limits requires <workload.yaml>")?.into(),
        }),
        "pull" => Ok(Command::Pull {
            image: positional(&args, 2, "pull requires <image>")?,
            dir: positional(&args, 3, "pull requires <dir>")?.into(),
            config,
            repackage: args.iter().any(|a| a == "--repackage"),
        }),
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {}", unknown)),
    }
}

fn positional(args: &[String], index: usize, missing: &str) -> Result<String, String> {
    args.get(index)
        .filter(|a| !a.starts_with('-'))
        .cloned()
        .ok_or_else(|| missing.to_string())
}

fn option_value(args: &[String], long: &str, short: &str) -> Result<Option<String>, String> {
    match args.iter().position(|a| a == long || a == short) {
        Some(i) => args
            .get(i + 1)
            .cloned()
            .map(Some)
            .ok_or_else(|| format!("{} requires a path", long)),
        None => Ok(None),
    }
}

// =============================================================================
// Loading
// =============================================================================

fn load_config(path: Option<&Path>) -> anyhow::Result<DriverConfig> {
    match path {
        Some(path) => Ok(DriverConfig::from_file(path)?),
        None => Ok(DriverConfig::from_env()),
    }
}

fn load_workload(path: &Path) -> anyhow::Result<TaskConfig> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading workload {}", path.display()))?;
    Ok(TaskConfig::from_yaml(&bytes)?)
}

// =============================================================================
// Command Implementations
// =============================================================================

async fn cmd_run(workload: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    let task = load_workload(workload)?;
    let driver = JailDriver::from_config(load_config(config)?)?;

    let state = driver.start_task(task).await?;
    let id = state.task_config.id.clone();
    eprintln!("Started jail {}", state.container_name);

    let cancel = CancellationToken::new();
    let waiter = driver.wait_task(&id, &cancel);
    tokio::pin!(waiter);

    tokio::select! {
        exit = &mut waiter => {
            let exit = exit?;
            eprintln!("Jail {} exited (code {})", state.container_name, exit.exit_code);
            driver.destroy_task(&id, false).await?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for interrupt")?;
            eprintln!("Interrupted, removing jail {}", state.container_name);
            cancel.cancel();
            driver.destroy_task(&id, true).await?;
        }
    }

    driver.shutdown();
    Ok(())
}

fn cmd_params(workload: &Path) -> anyhow::Result<()> {
    let task = load_workload(workload)?;
    let config = task.decode_driver_config()?;
    if config.has_image() {
        eprintln!("note: image hooks are only known after a pull");
    }
    let jail_params = params::translate(&task, &config, None)?;
    for arg in jail_params.to_args() {
        println!("{}", arg);
    }
    Ok(())
}

fn cmd_limits(workload: &Path) -> anyhow::Result<()> {
    let task = load_workload(workload)?;
    let config = task.decode_driver_config()?;
    let limits = rctl::compile_limits(&config.rctl)?;
    let name = task.container_name();
    for rule in limits.rules() {
        println!("jail:{}{}", name, rule);
    }
    Ok(())
}

async fn cmd_pull(
    image: &str,
    dir: &Path,
    config: Option<&Path>,
    repackage: bool,
) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let reference = ImageReference::parse(image)?;
    let registry = HttpRegistry::new(config.registry.clone())?;
    let puller = ImagePuller::new(Arc::new(registry), config.scratch_dir.clone());

    let cancel = CancellationToken::new();
    let pull = puller.pull(
        &reference,
        dir,
        PullOptions {
            repackage: repackage || config.repackage_images,
        },
        &cancel,
    );
    tokio::pin!(pull);

    let pulled = tokio::select! {
        pulled = &mut pull => pulled?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            // Let the pull observe the cancellation and clean up.
            let _ = pull.await;
            bail!("pull of {} interrupted", reference);
        }
    };

    println!("rootfs: {}", pulled.rootfs.display());
    println!("layers: {}", pulled.layers.len());
    if !pulled.hooks.start.is_empty() {
        println!("exec.start: {}", pulled.hooks.start);
    }
    if !pulled.hooks.prestart.is_empty() {
        println!("exec.prestart: {}", pulled.hooks.prestart);
        println!("exec.stop: {}", pulled.hooks.stop);
    }
    if let Some(archive) = &pulled.archive {
        println!("archive: {}", archive.display());
    }
    Ok(())
}

fn cmd_version() {
    println!("jailrun version {}", env!("CARGO_PKG_VERSION"));
    println!("driver: {}", jailrun::PLUGIN_NAME);
    println!("state version: {}", jailrun::TASK_HANDLE_VERSION);
}

fn cmd_help() {
    println!(
        r#"jailrun - FreeBSD jail task runner

USAGE:
    jailrun <COMMAND> [OPTIONS]

COMMANDS:
    run <workload.yaml>       Start the workload in a jail and wait for it
    params <workload.yaml>    Print the jail(8) parameters for the workload
    limits <workload.yaml>    Print the rctl(8) rules for the workload
    pull <image> <dir>        Pull an image into a directory
    version                   Print version information
    help                      Print this help message

OPTIONS:
    -c, --config <PATH>       Driver config file (YAML)
    --repackage               Also write <dir>.tar.gz after a pull

ENVIRONMENT:
    RUST_LOG                  Log filter (default: info)
    JAILRUN_JAIL_BIN          Path to jail(8)
    JAILRUN_JLS_BIN           Path to jls(8)
    JAILRUN_RCTL_BIN          Path to rctl(8)
    JAILRUN_JEXEC_BIN         Path to jexec(8)
    JAILRUN_SCRATCH_DIR       Directory for layer downloads
    JAILRUN_REGISTRY_URL      Registry base URL"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let cmd = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Run 'jailrun help' for usage");
            return ExitCode::FAILURE;
        }
    };

    let result = match cmd {
        Command::Run { workload, config } => cmd_run(&workload, config.as_deref()).await,
        Command::Params { workload } => cmd_params(&workload),
        Command::Limits { workload } => cmd_limits(&workload),
        Command::Pull {
            image,
            dir,
            config,
            repackage,
        } => cmd_pull(&image, &dir, config.as_deref(), repackage).await,
        Command::Version => {
            cmd_version();
            Ok(())
        }
        Command::Help => {
            cmd_help();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
