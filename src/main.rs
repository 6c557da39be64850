// src/main.rs

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use swapdeploy::cache::ArtifactCache;
use swapdeploy::db::paths;
use swapdeploy::device::AdbDevice;
use swapdeploy::session::PackageManagerInstaller;
use swapdeploy::snapshot::SnapshotResult;
use swapdeploy::swap::{self, HelperAgentClient, HelperInstaller};
use swapdeploy::ui::TerminalPrompt;
use swapdeploy::{
    Deployer, DeployerOptions, Error, ErrorKind, LogSink, MetricsLedger, PackageSpec, SUCCESS_CODE,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "swapdeploy")]
#[command(
    author,
    version,
    about = "Delta installs and live code swap for attached devices",
    long_about = None
)]
struct Cli {
    /// Device serial (default: the only attached device)
    #[arg(short, long, global = true)]
    serial: Option<String>,

    /// Configuration file (default: $XDG_CONFIG_HOME/swapdeploy/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Per-command device timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PackageArgs {
    /// Application id, e.g. com.example.app
    app_id: String,

    /// APK files; the first is the base APK, the rest are splits
    #[arg(required = true)]
    apks: Vec<PathBuf>,

    /// Version code the APKs declare
    #[arg(long)]
    version_code: Option<i64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install an app, uploading only the APKs that changed
    Install {
        #[command(flatten)]
        package: PackageArgs,

        /// Never attempt a delta install
        #[arg(long)]
        force_full: bool,

        /// Answer yes to the downgrade prompt
        #[arg(long, conflicts_with = "no")]
        yes: bool,

        /// Answer no to the downgrade prompt
        #[arg(long)]
        no: bool,
    },
    /// Swap changed code into the running app
    Codeswap {
        #[command(flatten)]
        package: PackageArgs,

        /// Directory holding the installer helper and agent library
        #[arg(long)]
        installers: Option<PathBuf>,
    },
    /// Swap changed code and resources, then restart the activity
    Fullswap {
        #[command(flatten)]
        package: PackageArgs,

        /// Directory holding the installer helper and agent library
        #[arg(long)]
        installers: Option<PathBuf>,
    },
    /// Show the APKs installed for an app
    Dump {
        /// Application id
        app_id: String,
    },
}

fn load_options(cli: &Cli) -> Result<DeployerOptions> {
    let mut options = match &cli.config {
        Some(path) => DeployerOptions::load(path)?,
        None => DeployerOptions::load_default()?,
    };
    if let Some(dir) = &cli.cache_dir {
        options.cache_path = dir.clone();
    }
    if let Some(timeout) = cli.timeout {
        options.command_timeout_secs = timeout;
    }
    match &cli.command {
        Commands::Install { force_full, .. } if *force_full => options.force_full_install = true,
        Commands::Codeswap { installers, .. } | Commands::Fullswap { installers, .. }
            if installers.is_some() =>
        {
            options.installers_path = installers.clone();
        }
        _ => {}
    }
    options.validate()?;
    Ok(options)
}

fn package_spec(args: &PackageArgs) -> swapdeploy::Result<PackageSpec> {
    let spec = PackageSpec::new(&args.app_id, &args.apks)?;
    Ok(match args.version_code {
        Some(version_code) => spec.with_version_code(version_code),
        None => spec,
    })
}

fn helper(options: &DeployerOptions) -> swapdeploy::Result<HelperInstaller> {
    swap::agent::helper_dir(options.installers_path.as_deref())
        .map(HelperInstaller::new)
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InstallerUnavailable,
                "no installers directory with an installer helper is configured",
            )
        })
}

fn print_metrics(metrics: &MetricsLedger) {
    metrics.emit_to(&LogSink);
    for event in metrics.events() {
        println!("{event}");
    }
}

/// Run one deploy request and return its exit code
fn deploy(cli: &Cli, options: DeployerOptions) -> Result<i32> {
    let device = AdbDevice::connect(cli.serial.as_deref(), options.command_timeout())
        .context("Failed to connect to device")?;
    let cache = ArtifactCache::open(paths::cache_db(&options.cache_path))?
        .with_algorithm(options.fingerprint_algorithm()?);
    let installer = PackageManagerInstaller::new(&device);

    let ui = match &cli.command {
        Commands::Install { yes: true, .. } => TerminalPrompt::preset(true),
        Commands::Install { no: true, .. } => TerminalPrompt::preset(false),
        _ => TerminalPrompt::new(),
    };

    let mut deployer = Deployer::new(&device, &cache, &ui, &installer, options);
    let result: swapdeploy::Result<()> = match &cli.command {
        Commands::Install { package, .. } => package_spec(package)
            .and_then(|spec| deployer.install(&spec))
            .map(|outcome| println!("Installed: {outcome:?}")),
        Commands::Codeswap { package, .. } | Commands::Fullswap { package, .. } => {
            let full = matches!(cli.command, Commands::Fullswap { .. });
            package_spec(package).and_then(|spec| {
                let helper = helper(deployer.options())?;
                let agent = HelperAgentClient::for_helper(&device, &helper)?;
                let report = if full {
                    deployer.full_swap(&spec, &agent, &helper)?
                } else {
                    deployer.code_swap(&spec, &agent, &helper)?
                };
                if report.no_changes {
                    println!("No changes to swap into {}", report.package);
                } else {
                    println!(
                        "Swapped {} (pid {}): {} redefined, {} retransformed",
                        report.package,
                        report.pid,
                        report.redefined.len(),
                        report.retransformed.len()
                    );
                }
                Ok(())
            })
        }
        Commands::Dump { app_id } => deployer.dump(app_id).map(|result| match result {
            SnapshotResult::Found(snapshot) => {
                if let Some(version_code) = snapshot.version_code {
                    println!("versionCode={version_code}");
                }
                for artifact in &snapshot.artifacts {
                    println!("{}\t{}\t{}", artifact.unit, artifact.size, artifact.path);
                }
            }
            SnapshotResult::PackageNotFound => println!("{app_id} is not installed"),
        }),
    };

    print_metrics(deployer.metrics());
    match result {
        Ok(()) => Ok(SUCCESS_CODE),
        Err(err) => {
            error!("{}", err);
            eprintln!("Error: {} ({})", err.qualified_name(), err);
            if let Some(status) = err.device_status() {
                eprintln!("Device status: {status}");
            }
            if err.is_partial_apply() {
                eprintln!("Content reached the device but was abandoned before it took effect");
            }
            Ok(err.code())
        }
    }
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = load_options(&cli)?;
    info!("Using cache at {}", options.cache_path.display());

    let code = deploy(&cli, options)?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}
