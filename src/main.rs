use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use boxpm::application::{self, InstallOptions, RunContext, RunReport};
use boxpm::endpoint::PackageIdentifier;
use boxpm::error::PackageError;
use boxpm::progress::ConsoleSink;
use boxpm::runtime::RealRuntime;
use clap::Parser;
use log::debug;
use tokio_util::sync::CancellationToken;

/// boxpm - package manager for box projects
///
/// Resolves the dependencies declared in box.json, installs them under
/// modules/ and records the result in box-lock.json.
///
/// The registry is read from BOXPM_REGISTRY (or the registryUrl setting),
/// and BOXPM_TOKEN is sent to it as a bearer token.
///
/// Examples:
///   boxpm install                 # Install everything box.json declares
///   boxpm install foo@^1.2        # Add foo and install
///   boxpm update foo              # Move foo to the newest allowed version
///   boxpm remove foo              # Drop foo from box.json and modules/
#[derive(Parser, Debug)]
#[command(author, version = env!("BOXPM_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the project manifest
    #[arg(
        long,
        short = 'm',
        env = "BOXPM_MANIFEST",
        value_name = "PATH",
        default_value = "box.json",
        global = true
    )]
    manifest: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Install the project's dependencies, adding PACKAGES first
    Install(InstallArgs),

    /// Update packages to the newest versions their constraints allow
    Update(UpdateArgs),

    /// Remove dependencies from the manifest and from modules/
    Remove(RemoveArgs),

    /// Show what install would do without changing anything
    Resolve(ResolveArgs),
}

#[derive(clap::Args, Debug, Default)]
struct CommonArgs {
    /// Skip devDependencies
    #[arg(long)]
    production: bool,

    /// Fail on conflicting requirements instead of nesting a second copy
    #[arg(long)]
    strict: bool,
}

impl CommonArgs {
    fn options(&self) -> InstallOptions {
        InstallOptions {
            dev: !self.production,
            strict: self.strict,
            ..InstallOptions::default()
        }
    }
}

#[derive(clap::Args, Debug)]
struct InstallArgs {
    /// Packages to add: name, name@constraint, URL, path or git location
    #[arg(value_name = "PACKAGES")]
    packages: Vec<String>,

    #[command(flatten)]
    common: CommonArgs,

    /// Resolve again even if box-lock.json is up to date
    #[arg(long, short = 'f')]
    force: bool,

    /// Add PACKAGES to devDependencies
    #[arg(long, short = 'D')]
    save_dev: bool,
}

#[derive(clap::Args, Debug)]
struct UpdateArgs {
    /// Packages to update (all when omitted)
    #[arg(value_name = "NAMES")]
    names: Vec<String>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(clap::Args, Debug)]
struct RemoveArgs {
    /// Packages to remove
    #[arg(value_name = "NAMES", required = true)]
    names: Vec<String>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(clap::Args, Debug)]
struct ResolveArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupted");
            token.cancel();
        }
    });

    let project_dir = project_dir(&cli.manifest);
    let ctx = RunContext::for_project(Arc::new(RealRuntime), &project_dir, Arc::new(ConsoleSink))?
        .with_cancellation(cancel);

    let report = match run(&ctx, &cli).await {
        Ok(report) => report,
        Err(err) => {
            eprintln!("error: {}", err);
            RunReport::failed(&err)
        }
    };
    std::process::exit(report.status.exit_code());
}

async fn run(ctx: &RunContext<RealRuntime>, cli: &Cli) -> Result<RunReport, PackageError> {
    let manifest = cli.manifest.as_path();
    let report = match &cli.command {
        Commands::Install(args) => {
            let packages = args
                .packages
                .iter()
                .map(|p| p.parse::<PackageIdentifier>())
                .collect::<Result<Vec<_>, _>>()?;
            let options = InstallOptions {
                force: args.force,
                save_dev: args.save_dev,
                ..args.common.options()
            };
            application::install(ctx, manifest, &packages, &options).await?
        }
        Commands::Update(args) => {
            application::update(ctx, manifest, &args.names, &args.common.options()).await?
        }
        Commands::Remove(args) => {
            application::remove(ctx, manifest, &args.names, &args.common.options()).await?
        }
        Commands::Resolve(args) => {
            let plan = application::resolve(ctx, manifest, &args.common.options()).await?;
            for operation in plan.operations.iter().filter(|op| op.is_mutating()) {
                println!("{}", operation);
            }
            RunReport::success(plan.summary())
        }
    };
    println!("{}", report.summary);
    Ok(report)
}

fn project_dir(manifest: &Path) -> PathBuf {
    match manifest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
