use anyhow::Context;
use artifetch::{
    load_manifest, load_or_create_default, provision, sync_subtrees, FetchConfig, GitTool,
    ManifestFlavor, RunSummary, SubtreeMode,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "artifetch")]
#[command(about = "Fetch, cache and extract external assets, dependencies and subtrees", long_about = None)]
#[command(version)]
struct Args {
    /// Workspace root that manifests and destinations are relative to
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// Number of artifacts processed at the same time
    #[arg(short, long, global = true, default_value_t = 1)]
    jobs: usize,

    /// Extra attempts for a failed transfer
    #[arg(long, global = true, default_value_t = 0)]
    retries: usize,

    /// Pause between retry attempts (e.g. "5s", "500ms")
    #[arg(long, global = true, default_value = "5s", value_parser = humantime::parse_duration)]
    retry_interval: Duration,

    /// Deadline for a single download (e.g. "10m"); unlimited when omitted
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Check downloads against MD5 ETags published by the server
    #[arg(long, global = true)]
    verify_etag: bool,

    /// Disable progress bars
    #[arg(long, global = true)]
    no_progress: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download sample assets listed in asset_listing.toml
    Assets {
        /// Manifest path (default: <root>/asset_listing.toml)
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Directory assets are placed under, relative to the root
        #[arg(short, long, default_value = "sample_assets")]
        output: PathBuf,
    },

    /// Download and extract dependency archives listed in external_deps.toml
    Deps {
        /// Manifest path (default: <root>/external_deps.toml)
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Directory dependencies are placed under, relative to the root
        #[arg(short, long, default_value = "external")]
        output: PathBuf,
    },

    /// Add or update git subtrees listed in subtrees.json
    Subtrees {
        /// Config path (default: <root>/subtrees.json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Pull updates into existing subtrees instead of adding new ones
        #[arg(short, long)]
        update: bool,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("artifetch={}", log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Artifetch - workspace dependency fetcher");
    info!("Workspace root: {:?}", args.root);

    // Dropping the run future removes in-flight staging directories
    let code = tokio::select! {
        result = run(args) => match result {
            Ok(summary) => {
                print_summary(&summary);
                summary.exit_code()
            }
            Err(e) => {
                eprintln!("❌ Error: {:#}", e);
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n[CANCELLED] Operation interrupted by user");
            1
        }
    };

    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<RunSummary> {
    let config = FetchConfig {
        workspace_root: args.root.clone(),
        max_concurrent: args.jobs.max(1),
        fetch_timeout: args.timeout,
        retry_attempts: args.retries,
        retry_interval: args.retry_interval,
        verify_etag: args.verify_etag,
        show_progress: !args.no_progress && atty::is(atty::Stream::Stderr),
        ..FetchConfig::default()
    };

    match args.command {
        Command::Assets { manifest, output } => {
            provision_manifest(&config, ManifestFlavor::Assets, manifest, output).await
        }
        Command::Deps { manifest, output } => {
            provision_manifest(&config, ManifestFlavor::Dependencies, manifest, output).await
        }
        Command::Subtrees { config: path, update } => {
            let git = GitTool::new(&args.root);
            git.ensure_repository().await?;

            let path = path.unwrap_or_else(|| args.root.join("subtrees.json"));
            let subtrees = load_or_create_default(&path)?;

            let mode = if update {
                info!("Mode: UPDATE (pulling existing subtrees)");
                SubtreeMode::Update
            } else {
                info!("Mode: ADD (adding new subtrees)");
                SubtreeMode::Add
            };
            Ok(sync_subtrees(&git, &subtrees, mode).await)
        }
    }
}

async fn provision_manifest(
    config: &FetchConfig,
    flavor: ManifestFlavor,
    manifest: Option<PathBuf>,
    output: PathBuf,
) -> anyhow::Result<RunSummary> {
    let path = manifest.unwrap_or_else(|| config.workspace_root.join(flavor.default_manifest()));
    info!("Manifest: {:?}", path);

    let manifest = load_manifest(&path, flavor, &output)?;
    if manifest.entries.is_empty() {
        warn!("No {} entries defined in {:?}", flavor.noun(), path);
    }

    provision(config, &manifest)
        .await
        .context("Failed to set up HTTP client")
}

fn print_summary(summary: &RunSummary) {
    let elapsed = Duration::from_millis(summary.elapsed.as_millis() as u64);

    println!();
    println!("{}", "=".repeat(60));
    println!(
        "Summary: {}/{} succeeded in {}",
        summary.succeeded,
        summary.total,
        humantime::format_duration(elapsed)
    );
    if !summary.is_success() {
        println!("Failed:");
        for outcome in &summary.outcomes {
            if let Some(detail) = outcome.error_detail() {
                println!("  - {}: {}", outcome.name, detail);
            }
        }
    }
    println!("{}", "=".repeat(60));
}
