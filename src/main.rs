// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use modelfetch::collaborators::{NotificationKind, NotificationSink, StoreModelState};
use modelfetch::config::{load_config, save_config, Config};
use modelfetch::credentials::{default_sources, resolve_token, FileSecretStore, SecretStore, TOKEN_KEY};
use modelfetch::download::{
    BackgroundDownloadManager, DownloadHandle, DownloadPipeline, DownloadRequest, DownloadSnapshot,
    DownloadState, DownloadStore, PipelineOptions,
};
use modelfetch::error::{format_error, hub_error};
use modelfetch::memory::{calculate_memory_requirements, check_compatibility, estimate_from_file_size, DeviceMemoryInfo};
use modelfetch::ratelimit::RateLimiters;
use modelfetch::registry::{RegistryClient, RepoKind, Repository};
use modelfetch::select::{Backend, QuantizationLevel};
use modelfetch::store::JsonStore;
use modelfetch::utils::{format_bytes, mask_sensitive};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Temporary failure - network or rate limit, try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Permission denied - authentication required
    pub const NO_PERM: i32 = 77;
    /// Configuration error - invalid or unreadable config
    pub const CONFIG: i32 = 78;
    /// Interrupted by Ctrl-C; downloads were paused
    pub const INTERRUPTED: i32 = 130;
}

use exit_codes::*;

#[derive(Parser)]
#[command(name = "modelfetch")]
#[command(version = VERSION)]
#[command(about = "Download models from a model hub, sized for this device.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Registry endpoint (overrides config and MODELFETCH_ENDPOINT)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Directory downloads are placed in (overrides config and MODELFETCH_CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Verbose logging (repeat for trace)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List files in a repository
    Files {
        /// Repository id, e.g. TheBloke/Mistral-7B-Instruct-v0.2-GGUF
        repo: String,
        #[command(flatten)]
        target: Target,
    },

    /// Show which files would be downloaded and whether the model fits
    Select {
        repo: String,
        #[command(flatten)]
        target: Target,
        /// Packaging format (gguf, coreml, safetensors); detected when omitted
        #[arg(short, long)]
        backend: Option<Backend>,
        /// Fetch this file instead of the automatic choice (substring match)
        #[arg(short, long)]
        file: Option<String>,
    },

    /// Estimate memory needs for a parameter count and quantization
    Estimate {
        /// Parameter count, e.g. 7000000000
        #[arg(short, long)]
        params: u64,
        /// Quantization level, e.g. Q4_K_M
        #[arg(short, long, default_value = "Q4_K_M")]
        quant: QuantizationLevel,
    },

    /// Download a repository and follow its progress (Ctrl-C pauses)
    Pull {
        repo: String,
        #[command(flatten)]
        target: Target,
        #[arg(short, long)]
        backend: Option<Backend>,
        #[arg(short, long)]
        file: Option<String>,
        /// Download into this directory instead of the cache
        #[arg(short, long)]
        dest: Option<PathBuf>,
    },

    /// Show recorded downloads and device memory
    Status,

    /// Continue a paused download, or every unfinished one
    Resume {
        /// Download id from `modelfetch status`
        id: Option<String>,
    },

    /// Cancel a download and remove its partial files
    Cancel { id: String },

    /// Remove a download record and every file it fetched
    Delete { id: String },

    /// Store a registry token
    Login {
        #[arg(long)]
        token: String,
    },

    /// Remove the stored registry token
    Logout,

    /// Print the effective configuration, or write defaults with --init
    Config {
        #[arg(long)]
        init: bool,
    },
}

#[derive(clap::Args, Clone)]
struct Target {
    /// Branch, tag or commit
    #[arg(short, long)]
    revision: Option<String>,
    /// Repository kind: model, dataset or space
    #[arg(long, default_value = "model")]
    kind: RepoKind,
    /// Only files matching this glob (repeatable)
    #[arg(long = "include")]
    includes: Vec<String>,
    /// Skip files matching this glob (repeatable)
    #[arg(long = "exclude")]
    excludes: Vec<String>,
}

/// Everything a command needs, built once from the config.
struct App {
    config: Config,
    store: JsonStore,
    client: RegistryClient,
    manager: BackgroundDownloadManager,
}

/// Prints notifications above the progress bar.
struct ConsoleNotifier;

impl NotificationSink for ConsoleNotifier {
    fn notify(&self, kind: NotificationKind, message: &str) {
        match kind {
            NotificationKind::DownloadCompleted => println!("{} {}", "[OK]".green(), message),
            NotificationKind::DownloadCancelled => println!("{} {}", "[-]".dimmed(), message),
            NotificationKind::DownloadFailed => eprintln!("{} {}", "[X]".red(), message),
            NotificationKind::Warning => eprintln!("{} {}", "[!]".yellow(), message),
        }
    }
}

impl App {
    fn new(config: Config) -> Result<Self> {
        let store = JsonStore::open(config.state_dir())?;
        let secrets: Arc<dyn SecretStore> = Arc::new(FileSecretStore::new(config.secrets_dir()));
        let token = resolve_token(&default_sources(secrets, config.token_file()));

        let limiters = RateLimiters::persistent(
            config.rate_limits.authenticated,
            config.rate_limits.anonymous,
            &store,
        );
        let client = RegistryClient::new(token, limiters)?
            .with_request_timeout(config.request_timeout())
            .with_retry(config.retry.policy());
        let pipeline = DownloadPipeline::new(client.clone(), PipelineOptions::from_config(&config));
        let manager = BackgroundDownloadManager::builder(pipeline, DownloadStore::new(store.clone()))
            .config(&config)
            .notifier(Arc::new(ConsoleNotifier))
            .model_state(Arc::new(StoreModelState::new(store.clone())))
            .build();

        Ok(Self { config, store, client, manager })
    }

    fn repository(&self, id: &str, target: &Target) -> Result<Repository> {
        Ok(Repository::parse(id, target.kind, &self.config.endpoint)?)
    }

    fn revision(&self, target: &Target) -> String {
        target.revision.clone().unwrap_or_else(|| self.config.revision.clone())
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "modelfetch=warn",
        1 => "modelfetch=debug",
        _ => "modelfetch=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn progress_bar(total: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total.max(1));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({binary_bytes_per_sec}, {eta}) {msg}")?
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

/// Draw progress until the download stops. Ctrl-C pauses every download.
async fn follow(manager: &BackgroundDownloadManager, mut handle: DownloadHandle) -> Result<(DownloadSnapshot, bool)> {
    let first = handle.progress();
    let pb = progress_bar(first.progress.total_bytes)?;
    pb.set_position(first.progress.bytes_downloaded);

    let mut interrupted = false;
    let last = loop {
        tokio::select! {
            changed = handle.changed() => match changed {
                Some(snapshot) => {
                    pb.set_position(snapshot.progress.bytes_downloaded);
                    if let Some(file) = &snapshot.progress.current_file {
                        pb.set_message(file.clone());
                    }
                    if !snapshot.state.is_active() {
                        break snapshot;
                    }
                }
                None => break handle.progress(),
            },
            _ = tokio::signal::ctrl_c() => {
                pb.set_message("pausing...");
                manager.shutdown().await?;
                interrupted = true;
                break handle.progress();
            }
        }
    };
    pb.finish_and_clear();
    Ok((last, interrupted))
}

fn report(snapshot: &DownloadSnapshot) {
    match snapshot.state {
        DownloadState::Paused => println!(
            "{} Paused {} at {:.0}%. Continue with: modelfetch resume {}",
            "[||]".yellow(),
            snapshot.repository,
            snapshot.progress.percent(),
            snapshot.id
        ),
        DownloadState::Failed => eprintln!(
            "{} Download {} stopped; fix the problem and run: modelfetch pull {}",
            "[X]".red(),
            snapshot.id,
            snapshot.repository
        ),
        _ => {}
    }
}

async fn cmd_files(app: &App, repo: &str, target: &Target) -> Result<()> {
    let repo = app.repository(repo, target)?;
    let files = app
        .client
        .list_files_matching(&repo, &app.revision(target), &target.includes, &target.excludes)
        .await?;
    let total: u64 = files.iter().map(|f| f.size).sum();
    for file in &files {
        let lfs = if file.lfs.is_some() { "lfs".dimmed().to_string() } else { String::new() };
        println!("{:>10}  {} {}", format_bytes(file.size), file.path, lfs);
    }
    println!("{} files, {}", files.len(), format_bytes(total).bold());
    Ok(())
}

async fn cmd_select(app: &App, repo: &str, target: &Target, backend: Option<Backend>, file: Option<&str>) -> Result<()> {
    let repo = app.repository(repo, target)?;
    let files = app
        .client
        .list_files_matching(&repo, &app.revision(target), &target.includes, &target.excludes)
        .await?;
    let backend = match backend.or_else(|| Backend::detect(&files)) {
        Some(backend) => backend,
        None => {
            println!("{} No supported model files in {}", "[!]".yellow(), repo);
            return Ok(());
        }
    };

    let device = app.manager.device();
    let selection = backend.selector(device.tier(), file).select_files(&files)?;
    println!("{} {} ({} tier device)", "Backend:".bold(), backend, device.tier());
    for f in &selection.files {
        println!("  {:>10}  {}", format_bytes(f.size), f.path);
    }
    for warning in &selection.warnings {
        println!("{} {}", "[!]".yellow(), warning);
    }

    let requirements = estimate_from_file_size(selection.total_bytes(), app.config.overhead_fraction)?;
    let fit = check_compatibility(&requirements, device);
    println!(
        "{} {} download, about {} in memory: {}",
        "Total:".bold(),
        format_bytes(selection.total_bytes()),
        format_bytes(requirements.total_bytes),
        fit
    );
    Ok(())
}

fn cmd_estimate(app: &App, params: u64, quant: QuantizationLevel) -> Result<()> {
    let requirements = calculate_memory_requirements(params, quant, app.config.overhead_fraction)?;
    let device = DeviceMemoryInfo::current();
    println!("{} {} parameters at {} ({} bits/param)", "Model:".bold(), params, quant, quant.bits_per_parameter());
    println!("  Weights:  {}", format_bytes(requirements.base_bytes));
    println!("  Overhead: {}", format_bytes(requirements.overhead_bytes));
    println!("  Total:    {}", format_bytes(requirements.total_bytes).bold());
    if let Some(ratio) = requirements.compression_ratio {
        println!("  {:.1}x smaller than 32-bit weights", ratio);
    }
    println!(
        "{} {} usable of {} ({})",
        "Device:".bold(),
        format_bytes(device.usable_bytes()),
        format_bytes(device.total_bytes),
        device.platform
    );
    println!("  {}", check_compatibility(&requirements, &device));
    Ok(())
}

async fn cmd_pull(
    app: &App,
    repo: &str,
    target: &Target,
    backend: Option<Backend>,
    file: Option<String>,
    dest: Option<PathBuf>,
) -> Result<bool> {
    let mut request = DownloadRequest::new(app.repository(repo, target)?).revision(app.revision(target));
    request.backend = backend;
    request.filename = file;
    request.destination = dest;
    request.includes = target.includes.clone();
    request.excludes = target.excludes.clone();

    let handle = app.manager.start(request).await?;
    let snapshot = handle.progress();
    println!(
        "{} Downloading {} ({} files, {}) as {}",
        "[↓]".cyan(),
        snapshot.repository.bold(),
        snapshot.progress.total_files,
        format_bytes(snapshot.progress.total_bytes),
        snapshot.id.dimmed()
    );
    let (last, interrupted) = follow(&app.manager, handle).await?;
    report(&last);
    Ok(interrupted)
}

fn cmd_status(app: &App) -> Result<()> {
    let device = app.manager.device();
    println!(
        "{} {} total, {} available, {} usable ({} tier)",
        "Memory:".bold(),
        format_bytes(device.total_bytes),
        format_bytes(device.available_bytes),
        format_bytes(device.usable_bytes()),
        device.tier()
    );

    let downloads = app.manager.list()?;
    if downloads.is_empty() {
        println!("No recorded downloads.");
        return Ok(());
    }
    for download in downloads {
        let progress = download.progress();
        let state = match download.state {
            DownloadState::Failed => download.state.to_string().red(),
            DownloadState::Paused => download.state.to_string().yellow(),
            DownloadState::Downloading => download.state.to_string().cyan(),
            _ => download.state.to_string().normal(),
        };
        println!(
            "{}  {:<12} {} [{}] {}/{} files, {} of {} ({:.0}%)",
            download.id.dimmed(),
            state,
            download.repository.bold(),
            download.backend,
            progress.files_completed,
            progress.total_files,
            format_bytes(progress.bytes_downloaded),
            format_bytes(progress.total_bytes),
            progress.percent()
        );
        if let Some(error) = &download.error {
            println!("    {}", error.red());
        }
        for warning in &download.warnings {
            println!("    {} {}", "[!]".yellow(), warning);
        }
    }
    Ok(())
}

async fn cmd_resume(app: &App, id: Option<String>) -> Result<bool> {
    let ids: Vec<String> = match id {
        Some(id) => {
            // Marks the record paused if the process driving it died.
            app.manager.restore().await?;
            vec![id]
        }
        None => app.manager.restore().await?.into_iter().map(|d| d.id).collect(),
    };
    if ids.is_empty() {
        println!("Nothing to resume.");
        return Ok(false);
    }
    for id in ids {
        let handle = app.manager.resume(&id).await?;
        println!("{} Resuming {} ({})", "[↓]".cyan(), handle.progress().repository.bold(), id.dimmed());
        let (last, interrupted) = follow(&app.manager, handle).await?;
        report(&last);
        if interrupted {
            return Ok(true);
        }
    }
    Ok(false)
}

fn cmd_login(app: &App, token: &str) -> Result<()> {
    let token = token.trim();
    if token.is_empty() {
        anyhow::bail!("Token is empty");
    }
    FileSecretStore::new(app.config.secrets_dir()).set(TOKEN_KEY, token.as_bytes())?;
    println!("{} Stored token {}", "[OK]".green(), mask_sensitive(token, 4));
    Ok(())
}

fn cmd_config(app: &App, init: bool) -> Result<()> {
    if init {
        save_config(&app.config)?;
        println!("{} Wrote {}", "[OK]".green(), modelfetch::config::config_path().display());
    }
    println!("{}", serde_json::to_string_pretty(&app.config)?);
    println!("{} {}", "State:".dimmed(), app.store.root().display());
    Ok(())
}

/// Returns true when Ctrl-C paused the work.
async fn run(cli: Cli, app: App) -> Result<bool> {
    match cli.command {
        Commands::Files { repo, target } => cmd_files(&app, &repo, &target).await?,
        Commands::Select { repo, target, backend, file } => {
            cmd_select(&app, &repo, &target, backend, file.as_deref()).await?
        }
        Commands::Estimate { params, quant } => cmd_estimate(&app, params, quant)?,
        Commands::Pull { repo, target, backend, file, dest } => {
            return cmd_pull(&app, &repo, &target, backend, file, dest).await
        }
        Commands::Status => cmd_status(&app)?,
        Commands::Resume { id } => return cmd_resume(&app, id).await,
        Commands::Cancel { id } => app.manager.cancel(&id).await?,
        Commands::Delete { id } => {
            app.manager.delete(&id).await?;
            println!("{} Deleted {}", "[OK]".green(), id);
        }
        Commands::Login { token } => cmd_login(&app, &token)?,
        Commands::Logout => {
            FileSecretStore::new(app.config.secrets_dir()).delete(TOKEN_KEY)?;
            println!("{} Token removed", "[OK]".green());
        }
        Commands::Config { init } => cmd_config(&app, init)?,
    }
    Ok(false)
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match hub_error(err) {
        Some(hub) if hub.is_transient() => TEMP_FAIL,
        Some(modelfetch::HubError::AuthenticationRequired(_)) => NO_PERM,
        _ => ERROR,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            let cause = format!("{:#}", e);
            eprintln!(
                "{}",
                format_error(
                    "Could not load configuration",
                    &[cause.as_str()],
                    &["Fix or delete ~/.modelfetch/config.json"],
                )
            );
            std::process::exit(CONFIG);
        }
    };
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.trim_end_matches('/').to_string();
    }
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = Some(dir.clone());
    }

    let result = App::new(config)
        .context("Failed to initialise")
        .map(|app| (cli, app));
    let result = match result {
        Ok((cli, app)) => run(cli, app).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(true) => std::process::exit(INTERRUPTED),
        Ok(false) => {}
        Err(e) => {
            match hub_error(&e) {
                Some(hub) => eprintln!("{}", hub.user_message()),
                None => eprintln!("{} {:#}", "[X]".red(), e),
            }
            std::process::exit(exit_code(&e));
        }
    }
}
