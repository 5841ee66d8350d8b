mod render;

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use shoppack_core::{Operation, PackageManifest, PollResponse};
use shoppack_installer::{
    default_install_root, CommandExecutor, FsGateway, HttpSource, InstallError, InstallLayout,
    Installer, InstallerConfig, RemovalRequest, Remover, SqliteStore, StoreShopConfig,
};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use render::{current_output_style, TerminalRenderer};

#[derive(Parser, Debug)]
#[command(name = "shoppack")]
#[command(about = "Resumable theme and module installer", long_about = None)]
struct Cli {
    /// Installation root; defaults to SHOPPACK_ROOT or the current directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the package described by a manifest file.
    Install {
        manifest: PathBuf,
        #[arg(long, env = "SHOPPACK_TOKEN", hide_env_values = true)]
        token: Option<String>,
        #[command(flatten)]
        poll: PollArgs,
    },
    /// Remove a theme directory or an explicit list of files.
    Remove {
        txid: String,
        #[arg(long, conflicts_with = "files")]
        dir: Option<String>,
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long = "down")]
        down: Vec<String>,
        #[command(flatten)]
        poll: PollArgs,
    },
    Status {
        txid: String,
    },
    /// Roll back and forget an in-flight transaction.
    Abandon {
        manifest: PathBuf,
    },
    Paths,
}

#[derive(Args, Debug, Clone, Copy, Default)]
struct PollArgs {
    /// Advance a single checkpoint and exit.
    #[arg(long)]
    once: bool,
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,
}

struct Session {
    config: InstallerConfig,
    layout: InstallLayout,
    store: SqliteStore,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(cli.root.as_deref(), cli.config.as_deref(), |key| {
        std::env::var(key).ok()
    })?;
    init_tracing(cli.verbose, &config.log_filter);
    run_cli(cli, config)
}

fn run_cli(cli: Cli, config: InstallerConfig) -> Result<()> {
    let renderer = TerminalRenderer::new(current_output_style(), cli.json);
    let layout = config.layout()?;

    if let Commands::Paths = cli.command {
        renderer.print_lines(&format_paths(&config, &layout));
        return Ok(());
    }

    let store_path = config.store_path(&layout);
    let store = SqliteStore::open(&store_path)
        .with_context(|| format!("failed to open progress store {}", store_path.display()))?;
    let session = Session {
        config,
        layout,
        store,
    };

    match cli.command {
        Commands::Install {
            manifest,
            token,
            poll,
        } => run_install(&session, renderer, &manifest, token.as_deref(), poll),
        Commands::Remove {
            txid,
            dir,
            files,
            down,
            poll,
        } => {
            let fs = FsGateway::new(session.layout.root());
            let request = build_removal_request(&fs, &txid, dir.as_deref(), &files, down)?;
            run_remove(&session, renderer, &request, poll)
        }
        Commands::Status { txid } => run_status(&session, renderer, &txid),
        Commands::Abandon { manifest } => run_abandon(&session, renderer, &manifest),
        Commands::Paths => Ok(()),
    }
}

/// File values first, then `SHOPPACK_*` overrides from `lookup`, then flags.
fn resolve_config<F>(root: Option<&Path>, explicit: Option<&Path>, lookup: F) -> Result<InstallerConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let probe_root = match root {
        Some(root) => root.to_path_buf(),
        None => match lookup("SHOPPACK_ROOT").filter(|value| !value.is_empty()) {
            Some(root) => PathBuf::from(root),
            None => default_install_root()?,
        },
    };
    let mut config = InstallerConfig::load(explicit, &probe_root)?;
    config.apply_env(lookup)?;
    if let Some(root) = root {
        config.root = Some(root.to_path_buf());
    }
    if config.root.is_none() {
        config.root = Some(probe_root);
    }
    Ok(config)
}

fn init_tracing(verbose: u8, fallback: &str) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env("SHOPPACK_LOG")
            .or_else(|_| EnvFilter::try_new(fallback))
            .unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn read_manifest(path: &Path) -> Result<PackageManifest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    PackageManifest::from_json_str(&raw)
        .with_context(|| format!("invalid package manifest {}", path.display()))
}

fn build_removal_request(
    fs: &FsGateway,
    txid: &str,
    dir: Option<&str>,
    files: &[String],
    down: Vec<String>,
) -> Result<RemovalRequest> {
    match dir {
        Some(dir) => RemovalRequest::for_directory(fs, txid, dir, down)
            .with_context(|| format!("failed to enumerate {dir} for removal")),
        None if files.is_empty() => Err(anyhow!("remove needs --dir or at least one --file")),
        None => RemovalRequest::new(txid, files, down).context("invalid removal request"),
    }
}

fn http_source(config: &InstallerConfig) -> Result<HttpSource> {
    HttpSource::new(&config.user_agent, config.http_timeout()).context("failed to build HTTP client")
}

fn run_install(
    session: &Session,
    renderer: TerminalRenderer,
    manifest_path: &Path,
    token: Option<&str>,
    args: PollArgs,
) -> Result<()> {
    let manifest = read_manifest(manifest_path)?;
    let installer = Installer::new(
        &session.config,
        session.layout.clone(),
        session.store.clone(),
        http_source(&session.config)?,
        CommandExecutor,
    );
    drive(
        renderer,
        "install",
        manifest.txid(),
        args,
        || installer.poll(&manifest, token),
        || installer.abandon(&manifest),
    )
}

fn run_remove(
    session: &Session,
    renderer: TerminalRenderer,
    request: &RemovalRequest,
    args: PollArgs,
) -> Result<()> {
    let remover = Remover::new(
        &session.config,
        session.layout.clone(),
        session.store.clone(),
        StoreShopConfig::new(session.store.clone()),
        CommandExecutor,
    );
    drive(
        renderer,
        "remove",
        &request.txid,
        args,
        || remover.poll(request),
        || remover.abandon(request),
    )
}

fn run_status(session: &Session, renderer: TerminalRenderer, txid: &str) -> Result<()> {
    let installer = Installer::new(
        &session.config,
        session.layout.clone(),
        session.store.clone(),
        http_source(&session.config)?,
        CommandExecutor,
    );
    let record = installer
        .status(txid)
        .with_context(|| format!("failed to read progress of {txid}"))?;

    if renderer.json() {
        println!("{}", serde_json::to_string(&record)?);
        return Ok(());
    }
    match record {
        Some(record) => renderer.print_status(
            "step",
            &format!(
                "{txid}: {} {} ({}%)",
                record.operation, record.stage, record.progress
            ),
        ),
        None => renderer.print_status("ok", &format!("{txid}: no transaction in flight")),
    }
    Ok(())
}

fn run_abandon(session: &Session, renderer: TerminalRenderer, manifest_path: &Path) -> Result<()> {
    let manifest = read_manifest(manifest_path)?;
    let txid = manifest.txid();
    let installer = Installer::new(
        &session.config,
        session.layout.clone(),
        session.store.clone(),
        http_source(&session.config)?,
        CommandExecutor,
    );

    let operation = match installer.status(txid) {
        Ok(record) => record.map(|record| record.operation),
        Err(err) => {
            warn!(txid, error = %err, "progress record unreadable; abandoning as install");
            None
        }
    };
    let abandoned = match operation {
        Some(Operation::Remove) => {
            let remover = Remover::new(
                &session.config,
                session.layout.clone(),
                session.store.clone(),
                StoreShopConfig::new(session.store.clone()),
                CommandExecutor,
            );
            remover.abandon(&RemovalRequest::from_manifest(&manifest))
        }
        _ => installer.abandon(&manifest),
    }
    .with_context(|| format!("failed to abandon {txid}"))?;

    if abandoned {
        renderer.print_status("ok", &format!("{txid}: rolled back"));
    } else {
        renderer.print_status("ok", &format!("{txid}: nothing to abandon"));
    }
    Ok(())
}

/// Polls until the transaction completes. A panic inside a poll abandons the
/// transaction before the command fails.
fn drive<P, A>(
    renderer: TerminalRenderer,
    label: &str,
    txid: &str,
    args: PollArgs,
    mut poll: P,
    abandon: A,
) -> Result<()>
where
    P: FnMut() -> Result<PollResponse, InstallError>,
    A: FnOnce() -> Result<bool, InstallError>,
{
    let mut progress = renderer.start_progress(label);
    panic::set_hook(Box::new(|info| error!(panic = %info, "poll panicked")));

    loop {
        let response = match panic::catch_unwind(AssertUnwindSafe(&mut poll)) {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                progress.finish_abandon();
                return Err(report_failure(renderer, label, &err));
            }
            Err(_) => {
                progress.finish_abandon();
                if let Err(err) = abandon() {
                    error!(txid, error = %err, "rollback after panic failed");
                }
                renderer.print_status("error", &format!("{label} of {txid} failed"));
                return Err(anyhow!("{label} of {txid} failed"));
            }
        };

        progress.set(&response);
        renderer.print_response(label, txid, &response);
        if response.is_complete() {
            progress.finish_success();
            renderer.print_status("ok", &format!("{label} of {txid} complete"));
            return Ok(());
        }
        if args.once {
            progress.finish_abandon();
            return Ok(());
        }
        if args.interval_ms > 0 {
            thread::sleep(Duration::from_millis(args.interval_ms));
        }
    }
}

/// Logs the full error and returns the short message shown to the user.
fn report_failure(renderer: TerminalRenderer, label: &str, err: &InstallError) -> anyhow::Error {
    let txid = err.txid();
    error!(txid, error = %err, "{label} failed");
    let message = failure_message(label, err);
    renderer.print_status(if err.is_retryable() { "warn" } else { "error" }, &message);
    anyhow!(message)
}

fn failure_message(label: &str, err: &InstallError) -> String {
    let txid = err.txid();
    match err {
        InstallError::Busy { .. } => {
            format!("{label} of {txid} is being advanced elsewhere; retry shortly")
        }
        InstallError::StoreUnavailable { .. } => {
            format!("{label} of {txid} paused: progress store unavailable; retry the same command")
        }
        InstallError::OperationConflict { active, .. } => {
            format!("{txid} has an in-flight {active}; finish or abandon it first")
        }
        InstallError::Lock { .. } | InstallError::InstallationFailed { .. } => {
            format!("{label} of {txid} failed")
        }
    }
}

fn format_paths(config: &InstallerConfig, layout: &InstallLayout) -> Vec<String> {
    vec![
        format!("root: {}", layout.root().display()),
        format!("store: {}", config.store_path(layout).display()),
        format!("cache: {}", layout.cache_dir().display()),
        format!("backup: {}", layout.backup_dir().display()),
        format!("staging: {}", layout.staging_dir().display()),
        format!("journal: {}", layout.journals_dir().display()),
        format!("locks: {}", layout.locks_dir().display()),
        format!(
            "marker: {}",
            layout.root().join(&config.update_marker).display()
        ),
    ]
}

#[cfg(test)]
mod tests;
