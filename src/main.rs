//! meshgate - mesh peer forwarding over iptables
//!
//! Command-line front end for the forwarding engine. Peers, allowlist and
//! host flags come from the config file; every command that touches the
//! ruleset is recorded in the audit log.
//!
//! # Usage
//!
//! ```bash
//! meshgate init                # Write a default config
//! meshgate plan                # Print the iptables commands a resync would run
//! meshgate apply               # Enable forwarding and install peer rules
//! meshgate run                 # Same, then resync on SIGHUP until SIGTERM/Ctrl-C
//! meshgate reset               # Rebuild peer rules from the config
//! meshgate status              # Show owned rules
//! meshgate teardown            # Remove every owned rule
//! ```

use clap::{Parser, Subcommand};
use meshgate::config::{self, AppConfig};
use meshgate::core::error::IptablesErrorPattern;
use meshgate::core::executor::Iptables;
use meshgate::core::introspect::owned_rules;
use meshgate::core::kernel::{KernelParam, SysctlSetter, UnmanagedSysctl};
use meshgate::core::rule::Chain;
use meshgate::{
    DryRunExecutor, Error, ForwardChainManager, Forwarder, Result, SystemExecutor, audit, utils,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

shadow_rs::shadow!(build);

type SystemForwarder = Forwarder<SystemExecutor, Box<dyn SysctlSetter>>;

#[derive(Parser)]
#[command(name = "meshgate", version, long_version = build::CLAP_LONG_VERSION)]
#[command(about = "Mesh peer forwarding and NAT over iptables", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/meshgate/config.json)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log every iptables invocation
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enable forwarding and install rules for the configured peers
    Apply,
    /// Apply, then resync on SIGHUP and tear down on SIGTERM or Ctrl-C
    Run,
    /// Rebuild peer rules from the config without touching the baseline
    Reset,
    /// Remove every rule meshgate owns
    Teardown,
    /// List the rules meshgate currently owns
    Status,
    /// Print the iptables commands a full apply would issue
    Plan,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

impl Commands {
    fn needs_root(&self) -> bool {
        !matches!(self, Commands::Plan | Commands::Init { .. })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = utils::ensure_dirs() {
        warn!("Failed to create meshgate directories: {e}");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

/// Prints an error, with a translation when the tool's output is recognised.
fn report(e: &Error) {
    eprintln!("Error: {e}");
    let raw = match e.root() {
        Error::Execution { output, .. } => output.clone(),
        Error::Spawn { source, .. } => source.to_string(),
        Error::Teardown(errors) => errors
            .iter()
            .map(|e| e.root().to_string())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return,
    };

    let translation = IptablesErrorPattern::match_error(&raw);
    eprintln!("\n{}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  - {suggestion}");
    }
    if let Some(url) = translation.help_url {
        eprintln!("  See: {url}");
    }
}

fn config_path(cli_path: Option<PathBuf>) -> Result<PathBuf> {
    cli_path
        .or_else(config::default_config_path)
        .ok_or_else(|| Error::Internal("cannot determine config directory".to_string()))
}

/// Configured interfaces, or the host's physical ones when none are set.
fn resolve_interfaces(config: &AppConfig) -> Result<Vec<String>> {
    let configured = config.validated_interfaces()?;
    if !configured.is_empty() {
        return Ok(configured);
    }
    let detected = utils::physical_interfaces();
    if detected.is_empty() {
        warn!("no physical interfaces found; kill switch and allowlist rules will be empty");
    } else {
        info!("using detected interfaces: {}", detected.join(", "));
    }
    Ok(detected)
}

fn system_executor(config: &AppConfig) -> SystemExecutor {
    match config
        .iptables_path
        .clone()
        .or_else(|| option_env!("MESHGATE_IPTABLES").map(PathBuf::from))
    {
        Some(path) => SystemExecutor::with_iptables_path(path),
        None => SystemExecutor::new(),
    }
}

fn system_forwarder(config: &AppConfig) -> Result<SystemForwarder> {
    let sysctl: Box<dyn SysctlSetter> = if config.manage_ip_forward {
        Box::new(KernelParam::ipv4_forwarding())
    } else {
        Box::new(UnmanagedSysctl)
    };
    Ok(Forwarder::new(
        system_executor(config),
        resolve_interfaces(config)?,
        sysctl,
    ))
}

/// Runs a forwarder operation on the blocking pool.
async fn blocking<T, F>(forwarder: &Arc<SystemForwarder>, op: F) -> Result<T>
where
    F: FnOnce(&SystemForwarder) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let forwarder = Arc::clone(forwarder);
    tokio::task::spawn_blocking(move || op(&forwarder))
        .await
        .map_err(|e| Error::Internal(format!("forwarder task failed: {e}")))?
}

fn error_text<T>(result: &Result<T>) -> Option<String> {
    result.as_ref().err().map(ToString::to_string)
}

async fn enable(forwarder: &Arc<SystemForwarder>) -> Result<()> {
    let result = blocking(forwarder, |fw| fw.enable()).await;
    audit::log_enable(error_text(&result)).await;
    result
}

async fn reset_peers(forwarder: &Arc<SystemForwarder>, config: &AppConfig) -> Result<()> {
    let settings = config.to_settings()?;
    let peers = config.to_peers();
    let (peer_count, kill_switch, lan_available) =
        (peers.len(), settings.kill_switch, settings.lan_available);

    let result = blocking(forwarder, move |fw| fw.reset_peers(peers, &settings)).await;
    audit::log_reset_peers(peer_count, kill_switch, lan_available, error_text(&result)).await;
    result
}

async fn reset_firewall(forwarder: &Arc<SystemForwarder>, config: &AppConfig) -> Result<()> {
    let settings = config.to_settings()?;
    let enabled = blocking(forwarder, |fw| fw.is_enabled()).await?;

    let result = blocking(forwarder, move |fw| fw.reset_firewall(&settings)).await;
    audit::log_reset_firewall(enabled, error_text(&result)).await;
    result
}

/// Resyncs after a config reload. Unchanged peers only need a settings rebuild.
async fn reload(forwarder: &Arc<SystemForwarder>, config: &AppConfig) -> Result<()> {
    let stored = blocking(forwarder, |fw| fw.peers()).await?;
    if config.peers_differ(&stored) {
        reset_peers(forwarder, config).await
    } else {
        info!("peers unchanged, rebuilding for new settings");
        reset_firewall(forwarder, config).await
    }
}

async fn disable(forwarder: &Arc<SystemForwarder>) -> Result<()> {
    let result = blocking(forwarder, |fw| fw.disable()).await;
    audit::log_disable(error_text(&result)).await;
    result
}

async fn handle_cli(cli: Cli) -> Result<()> {
    if cli.command.needs_root() && !nix::unistd::getuid().is_root() {
        return Err(Error::Internal(
            "this command modifies iptables and must be run as root".to_string(),
        ));
    }

    let path = config_path(cli.config)?;

    match cli.command {
        Commands::Init { force } => {
            if !force && tokio::fs::try_exists(&path).await? {
                return Err(Error::Internal(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            config::save_config(&AppConfig::default(), &path).await?;
            println!("Wrote default config to {}", path.display());
        }
        Commands::Plan => {
            let config = config::load_config(&path).await?;
            let settings = config.to_settings()?;
            let forwarder = Forwarder::new(
                DryRunExecutor::new(),
                resolve_interfaces(&config)?,
                UnmanagedSysctl,
            );
            forwarder.enable()?;
            forwarder.reset_peers(config.to_peers(), &settings)?;
            for command in forwarder.iptables().executor().commands() {
                println!("{command}");
            }
        }
        Commands::Apply => {
            let config = config::load_config(&path).await?;
            let forwarder = Arc::new(system_forwarder(&config)?);
            enable(&forwarder).await?;
            reset_peers(&forwarder, &config).await?;
            println!("✓ Forwarding enabled for {} peer(s)", config.peers.len());
        }
        Commands::Reset => {
            let config = config::load_config(&path).await?;
            let forwarder = Arc::new(system_forwarder(&config)?);
            reset_peers(&forwarder, &config).await?;
            println!("✓ Peer rules rebuilt");
        }
        Commands::Teardown => {
            let config = config::load_config(&path).await?;
            let forwarder = Arc::new(system_forwarder(&config)?);
            disable(&forwarder).await?;
            println!("✓ All meshgate rules removed");
        }
        Commands::Status => {
            let config = config::load_config(&path).await?;
            let ipt = Iptables::new(system_executor(&config));
            println!("Config: {}", path.display());
            println!(
                "Peers: {}  Kill switch: {}  LAN discovery: {}  Allowlist: {}",
                config.peers.len(),
                config.kill_switch,
                config.lan_discovery,
                config.allowlist_enabled,
            );
            for chain in [Chain::Forward, Chain::Postrouting] {
                let rules = owned_rules(&ipt, chain)?;
                println!("\n{} {chain} ({} owned):", chain.table(), rules.len());
                for (tag, rule) in rules {
                    println!("  [{tag}] {rule}");
                }
            }
        }
        Commands::Run => run_session(path).await?,
    }
    Ok(())
}

/// Keeps forwarding up until asked to stop. `SIGHUP` reloads the config.
async fn run_session(path: PathBuf) -> Result<()> {
    let config = config::load_config(&path).await?;
    let forwarder = Arc::new(system_forwarder(&config)?);

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let started = match enable(&forwarder).await {
        Ok(()) => reset_peers(&forwarder, &config).await,
        Err(e) => Err(e),
    };
    if let Err(e) = started {
        error!("startup failed, tearing down: {e}");
        if let Err(teardown) = disable(&forwarder).await {
            warn!("{teardown}");
        }
        return Err(e);
    }
    info!("meshgate running with {} peer(s)", config.peers.len());

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading {}", path.display());
                match config::load_config(&path).await {
                    Ok(config) => {
                        // interfaces are bound at startup
                        if let Err(e) = reload(&forwarder, &config).await {
                            error!("resync after reload failed: {e}");
                        }
                    }
                    Err(e) => error!("keeping previous rules, config reload failed: {e}"),
                }
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
                break;
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("interrupted");
                break;
            }
        }
    }

    disable(&forwarder).await
}
