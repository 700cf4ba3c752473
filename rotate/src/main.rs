//! nss-rotate: replace a host certificate in the mod_nss database
//!
//! Builds the next database generation, swaps the `alias` link over to it
//! and removes the previous generation.

mod config;

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::unistd::User;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use config::RotateConfig;
use nss_rotate::store::CertutilStore;
use nss_rotate::{rotate, Settings, StoreOwner};

#[derive(Parser, Debug)]
#[command(
    name = "nss-rotate",
    version,
    about = "Install a new certificate into the mod_nss database"
)]
struct Cli {
    /// Log everything, including per-file and per-record detail
    #[arg(short, long)]
    debug: bool,

    /// Log progress information
    #[arg(short, long)]
    info: bool,

    /// Format log output for a terminal
    #[arg(short, long, conflicts_with = "syslog")]
    tty: bool,

    /// Format log output for the system journal
    #[arg(short, long)]
    syslog: bool,

    /// Permit NSS_USER to be root or have group root
    #[arg(long)]
    allow_root: bool,

    /// Directory holding the alias link [default: /etc/httpd]
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Directory holding <HOSTNAME>.crt [default: /var/lib/acme]
    #[arg(long, value_name = "DIR")]
    cert_dir: Option<PathBuf>,

    /// User that owns the NSS database
    #[arg(value_name = "NSS_USER")]
    nss_user: String,

    /// Host whose certificate is replaced
    #[arg(value_name = "HOSTNAME")]
    hostname: String,
}

fn main() {
    let cli = Cli::parse();
    let mut logging = false;
    if let Err(e) = run(&cli, &mut logging) {
        if logging {
            error!("FATAL: {e:#}");
        } else {
            eprintln!("FATAL: {e:#}");
        }
        std::process::exit(1);
    }
}

fn run(cli: &Cli, logging: &mut bool) -> Result<()> {
    let config_path = config::config_path();
    let loaded = config::load_config(&config_path);
    let level = match &loaded {
        Ok(Some(config)) => config.logging.level.as_str(),
        _ => "info",
    };
    init_logging(cli, level)?;
    *logging = true;

    let config = match loaded? {
        Some(config) => config,
        None => {
            warn!("Config file not found at {}, using defaults", config_path.display());
            RotateConfig::default()
        }
    };

    validate_hostname(&cli.hostname)?;
    let owner = resolve_owner(&cli.nss_user, cli.allow_root)?;

    let settings = Settings {
        conf_dir: cli.config_dir.clone().unwrap_or(config.paths.conf_dir),
        cert_dir: cli.cert_dir.clone().unwrap_or(config.paths.cert_dir),
        hostname: cli.hostname.clone(),
        owner,
    };
    let mut store = CertutilStore::new(config.store.certutil);

    let report = rotate(&settings, &mut store, chrono::Utc::now())?;
    debug!("Rotated {} -> {}", report.old, report.new);
    Ok(())
}

/// Map the command-line verbosity onto a filter. `RUST_LOG` wins when set.
fn filter_directive<'a>(cli: &Cli, configured: &'a str) -> &'a str {
    if cli.debug {
        "trace"
    } else if cli.info {
        "debug"
    } else {
        configured
    }
}

fn init_logging(cli: &Cli, configured: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directive(cli, configured)))
        .with_context(|| format!("Invalid log level: {configured}"))?;

    let terminal = if cli.tty {
        true
    } else if cli.syslog {
        false
    } else {
        std::io::stderr().is_terminal()
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_ansi(terminal)
        .compact();

    // the journal stamps every line itself
    if terminal {
        tracing::subscriber::set_global_default(builder.finish())
    } else {
        tracing::subscriber::set_global_default(builder.without_time().finish())
    }
    .context("Failed to set tracing subscriber")?;
    Ok(())
}

fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() {
        bail!("Hostname must not be empty");
    }
    if hostname.contains('/') {
        bail!("Hostname must not contain '/': {hostname}");
    }
    Ok(())
}

fn resolve_owner(name: &str, allow_root: bool) -> Result<StoreOwner> {
    let user = User::from_name(name)
        .with_context(|| format!("Failed to look up user {name}"))?
        .with_context(|| format!("Unknown user: {name}"))?;

    if (user.uid.is_root() || user.gid.as_raw() == 0) && !allow_root {
        bail!(
            "Refusing to use {name} (uid {} gid {}) for NSS operations, use --allow-root to override",
            user.uid,
            user.gid
        );
    }
    Ok(StoreOwner {
        uid: user.uid,
        gid: user.gid,
    })
}
