use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use flowtap::agent::Agent;
use flowtap::config::Config;

/// Client and event logger for the nDPId distributor socket.
#[derive(Parser)]
#[command(name = "flowtap", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "FLOWTAP_CONFIG")]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, env = "FLOWTAP_LOG_LEVEL")]
    log_level: Option<String>,

    /// Distributor TCP host. Takes precedence over the UNIX socket.
    #[arg(long, env = "FLOWTAP_HOST")]
    host: Option<String>,

    /// Distributor TCP port.
    #[arg(long, env = "FLOWTAP_PORT")]
    port: Option<u16>,

    /// Distributor UNIX socket path.
    #[arg(long, env = "FLOWTAP_UNIX")]
    unix: Option<PathBuf>,

    /// Directory the event logs are written to.
    #[arg(short, long, env = "FLOWTAP_WRITE")]
    write: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

impl Cli {
    /// Load the config file (or defaults) and apply command line overrides.
    fn into_config(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(level) = self.log_level {
            cfg.log_level = level;
        }
        if let Some(host) = self.host {
            cfg.connection.host = Some(host);
        }
        if let Some(port) = self.port {
            cfg.connection.port = port;
        }
        if let Some(unix) = self.unix {
            cfg.connection.unix = Some(unix);
        }
        if let Some(dir) = self.write {
            cfg.output.directory = dir;
        }

        cfg.validate().context("validating configuration")?;
        Ok(cfg)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("flowtap {}", version::full());
        return Ok(());
    }

    let cfg = cli.into_config()?;

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting flowtap",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let agent = Agent::new(cfg)?;
    let cancel = agent.cancellation_token();

    // Set up signal handling.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        cancel.cancel();
    });

    agent.run().await?;

    tracing::info!("flowtap stopped");

    Ok(())
}
