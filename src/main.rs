use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use iobridge_core::attribution;
use iobridge_core::config::{default_config_dir, extension_id_from_launcher_args};
use iobridge_core::discovery::APP_DIR_NAME;
use iobridge_core::logging::LoggingBuilder;
use iobridge_core::{Host, HostConfig};
use tracing::{info, warn};

/// iobridge - native messaging host for the browser extension
///
/// Browsers start this program themselves; stdin/stdout carry the native
/// messaging channel, so all diagnostics go to stderr and the log file.
#[derive(Parser, Debug)]
#[command(name = "iobridge-host")]
#[command(about = "Native host giving a browser extension TCP/UDP sockets and download-folder access")]
#[command(version)]
struct Args {
    /// Base config directory (the descriptor lives in <dir>/iobridge/)
    #[arg(long, env = "IOBRIDGE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Data-plane port (0 picks a free one)
    #[arg(long, env = "IOBRIDGE_PORT", default_value_t = 0)]
    port: u16,

    /// Data-plane bind address
    #[arg(long, env = "IOBRIDGE_BIND", default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Default download root (defaults to the user's Downloads folder)
    #[arg(long, env = "IOBRIDGE_DOWNLOAD_ROOT")]
    download_root: Option<PathBuf>,

    /// Directory for JSONL logs (defaults to <config-dir>/iobridge/logs)
    #[arg(long, env = "IOBRIDGE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log to stderr only
    #[arg(long, env = "IOBRIDGE_NO_LOG_FILE")]
    no_log_file: bool,

    /// Extra CORS origin allowed on the data plane (repeatable)
    #[arg(long = "allowed-origin", env = "IOBRIDGE_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Arguments appended by the browser (caller origin or manifest path)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    launcher_args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_dir = args.config_dir.unwrap_or_else(default_config_dir);
    let pid = std::process::id();

    let mut logging = LoggingBuilder::new(pid);
    if !args.no_log_file {
        let log_dir = args
            .log_dir
            .unwrap_or_else(|| config_dir.join(APP_DIR_NAME).join("logs"));
        logging = logging.with_log_dir(log_dir);
    }
    let log_path = logging.init().context("Failed to initialize logging")?;
    if let Some(path) = &log_path {
        info!(path = %path.display(), "Writing JSONL logs");
    }

    let extension_id = extension_id_from_launcher_args(&args.launcher_args);
    let attribution = attribution::attribute_current_process(extension_id.as_deref());
    if let attribution::Attribution::UnknownFallback(browser) = &attribution {
        warn!(name = %browser.name, "Launching browser not recognized");
    }

    let defaults = HostConfig::default();
    let config = HostConfig {
        config_dir,
        bind: args.bind,
        port: args.port,
        download_root: args.download_root.or(defaults.download_root),
        extension_id,
        allowed_origins: args.allowed_origins,
        relay: defaults.relay,
    };

    let host = Host::bind(config, attribution.into_browser())
        .await
        .context("Failed to start data plane")?;
    host.run(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Control channel failed")?;
    Ok(())
}
