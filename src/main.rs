use mirrorfs_server::errors::Result;
use mirrorfs_server::log::{init_logging, LogOptions};
use mirrorfs_server::server::Server;
use mirrorfs_server::settings::{default_settings_path, Settings, SettingsHandle};

use clap::Parser;
use std::path::PathBuf;
// Allow the server to return its version with a --version flag
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
struct Opts {
    #[clap(short, long)]
    version: bool,
    #[clap(short, long)]
    debug: bool,
    #[clap(short, long)]
    port: Option<u16>,
    /// Settings file, watched for changes while the server runs
    #[clap(short, long)]
    config: Option<PathBuf>,
    #[clap(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let opts: Opts = Opts::parse();
    if opts.version {
        println!("{}", VERSION);
        return;
    }
    if let Err(e) = run(opts).await {
        tracing::error!("{}", e);
        eprintln!("mirrorfs: {}", e);
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> Result<()> {
    let _guard = init_logging(&LogOptions {
        log_dir: opts.log_dir,
        debug: opts.debug,
        stdout: opts.debug,
    })?;

    let settings_file = opts.config.or_else(default_settings_path);
    let mut settings = match &settings_file {
        Some(path) => Settings::load_or_default(path)?,
        None => Settings::default(),
    };
    if let Some(port) = opts.port {
        settings.port = port;
    }
    tracing::info!(
        "Serving {} directories, flatten = {}",
        settings.served_directories.len(),
        settings.flatten
    );

    let srv = Server::new(SettingsHandle::new(settings), settings_file);
    srv.start().await
}
