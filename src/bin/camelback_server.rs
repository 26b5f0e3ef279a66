//!
//! camelback server binary
//! -----------------------
//! Command-line entry point. Loads the JSON configuration, applies
//! `CAMELBACK_*` environment overrides and CLI flags, then runs one node
//! until ctrl-c.

use std::path::PathBuf;
use std::process::ExitCode;

use camelback::{AppError, CamelbackConfig};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "camelback_server", version, about = "Database-deployed application server")]
struct Args {
    /// Configuration document (JSON).
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Listener port; overrides the file and CAMELBACK_PORT.
    #[arg(short, long)]
    port: Option<u16>,
    /// Print the effective configuration and exit.
    #[arg(long)]
    check: bool,
}

fn load(args: &Args) -> Result<CamelbackConfig, AppError> {
    let mut config = match &args.config {
        Some(p) => CamelbackConfig::load(p)?,
        None => CamelbackConfig::default(),
    };
    config.apply_env()?;
    if let Some(p) = args.port { config.port = p; }
    config.validate()?;
    Ok(config)
}

fn exit_with(e: &AppError) -> ExitCode {
    eprintln!("camelback: {}", e);
    tracing::error!(target: "startup", code = e.code_str(), "{}", e);
    ExitCode::from(e.exit_code() as u8)
}

fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let args = Args::parse();
    let config = match load(&args) {
        Ok(c) => c,
        Err(e) => return exit_with(&e),
    };
    if args.check {
        match serde_json::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => return exit_with(&AppError::Codec(e)),
        }
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().worker_threads(config.thread_pool_size).enable_all().build() {
        Ok(rt) => rt,
        Err(e) => return exit_with(&AppError::Io(e)),
    };
    tracing::info!(target: "startup", port = config.port, threads = config.thread_pool_size, "camelback starting");
    match runtime.block_on(camelback::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => exit_with(&e),
    }
}
