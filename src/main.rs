//! kurator binary entrypoint kept minimal. The full runtime lives in `app`.

use std::path::PathBuf;

use clap::Parser;

use kurator::app;
use kurator::config::Settings;

/// Cluster-extension controller.
#[derive(Debug, Parser)]
#[command(name = "kurator", version, about)]
struct Args {
    /// Path to the TOML settings file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory for rolling log files (overrides the settings file).
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut settings = match &args.config {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                eprintln!("Error: {err}");
                std::process::exit(1);
            }
        },
        None => Settings::default(),
    };
    if args.log_dir.is_some() {
        settings.log_dir = args.log_dir;
    }
    let _log_guard = app::logging::init(settings.log_dir.as_deref());
    if let Err(err) = app::run(settings).await {
        eprintln!("Error: {err:?}");
    }
}
