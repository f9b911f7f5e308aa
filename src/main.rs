use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use iologd::configuration::Config;
use iologd::server::Server;

#[derive(Parser)]
#[command(name = "iologd")]
#[command(version)]
#[command(about = "Privileged-command audit log server")]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'f', long = "file", default_value = "/etc/iologd.conf")]
    config_file: PathBuf,

    /// Check the configuration and exit
    #[arg(short = 'n', long)]
    check_config: bool,
}

// Connections never share state outside the session-id allocator, so a
// single reactor thread carries the whole server.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    let config = match Config::from_file(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("unable to load {}: {}", args.config_file.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if args.check_config {
        info!("{}: configuration OK", args.config_file.display());
        return ExitCode::SUCCESS;
    }

    let mut server = Server::new(config, Some(args.config_file));
    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
