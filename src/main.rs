use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use modmqttd_lib::logging::{self, LoggingOptions};
use modmqttd_lib::orchestrator::Orchestrator;

/// Bidirectional bridge between an MQTT broker and Modbus TCP/RTU field buses.
#[derive(Parser, Debug)]
#[command(name = "modmqttd", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Increase log verbosity; repeat for more (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write logs to this file, in addition to stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init(&LoggingOptions { verbosity: cli.verbose, log_file: cli.log_file });

    let config = match modmqttd_lib::config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(Orchestrator::new(config).run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
