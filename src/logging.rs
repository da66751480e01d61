//! Process-wide logger, constructed once at startup (DESIGN.md, "global
//! state" — "there is effectively one logger ... model as a process-wide
//! handle created at startup").

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

pub struct LoggingOptions {
    pub verbosity: u8,
    pub log_file: Option<PathBuf>,
}

fn filter_for_verbosity(verbosity: u8) -> EnvFilter {
    if let Ok(from_env) = std::env::var("RUST_LOG") {
        return EnvFilter::new(from_env);
    }
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::new(format!("modmqttd_lib={level},modmqttd={level},warn"))
}

/// Installs the global `tracing` subscriber. Call exactly once from `main`.
pub fn init(opts: &LoggingOptions) {
    let filter = filter_for_verbosity(opts.verbosity);
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if let Some(path) = &opts.log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.with_writer(std::sync::Mutex::new(file)).with_ansi(false).init();
                return;
            }
            Err(e) => {
                eprintln!("failed to open log file {}: {e}, logging to stderr only", path.display());
            }
        }
    }
    builder.with_writer(std::io::stderr).init();
}
