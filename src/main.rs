use std::io;
use std::process::ExitCode;

use blkdedup::engine::Engine;
use blkdedup::error::Error;
use blkdedup::{cli, kernel};

const EXIT_OK: u8 = 0;
const EXIT_FATAL: u8 = 1;
const EXIT_CLI_ERROR: u8 = 2;

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run() -> blkdedup::error::Result<()> {
    let matches = cli::command().get_matches();
    init_logging(cli::verbosity(&matches));

    if cli::stdin_is_terminal() {
        return Err(Error::Cli(
            "no file list piped on stdin; expected a NUL-delimited list of paths".to_string(),
        ));
    }

    let paths = cli::read_nul_delimited_paths(io::stdin().lock())?;
    if paths.is_empty() {
        return Err(Error::Cli("file list on stdin was empty".to_string()));
    }

    let config = cli::run_config_from_matches(&matches);
    kernel::raise_fd_limit(config.fd_target())?;

    let mut engine = Engine::new(config, paths);
    let stats = engine.do_dedup()?;
    tracing::info!(?stats, "dedup run complete");
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(Error::Cli(msg)) => {
            eprintln!("usage error: {msg}");
            ExitCode::from(EXIT_CLI_ERROR)
        }
        Err(e) => {
            tracing::error!(error = %e, "dedup run aborted");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
