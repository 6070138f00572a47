use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use terminal_keepalive::config::KeepaliveConfig;
use terminal_keepalive::watchdog::{self, AlarmTimer, Watchdog, WatchdogExit};
use terminal_keepalive::{priority, signals};
use tracing_subscriber::EnvFilter;

/// Exit status for startup failures (bad config, alarm cannot be armed safely).
const SETUP_FAILURE_EXIT_CODE: u8 = 2;

/// Log filter variable. `RUST_LOG` is ignored so a supervisor's own logging
/// setup never makes the watchdog noisy.
const LOG_ENV: &str = "TERMINAL_KEEPALIVE_LOG";

/// A keepalive watchdog: exits when stdin closes and is killed by SIGALRM
/// when no byte arrives on stdin within the timeout.
#[derive(Parser, Debug)]
#[command(name = "terminal-keepalive", version, about)]
pub struct Cli {
    /// Seconds to wait for each liveness byte (default: 120, or the config
    /// value). Parsed like C atoi: non-numeric text means 0, which disables
    /// the alarm.
    #[arg(value_name = "TIMEOUT_SECONDS", allow_negative_numbers = true)]
    timeout: Option<OsString>,

    /// Anything after the timeout is ignored
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    rest: Vec<OsString>,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging on stderr (or set TERMINAL_KEEPALIVE_LOG)
    #[arg(short, long)]
    verbose: bool,

    /// Print resolved settings and exit without watching stdin
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    /// The timeout argument as text; invalid UTF-8 is replaced, which atoi
    /// parsing then stops at.
    fn timeout_arg(&self) -> Option<String> {
        self.timeout
            .as_ref()
            .map(|raw| raw.to_string_lossy().into_owned())
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "terminal_keepalive=debug"
    } else {
        "terminal_keepalive=warn"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match &cli.config {
        Some(path) => match KeepaliveConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "cannot load config");
                return ExitCode::from(SETUP_FAILURE_EXIT_CODE);
            }
        },
        None => KeepaliveConfig::default(),
    };
    if !cli.rest.is_empty() {
        tracing::debug!(ignored = ?cli.rest, "ignoring extra arguments");
    }
    let watchdog = Watchdog::new(config.resolve_timeout(cli.timeout_arg().as_deref()));

    if cli.dry_run {
        println!("terminal-keepalive v{}", env!("CARGO_PKG_VERSION"));
        println!("timeout_secs: {}", watchdog.timeout_secs());
        println!("niceness: {}", config.priority.niceness);
        println!(
            "io_priority: {:?} level {}",
            config.priority.io_class, config.priority.io_level
        );
        return ExitCode::SUCCESS;
    }

    if let Err(e) = signals::restore_default_alarm() {
        tracing::error!(error = %e, "refusing to run without a lethal alarm");
        return ExitCode::from(SETUP_FAILURE_EXIT_CODE);
    }
    let report = priority::deprioritize(&config.priority);
    if !report.fully_applied() {
        tracing::debug!(?report, "running with partial deprioritization");
    }

    tracing::debug!(timeout_secs = watchdog.timeout_secs(), "watching stdin");
    let exit = match watchdog::stdin_reader() {
        Ok(mut input) => watchdog.run(&mut input, &mut AlarmTimer),
        Err(e) => WatchdogExit::ReadError { pings: 0, source: e },
    };
    tracing::debug!(pings = exit.pings(), "keepalive exiting");
    ExitCode::from(exit.exit_code())
}
