extern crate clap;

mod errors;
mod measurements;
mod results;
mod retry;
mod settings;
mod speedtest;
mod stats;
mod tui;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use colored::Colorize;
use log::{info, LevelFilter};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use url::Url;

use crate::errors::{
    exit_codes, format_error_for_display, ErrorKind, SpeedTestError,
};
use crate::results::{BandwidthResults, FailureReport, PingResults, SpeedTestResults};
use crate::settings::{Settings, SettingsOverrides};
use crate::speedtest::engine::{RunFailure, SpeedTestOutput, TestEngine};
use crate::speedtest::http::{HttpTransport, DEFAULT_SERVER};
use crate::speedtest::progress::ChannelProgress;
use crate::tui::{DisplayMode, TuiController};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (rev ",
    env!("IPSEE_BUILD_GIT_HASH"),
    ")"
);

/// How often the live display is redrawn and the keyboard polled.
const UI_REFRESH: Duration = Duration::from_millis(100);

/// How long the finished TUI stays up before the summary is printed.
const FINAL_SCREEN_HOLD: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(author, version, long_version = LONG_VERSION, about, long_about = None)]
struct Cli {
    /// Print the result (or failure report) as JSON
    #[arg(long)]
    json: bool,

    /// Print a plain summary instead of the live display
    #[arg(long)]
    no_tui: bool,

    /// Base URL of the speed server
    #[arg(long, default_value = DEFAULT_SERVER)]
    server: Url,

    /// JSON settings file; command-line flags take precedence
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Maximum length of each transfer phase
    #[arg(long, value_name = "SECONDS")]
    duration: Option<f64>,

    /// Warm-up excluded from each transfer phase
    #[arg(long, value_name = "SECONDS")]
    grace: Option<f64>,

    /// Always run transfer phases for the full duration
    #[arg(long)]
    no_auto_shorten: bool,

    /// Concurrent download streams (uploads use at most 10)
    #[arg(long, value_name = "N")]
    streams: Option<usize>,

    /// Delay between starting consecutive streams
    #[arg(long, value_name = "MS")]
    stagger_ms: Option<u64>,

    /// Multiplier applied for protocol overhead
    #[arg(long, value_name = "FACTOR")]
    overhead: Option<f64>,

    /// Smallest chunk requested or sent
    #[arg(long, value_name = "BYTES")]
    min_chunk: Option<u64>,

    /// Largest chunk requested or sent
    #[arg(long, value_name = "BYTES")]
    max_chunk: Option<u64>,

    /// Number of ping probes
    #[arg(long, value_name = "N")]
    pings: Option<usize>,

    /// Fraction of the fastest samples averaged into the result
    #[arg(long, value_name = "FRACTION")]
    top_fraction: Option<f64>,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

impl Cli {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            max_duration_seconds: self.duration,
            grace_time_seconds: self.grace,
            auto_shorten: self.no_auto_shorten.then_some(false),
            concurrency: self.streams,
            stagger_delay_ms: self.stagger_ms,
            overhead_compensation_factor: self.overhead,
            min_chunk_bytes: self.min_chunk,
            max_chunk_bytes: self.max_chunk,
            ping_probe_count: self.pings,
            top_fraction: self.top_fraction,
        }
    }

    /// Defaults, then the settings file, then flags.
    fn settings(&self) -> Result<Settings, SpeedTestError> {
        let file = match self.config {
            Some(ref path) => SettingsOverrides::from_file(path)?,
            None => SettingsOverrides::default(),
        };

        Settings::default().merge(&file.layered(self.overrides()))
    }
}

#[tokio::main]
async fn main() {
    let cli: Cli = Cli::parse();

    let mode = DisplayMode::detect(
        cli.json,
        cli.no_tui,
        std::io::stdout().is_terminal(),
    );

    // stderr shares the screen with the TUI; keep it to errors there.
    let level = match mode {
        DisplayMode::Tui => cli.verbose.log_level_filter().min(LevelFilter::Error),
        _ => cli.verbose.log_level_filter(),
    };
    env_logger::Builder::new().filter_level(level).init();

    let server = cli.server.to_string();
    let outcome = match cli.settings() {
        Ok(settings) => run(&cli.server, settings, mode).await,
        Err(e) => Err(RunFailure::from(e)),
    };

    std::process::exit(report(mode, &server, outcome));
}

async fn run(
    server: &Url,
    settings: Settings,
    mode: DisplayMode,
) -> Result<SpeedTestOutput, RunFailure> {
    let transport = HttpTransport::new(server, &settings)?;
    info!(
        "Testing against {} with {} streams, {:.1}s max per phase",
        transport.server(),
        settings.concurrency,
        settings.max_duration.as_secs_f64()
    );

    let engine = Arc::new(TestEngine::new(Arc::new(transport), settings));
    let abort = engine.abort_handle();

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let runner = Arc::clone(&engine);
    let mut task = tokio::spawn(async move {
        runner.run(&ChannelProgress::new(events_tx)).await
    });

    let mut display = TuiController::new(mode);
    display.set_server(server.as_str());
    display.init()?;

    let mut ticker = interval(UI_REFRESH);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let joined = loop {
        tokio::select! {
            joined = &mut task => break joined,
            Some(event) = events.recv() => display.apply(&event),
            _ = ticker.tick() => {
                if display.poll_abort_key()? {
                    info!("Abort requested from keyboard");
                    abort.abort();
                }
                display.render()?;
            }
            _ = &mut ctrl_c, if !abort.is_aborted() => {
                info!("Interrupted, aborting");
                abort.abort();
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        display.apply(&event);
    }

    let result = joined.map_err(|e| {
        SpeedTestError::new(ErrorKind::Unknown, format!("test task failed: {}", e))
    })?;

    display.render()?;

    if display.mode() == DisplayMode::Tui && !abort.is_aborted() {
        tokio::task::block_in_place(|| display.wait_for_key(FINAL_SCREEN_HOLD))?;
    }
    display.cleanup()?;

    result
}

/// Print the outcome for `mode` and return the process exit code.
fn report(
    mode: DisplayMode,
    server: &str,
    outcome: Result<SpeedTestOutput, RunFailure>,
) -> i32 {
    match (mode, outcome) {
        (DisplayMode::Json, Ok(output)) => {
            let results = SpeedTestResults::from_engine_output(&output, server);
            print_json(&results)
        }
        (DisplayMode::Json, Err(failure)) => {
            let report = FailureReport::from_error(&failure.error, server)
                .with_completed(&failure.completed);
            print_json(&report);
            failure.error.exit_code()
        }
        (_, Ok(output)) => {
            print_summary(&SpeedTestResults::from_engine_output(&output, server));
            exit_codes::SUCCESS
        }
        (_, Err(failure)) => {
            let completed = &failure.completed;
            if let Some(ref ping) = completed.ping {
                print_ping(&PingResults::from_engine(ping));
            }
            if let Some(ref download) = completed.download {
                print_bandwidth("Download speed:", &BandwidthResults::from_engine(download));
            }
            eprintln!("{}", format_error_for_display(&failure.error).red());
            failure.error.exit_code()
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            exit_codes::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", format!("Error: cannot serialize results: {}", e).red());
            exit_codes::UNKNOWN_ERROR
        }
    }
}

fn print_summary(results: &SpeedTestResults) {
    println!("{} {}", "Server:".bold().white(), results.server.bright_blue());
    print_ping(&results.ping);
    print_bandwidth("Download speed:", &results.download);
    print_bandwidth("Upload speed:", &results.upload);
}

fn print_ping(ping: &PingResults) {
    println!("{} {:.2} ms", "Ping:".bold().white(), ping.ping_ms);
    println!("{} {:.2} ms", "Jitter:".bold().white(), ping.jitter_ms);
}

fn print_bandwidth(label: &str, bandwidth: &BandwidthResults) {
    let detail = format!(
        "({} streams, {:.2}s{})",
        bandwidth.streams,
        bandwidth.duration_ms / 1000.0,
        if bandwidth.early_terminated { ", shortened" } else { "" }
    );

    println!(
        "{} {} {}",
        label.bold().white(),
        format!("{:.2} Mbps", bandwidth.speed_mbps).bright_cyan(),
        detail.dimmed()
    );
}
