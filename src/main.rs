use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use ratewatch::config::{LoggingConfig, RatewatchConfig};
use ratewatch::measure::ThroughputMeasure;
use ratewatch::throttle::RateLimiter;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Measure the throughput of standard input.
#[derive(Debug, Parser)]
#[command(name = "ratewatch", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of slots in the measurement window
    #[arg(long)]
    buffer_size: Option<u32>,

    /// Measurement window in milliseconds
    #[arg(long)]
    window_ms: Option<i64>,

    /// Maximum progress reports per second (0 reports every read)
    #[arg(long)]
    report_hz: Option<f32>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,

    /// Log filter, e.g. `debug` or `ratewatch=trace`
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Command-line flags win over the configuration file.
    fn apply(&self, config: &mut RatewatchConfig) {
        if let Some(buffer_size) = self.buffer_size {
            config.measure.buffer_size = buffer_size;
        }
        if let Some(window_ms) = self.window_ms {
            config.measure.window_ms = window_ms;
        }
        if let Some(hz) = self.report_hz {
            config.report.max_frequency_hz = Some(hz);
            config.report.min_interval_ms = None;
        }
        if self.json {
            config.report.json = true;
        }
        if let Some(ref level) = self.log_level {
            config.logging.level = level.clone();
        }
    }
}

/// Final throughput report.
#[derive(Debug, Serialize)]
struct Report {
    bitrate_bps: Option<f64>,
    readable: String,
    bytes_total: u64,
    window_ms: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = RatewatchConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging);

    info!(
        buffer_size = config.measure.buffer_size,
        window_ms = config.measure.window_ms,
        "Measuring standard input"
    );

    let measure = Arc::new(ThroughputMeasure::new(
        config.measure.buffer_size,
        config.measure.window_ms,
    )?);
    let bytes_total = Arc::new(AtomicU64::new(0));

    let progress = {
        let measure = Arc::clone(&measure);
        move || eprintln!("{}", measure.readable_bitrate())
    };
    let reporter = RateLimiter::new(progress, config.report.throttle())?;
    debug!(
        limiter = %reporter.id(),
        min_interval_ms = reporter.min_interval(),
        "Progress reporter ready"
    );

    tokio::select! {
        result = pump_stdin(&measure, &reporter, &bytes_total) => {
            result?;
            info!("Reached end of input");
        }
        _ = shutdown_signal() => {}
    }

    // Stop progress output before printing the final report.
    let dropped = reporter.dropped_tasks_count();
    drop(reporter);
    debug!(dropped = dropped, "Progress reports coalesced");

    let report = Report {
        bitrate_bps: measure.bitrate(),
        readable: measure.readable_bitrate(),
        bytes_total: bytes_total.load(Ordering::SeqCst),
        window_ms: measure.window_length(),
    };

    if config.report.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!("{} ({} bytes read)", report.readable, report.bytes_total);
    }

    Ok(())
}

/// Count every chunk read from standard input until EOF.
async fn pump_stdin(
    measure: &ThroughputMeasure,
    reporter: &RateLimiter,
    bytes_total: &AtomicU64,
) -> std::io::Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = stdin.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        measure.count_bytes(read as i64);
        bytes_total.fetch_add(read as u64, Ordering::SeqCst);
        reporter.request();
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping measurement");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping measurement");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "ratewatch",
            "--buffer-size",
            "4",
            "--window-ms",
            "4000",
            "--report-hz",
            "10",
            "--json",
            "--log-level",
            "debug",
        ])
        .unwrap();

        let mut config = RatewatchConfig::default();
        config.report.min_interval_ms = Some(500);
        args.apply(&mut config);

        assert_eq!(config.measure.buffer_size, 4);
        assert_eq!(config.measure.window_ms, 4000);
        assert_eq!(config.report.max_frequency_hz, Some(10.0));
        assert_eq!(config.report.min_interval_ms, None);
        assert!(config.report.json);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_flags_keep_config() {
        let args = Args::try_parse_from(["ratewatch"]).unwrap();
        let mut config = RatewatchConfig::default();
        args.apply(&mut config);

        assert_eq!(config.measure.buffer_size, 10);
        assert_eq!(config.report.max_frequency_hz, None);
        assert!(!config.report.json);
    }

    #[test]
    fn test_report_serializes_missing_bitrate_as_null() {
        let report = Report {
            bitrate_bps: None,
            readable: "N/A".to_string(),
            bytes_total: 0,
            window_ms: 1000,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(
            json,
            r#"{"bitrate_bps":null,"readable":"N/A","bytes_total":0,"window_ms":1000}"#
        );
    }
}
