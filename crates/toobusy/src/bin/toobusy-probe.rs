//! toobusy-probe - watch the lag monitor react to synthetic load
//!
//! Usage:
//!   toobusy-probe --max-lag-ms 20 --interval-ms 100 --load-ms 150 --run-for 10s
//!   RUST_LOG=toobusy=debug toobusy-probe --json

use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Samples event-loop lag on a single-threaded runtime and reports the
/// smoothed busyness signal
#[derive(Debug, Clone, Parser)]
#[command(name = "toobusy-probe")]
#[command(about = "Reports runtime scheduling lag as seen by the toobusy monitor")]
struct Args {
    /// Busyness threshold in milliseconds (overrides TOOBUSY_MAX_LAG_MS)
    #[arg(long)]
    max_lag_ms: Option<f64>,

    /// Sampling interval in milliseconds (overrides TOOBUSY_INTERVAL_MS)
    #[arg(long)]
    interval_ms: Option<f64>,

    /// Smoothing factor applied when lag rises
    #[arg(long)]
    smoothing_factor_on_rise: Option<f64>,

    /// Smoothing factor applied when lag falls
    #[arg(long)]
    smoothing_factor_on_fall: Option<f64>,

    /// Block the runtime for this many milliseconds per load burst (0 disables)
    #[arg(long, env = "TOOBUSY_PROBE_LOAD_MS", default_value_t = 0)]
    load_ms: u64,

    /// Pause between load bursts
    #[arg(long, default_value = "250ms", value_parser = humantime::parse_duration)]
    load_every: Duration,

    /// How often to print a snapshot
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    report_every: Duration,

    /// Total run time before shutting down
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    run_for: Duration,

    /// Print snapshots as JSON lines instead of log lines
    #[arg(long, env = "TOOBUSY_PROBE_JSON")]
    json: bool,
}

impl Args {
    fn lag_config(&self) -> anyhow::Result<toobusy::LagConfig> {
        let mut config =
            toobusy::LagConfig::from_env().context("Invalid TOOBUSY_* environment")?;
        if let Some(v) = self.max_lag_ms {
            config.max_lag_ms = v;
        }
        if let Some(v) = self.interval_ms {
            config.interval_ms = v;
        }
        if let Some(v) = self.smoothing_factor_on_rise {
            config.smoothing_factor_on_rise = v;
        }
        if let Some(v) = self.smoothing_factor_on_fall {
            config.smoothing_factor_on_fall = v;
        }
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let monitor = toobusy::init(args.lag_config()?, &Handle::current())
        .context("Failed to start lag monitor")?;

    info!(
        max_lag_ms = monitor.max_lag(),
        interval_ms = monitor.interval(),
        load_ms = args.load_ms,
        run_for = %humantime::format_duration(args.run_for),
        "Starting toobusy probe"
    );

    monitor.on_lag(
        |lag| warn!(lag_ms = lag, "Runtime lag above threshold"),
        None,
    );

    if args.load_ms > 0 {
        let burst = Duration::from_millis(args.load_ms);
        let pause = args.load_every;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(pause).await;
                // Deliberately blocks the only runtime thread
                std::thread::sleep(burst);
            }
        });
    }

    let mut report = tokio::time::interval(args.report_every);
    let deadline = tokio::time::sleep(args.run_for);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = report.tick() => print_snapshot(&monitor.snapshot(), args.json)?,
        }
    }

    toobusy::shutdown();
    print_snapshot(&monitor.snapshot(), args.json)?;
    info!("Probe finished");
    Ok(())
}

fn print_snapshot(snapshot: &toobusy::LagSnapshot, json: bool) -> anyhow::Result<()> {
    if json {
        let line = serde_json::to_string(snapshot).context("Failed to serialize snapshot")?;
        println!("{}", line);
    } else {
        info!(
            lag_ms = snapshot.current_lag_ms,
            max_lag_ms = snapshot.max_lag_ms,
            busy = snapshot.busy,
            samples = snapshot.samples,
            started = snapshot.started,
            "Lag snapshot"
        );
    }
    Ok(())
}
