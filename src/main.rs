use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use chat_loadgen::config::{CliArgs, LogFormat, WorkloadConfig};
use chat_loadgen::dispatch::{BridgedClient, DispatchBridge, RequestLauncher};
use chat_loadgen::driver::{Driver, StopReason};
use chat_loadgen::http_client::StreamingRequestClient;
use chat_loadgen::mock_server::{MockServer, MockServerConfig};
use chat_loadgen::report::write_csv;
use chat_loadgen::trace::load_trace;

/// How long teardown waits for stragglers once the run has drained
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let args = CliArgs::load();
    init_logging(&args.log_level, args.log_format);

    tracing::info!("🚀 chat-loadgen starting...");

    let mut config = WorkloadConfig::from_args(&args).context("Invalid configuration")?;

    let traces = match &config.trace_file {
        Some(path) => load_trace(path, config.kind, config.num_agents)
            .with_context(|| format!("Failed to load trace file {}", path.display()))?,
        None => Vec::new(),
    };

    let bridge = Arc::new(DispatchBridge::new());

    // Kept alive until the run ends
    let _mock_server = if config.standalone {
        let mut server = MockServer::new(MockServerConfig::default());
        let port = bridge
            .block_on(server.start())?
            .context("Failed to start mock endpoint")?;
        config.base_url = server.url();
        tracing::info!("✅ Standalone mode: mock endpoint on port {}", port);
        Some(server)
    } else {
        None
    };

    let client = Arc::new(
        StreamingRequestClient::new(
            &config.base_url,
            config.models.clone(),
            config.api_key.clone(),
            config.request_timeout,
        )
        .context("Failed to build HTTP client")?,
    );
    tracing::info!("✅ HTTP client ready: {}", client.endpoint());

    print_run_banner(&config, traces.len());

    let config = Arc::new(config);
    let launcher: Arc<dyn RequestLauncher> =
        Arc::new(BridgedClient::new(bridge.clone(), client));
    let driver = Driver::new(config.clone(), bridge.clone(), launcher, traces);

    if let Err(e) = driver.install_signal_handler() {
        tracing::warn!("Signal handling unavailable: {}", e);
    }

    driver.warmup();
    let outcome = driver.run().context("Simulation failed")?;

    let stragglers = bridge.shutdown(Some(SHUTDOWN_GRACE));
    if stragglers > 0 {
        tracing::warn!("{} requests were cancelled at shutdown", stragglers);
    }

    match outcome.reason {
        StopReason::Completed => tracing::info!("All sessions completed"),
        StopReason::TimeLimit => tracing::info!("Stopped at the time limit"),
        StopReason::Interrupted => tracing::info!("Stopped by signal"),
    }
    tracing::info!(
        "Admitted {} users, {} requests completed, {} failed",
        outcome.admitted,
        outcome.records.len(),
        outcome.failed
    );

    match &outcome.summary {
        Ok(summary) => summary.log(),
        Err(e) => tracing::warn!("No summary available: {}", e),
    }

    write_csv(&config.output, &outcome.records).context("Failed to write results")?;

    tracing::info!("👋 Done");
    Ok(())
}

fn init_logging(log_level: &str, format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print_run_banner(config: &WorkloadConfig, trace_records: usize) {
    println!();
    println!("  📈 chat-loadgen");
    println!("  ─────────────────────────────────────");
    println!("  Endpoint:   {}", config.base_url);
    println!("  Models:     {}", config.models.join(", "));
    println!("  Workload:   {} ({} history)", config.kind, config.history);
    if config.kind.uses_trace() {
        println!("  Trace:      {} records", trace_records);
    } else {
        println!(
            "  Rounds:     {} per user, {:.2}s apart",
            config.num_rounds, config.request_gap
        );
    }
    println!("  Arrival:    every {:.2}s", config.arrival_interval);
    match config.run_time {
        Some(limit) => println!("  Run time:   {:.0}s", limit),
        None => println!("  Run time:   until all sessions finish"),
    }
    println!("  Output:     {}", config.output.display());
    println!();
}
