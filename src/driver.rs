//! The fixed-tick stepping loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::WorkloadConfig;
use crate::dispatch::{DispatchBridge, RequestLauncher};
use crate::error::{DispatchError, MetricsError, SessionError};
use crate::http_client::ChatRequest;
use crate::metrics::{MetricsSummary, RequestRecord};
use crate::models::ChatMessage;
use crate::population::SessionPopulation;
use crate::trace::TraceRecord;
use crate::utils::unix_now;

/// Token budget of each warmup request
const WARMUP_MAX_TOKENS: u32 = 8;

/// How often a blocking drain rechecks the abort flag
const DRAIN_POLL: Duration = Duration::from_millis(200);

/// Why the tick loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Admission is over and every session finished
    Completed,
    /// The configured run time elapsed
    TimeLimit,
    /// An interrupt or terminate signal arrived
    Interrupted,
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub reason: StopReason,
    pub start_time: f64,
    pub end_time: f64,
    pub admitted: usize,
    pub failed: usize,
    pub records: Vec<RequestRecord>,
    pub summary: Result<MetricsSummary, MetricsError>,
}

pub struct Driver {
    config: Arc<WorkloadConfig>,
    bridge: Arc<DispatchBridge>,
    launcher: Arc<dyn RequestLauncher>,
    population: SessionPopulation,
    stop: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
}

impl Driver {
    pub fn new(
        config: Arc<WorkloadConfig>,
        bridge: Arc<DispatchBridge>,
        launcher: Arc<dyn RequestLauncher>,
        traces: Vec<TraceRecord>,
    ) -> Self {
        let population = SessionPopulation::new(config.clone(), launcher.clone(), traces);
        Self {
            config,
            bridge,
            launcher,
            population,
            stop: Arc::new(AtomicBool::new(false)),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that ends the tick loop with an orderly drain when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Flag that makes any blocking wait give up on in-flight requests.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Watch for Ctrl+C / SIGTERM on the dispatch runtime.
    ///
    /// The first signal stops the loop and drains; a second one abandons the drain.
    pub fn install_signal_handler(&self) -> Result<(), DispatchError> {
        let stop = self.stop.clone();
        let abort = self.abort.clone();
        self.bridge.spawn_background(async move {
            shutdown_signal().await;
            stop.store(true, Ordering::SeqCst);
            info!("Send the signal again to stop without waiting for in-flight requests");

            shutdown_signal().await;
            abort.store(true, Ordering::SeqCst);
        })
    }

    /// Issue the configured throwaway requests and wait for all of them.
    ///
    /// Returns how many succeeded.
    pub fn warmup(&self) -> usize {
        let count = self.config.warmup_requests;
        if count == 0 {
            return 0;
        }
        info!(count, "Running warmup requests...");

        let succeeded = Arc::new(AtomicUsize::new(0));
        for i in 0..count {
            let request = ChatRequest {
                messages: vec![ChatMessage::user(format!(
                    "Warmup request #{}: say hello.",
                    i + 1
                ))],
                max_tokens: WARMUP_MAX_TOKENS,
                agent_index: i % self.config.num_agents.max(1),
                headers: Vec::new(),
            };
            let succeeded = succeeded.clone();
            let launched = self.launcher.launch(
                request,
                Box::new(move |outcome| {
                    if outcome.is_ok() {
                        succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                }),
            );
            if let Err(e) = launched {
                warn!(error = %e, "Failed to launch warmup request");
            }
        }

        self.wait_for_in_flight();
        let succeeded = succeeded.load(Ordering::Relaxed);
        if succeeded < count {
            warn!(succeeded, count, "Some warmup requests failed");
        } else {
            info!(count, "✅ Warmup complete");
        }
        succeeded
    }

    /// Run the tick loop, then drain in-flight requests and summarize.
    pub fn run(mut self) -> Result<RunOutcome, SessionError> {
        let tick = self.config.tick;
        let start = unix_now();

        if self.config.ramp_up_users > 0 {
            self.population.ramp_up(self.config.ramp_up_users, start)?;
        }

        let mut last_summary = start;
        let reason = loop {
            let now = unix_now();

            if self.stop.load(Ordering::SeqCst) {
                info!("Received shutdown signal, draining...");
                break StopReason::Interrupted;
            }
            if let Some(limit) = self.config.run_time {
                if now - start >= limit {
                    info!(limit_secs = limit, "Time limit reached, draining...");
                    break StopReason::TimeLimit;
                }
            }
            if !self.population.step(now) {
                info!(admitted = self.population.admitted(), "All sessions finished");
                break StopReason::Completed;
            }

            if now - last_summary >= self.config.log_interval {
                self.log_window(last_summary, now);
                last_summary = now;
            }

            std::thread::sleep(tick);
        };

        self.drain();

        let end = unix_now();
        Ok(RunOutcome {
            reason,
            start_time: start,
            end_time: end,
            admitted: self.population.admitted(),
            failed: self.population.failed(),
            records: self.population.records(),
            summary: self.population.summary(start, end),
        })
    }

    fn drain(&mut self) {
        self.population.stop_admissions();
        let pending = self.population.pending();
        if pending > 0 {
            info!(pending, "Waiting for in-flight requests");
        }
        self.wait_for_in_flight();
    }

    /// Block until the bridge is idle or the abort flag is raised.
    ///
    /// Returns whether the bridge went idle.
    fn wait_for_in_flight(&self) -> bool {
        while !self.bridge.wait_idle(Some(DRAIN_POLL)) {
            if self.abort.load(Ordering::SeqCst) {
                warn!(
                    in_flight = self.bridge.in_flight(),
                    "Abandoning in-flight requests"
                );
                return false;
            }
        }
        true
    }

    fn log_window(&self, window_start: f64, window_end: f64) {
        match self.population.summary(window_start, window_end) {
            Ok(summary) => summary.log(),
            Err(e) => info!(
                live_sessions = self.population.live_sessions(),
                pending = self.population.pending(),
                reason = %e,
                "No completed requests in this interval"
            ),
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
