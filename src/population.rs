//! The set of live sessions and how new ones arrive.

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{UserConfig, WorkloadConfig, WorkloadKind};
use crate::dispatch::RequestLauncher;
use crate::error::{MetricsError, SessionError};
use crate::metrics::{summarize, MetricsSummary, RequestRecord};
use crate::session::UserSession;
use crate::trace::TraceRecord;

/// When the next session joins.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ArrivalPolicy {
    /// One session per interval, starting on the first tick
    FixedInterval(f64),
    /// Session `n` is due at `start + n * interval`; late ones catch up on the next tick
    Paced(f64),
    /// Each trace record carries its own offset from the start
    Scheduled { slowdown_factor: f64 },
}

pub struct SessionPopulation {
    config: Arc<WorkloadConfig>,
    launcher: Arc<dyn RequestLauncher>,
    arrival: ArrivalPolicy,

    /// Trace records still to be handed out, in admission order
    traces: Vec<Arc<TraceRecord>>,
    next_trace: usize,

    sessions: Vec<UserSession>,
    retired_records: Vec<RequestRecord>,
    retired_failed: usize,

    next_user_id: u64,
    admitted: usize,
    admitting: bool,
    start_time: Option<f64>,
    last_admission: Option<f64>,
}

impl SessionPopulation {
    pub fn new(
        config: Arc<WorkloadConfig>,
        launcher: Arc<dyn RequestLauncher>,
        traces: Vec<TraceRecord>,
    ) -> Self {
        let arrival = match config.kind {
            WorkloadKind::Mooncake => ArrivalPolicy::Scheduled {
                slowdown_factor: config.slowdown_factor,
            },
            WorkloadKind::ShareGpt => ArrivalPolicy::Paced(config.arrival_interval),
            _ => ArrivalPolicy::FixedInterval(config.arrival_interval),
        };
        info!(
            workload = %config.kind,
            arrival = ?arrival,
            request_gap = config.request_gap,
            traces = traces.len(),
            "Session population ready"
        );

        Self {
            config,
            launcher,
            arrival,
            traces: traces.into_iter().map(Arc::new).collect(),
            next_trace: 0,
            sessions: Vec::new(),
            retired_records: Vec::new(),
            retired_failed: 0,
            next_user_id: 0,
            admitted: 0,
            admitting: true,
            start_time: None,
            last_admission: None,
        }
    }

    /// Advance every session to `now`.
    ///
    /// Returns whether the simulation should keep running.
    pub fn step(&mut self, now: f64) -> bool {
        let start = *self.start_time.get_or_insert(now);

        if self.admitting {
            self.maybe_admit(now, start);
        }

        for session in self.sessions.iter_mut() {
            session.step(now, self.launcher.as_ref());
        }
        self.retire_finished();

        self.admitting || !self.sessions.is_empty()
    }

    /// Admit `count` sessions at once, as though they had joined one arrival
    /// interval apart before `now`.
    pub fn ramp_up(&mut self, count: usize, now: f64) -> Result<(), SessionError> {
        self.start_time.get_or_insert(now);
        for i in 0..count {
            let offset = i as f64 * self.config.arrival_interval;
            let Some(mut session) = self.create_session() else {
                break;
            };
            session.fast_forward(offset, now)?;
            self.push_session(session, now);
        }
        info!(count, active = self.sessions.len(), "Ramped up sessions");
        Ok(())
    }

    /// Stop admitting; live sessions keep running to completion.
    pub fn stop_admissions(&mut self) {
        if self.admitting {
            info!(admitted = self.admitted, "No more sessions will be admitted");
        }
        self.admitting = false;
    }

    pub fn is_admitting(&self) -> bool {
        self.admitting
    }

    pub fn admitted(&self) -> usize {
        self.admitted
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn start_time(&self) -> Option<f64> {
        self.start_time
    }

    /// Live sessions with a request in flight.
    pub fn pending(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.has_unfinished_request())
            .count()
    }

    /// Requests that ended in an error, across retired and live sessions.
    pub fn failed(&self) -> usize {
        self.retired_failed + self.sessions.iter().map(|s| s.failed_count()).sum::<usize>()
    }

    /// All completed requests so far.
    pub fn records(&self) -> Vec<RequestRecord> {
        let mut records = self.retired_records.clone();
        for session in &self.sessions {
            records.extend(session.records());
        }
        records
    }

    /// Summary over `[window_start, window_end]`, clamped to when data exists.
    pub fn summary(&self, window_start: f64, window_end: f64) -> Result<MetricsSummary, MetricsError> {
        let start = self
            .start_time
            .ok_or_else(|| MetricsError::NoData("simulation has not started".to_string()))?;

        summarize(
            &self.records(),
            window_start.max(start),
            window_end,
            self.pending(),
            self.failed(),
        )
    }

    fn maybe_admit(&mut self, now: f64, start: f64) {
        let due = match self.arrival {
            ArrivalPolicy::FixedInterval(interval) => match self.last_admission {
                None => 1,
                Some(last) => usize::from(now - last > interval),
            },
            ArrivalPolicy::Paced(interval) => {
                let scheduled = ((now - start) / interval).floor().max(0.0) as usize + 1;
                scheduled.saturating_sub(self.admitted)
            }
            ArrivalPolicy::Scheduled { slowdown_factor } => {
                match self.traces.get(self.next_trace).map(|t| t.as_ref()) {
                    Some(TraceRecord::Arrival(arrival)) => {
                        usize::from(now - start >= arrival.offset_secs(slowdown_factor))
                    }
                    _ => 1,
                }
            }
        };

        for _ in 0..due {
            let Some(session) = self.create_session() else {
                break;
            };
            self.push_session(session, now);
        }
        if self.config.kind.uses_trace() && self.next_trace >= self.traces.len() {
            info!(admitted = self.admitted, "Trace exhausted, no more sessions will be admitted");
            self.admitting = false;
        }
    }

    fn create_session(&mut self) -> Option<UserSession> {
        let trace = if self.config.kind.uses_trace() {
            let trace = self.traces.get(self.next_trace)?.clone();
            self.next_trace += 1;
            Some(trace)
        } else {
            None
        };

        self.next_user_id += 1;
        Some(UserSession::new(UserConfig::new(
            self.next_user_id,
            &self.config,
            trace,
        )))
    }

    fn push_session(&mut self, session: UserSession, now: f64) {
        info!(
            user_id = session.user_id(),
            active = self.sessions.len() + 1,
            "Joined a new user"
        );
        self.sessions.push(session);
        self.admitted += 1;
        self.last_admission = Some(now);
    }

    fn retire_finished(&mut self) {
        let before = self.sessions.len();
        let mut kept = Vec::with_capacity(before);
        for mut session in self.sessions.drain(..) {
            if session.is_finished() {
                self.retired_failed += session.failed_count();
                self.retired_records.extend(session.take_records());
            } else {
                kept.push(session);
            }
        }
        self.sessions = kept;

        let removed = before - self.sessions.len();
        if removed > 0 {
            debug!(
                removed,
                active = self.sessions.len(),
                "Removed finished sessions"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{canned_response, ScriptedLauncher};
    use crate::trace::{ArrivalRecord, ConversationTrace, PromptRecord, RoundInput};

    const T0: f64 = 5_000.0;

    fn population(
        config: WorkloadConfig,
        traces: Vec<TraceRecord>,
    ) -> (SessionPopulation, Arc<ScriptedLauncher>) {
        let launcher = Arc::new(ScriptedLauncher::new());
        let population = SessionPopulation::new(Arc::new(config), launcher.clone(), traces);
        (population, launcher)
    }

    fn arrival(timestamp_ms: u64) -> TraceRecord {
        TraceRecord::Arrival(ArrivalRecord {
            timestamp_ms,
            hash_ids: vec![1],
            output_length: 4,
        })
    }

    fn prompts(count: usize) -> Vec<TraceRecord> {
        (0..count)
            .map(|i| {
                TraceRecord::Prompt(PromptRecord {
                    input: format!("prompt {}", i),
                    output_length: 4,
                })
            })
            .collect()
    }

    fn conversation() -> TraceRecord {
        TraceRecord::Conversation(ConversationTrace {
            rounds: vec![vec![RoundInput {
                input: "hello".to_string(),
                max_tokens: 4,
            }]],
        })
    }

    #[test]
    fn test_scheduled_arrivals_follow_trace_offsets() {
        let config = WorkloadConfig {
            kind: WorkloadKind::Mooncake,
            ..Default::default()
        };
        let (mut population, _launcher) = population(config, vec![arrival(0), arrival(2000)]);

        for i in 0..=19 {
            population.step(T0 + i as f64 * 0.1);
        }
        assert_eq!(population.admitted(), 1);

        for i in 20..=26 {
            population.step(T0 + i as f64 * 0.1);
        }
        assert_eq!(population.admitted(), 2);
        assert!(!population.is_admitting());
    }

    #[test]
    fn test_slowdown_stretches_offsets() {
        let config = WorkloadConfig {
            kind: WorkloadKind::Mooncake,
            slowdown_factor: 2.0,
            ..Default::default()
        };
        let (mut population, _launcher) = population(config, vec![arrival(0), arrival(1000)]);

        population.step(T0);
        population.step(T0 + 1.5);
        assert_eq!(population.admitted(), 1);
        population.step(T0 + 2.0);
        assert_eq!(population.admitted(), 2);
    }

    #[test]
    fn test_fixed_interval_admits_on_first_tick() {
        let config = WorkloadConfig {
            num_rounds: 100,
            arrival_interval: 1.0,
            ..Default::default()
        };
        let (mut population, launcher) = population(config, Vec::new());

        population.step(T0);
        assert_eq!(population.admitted(), 1);
        assert_eq!(launcher.launched().len(), 1);

        for i in 1..=30 {
            population.step(T0 + i as f64 * 0.1);
        }
        // joins at 0.0, ~1.1 and ~2.2
        assert_eq!(population.admitted(), 3);
        assert!(population.is_admitting());
        assert_eq!(population.pending(), 3);
    }

    #[test]
    fn test_paced_arrivals_keep_offered_rate_above_tick_rate() {
        let config = WorkloadConfig {
            kind: WorkloadKind::ShareGpt,
            qps: Some(20.0),
            arrival_interval: 0.05,
            ..Default::default()
        };
        let (mut population, launcher) = population(config, prompts(500));

        population.step(T0);
        assert_eq!(population.admitted(), 1);

        for i in 1..=50 {
            population.step(T0 + i as f64 * 0.1);
        }
        population.step(T0 + 5.02);

        // Sessions 0..=100 are due by 5.02s at 20 per second
        assert_eq!(population.admitted(), 101);
        assert_eq!(launcher.launched().len(), 101);
        assert!(population.is_admitting());
    }

    #[test]
    fn test_paced_arrivals_catch_up_after_a_slow_tick() {
        let config = WorkloadConfig {
            kind: WorkloadKind::ShareGpt,
            qps: Some(4.0),
            arrival_interval: 0.25,
            ..Default::default()
        };
        let (mut population, _launcher) = population(config, prompts(500));

        population.step(T0);
        population.step(T0 + 2.1);
        assert_eq!(population.admitted(), 9);

        population.step(T0 + 2.2);
        assert_eq!(population.admitted(), 9);
    }

    #[test]
    fn test_paced_arrivals_stop_at_end_of_trace() {
        let config = WorkloadConfig {
            kind: WorkloadKind::ShareGpt,
            qps: Some(10.0),
            arrival_interval: 0.1,
            ..Default::default()
        };
        let (mut population, _launcher) = population(config, prompts(3));

        population.step(T0);
        population.step(T0 + 1.05);
        assert_eq!(population.admitted(), 3);
        assert!(!population.is_admitting());
    }

    #[test]
    fn test_trace_sessions_stop_when_exhausted() {
        let config = WorkloadConfig {
            kind: WorkloadKind::Agentic,
            arrival_interval: 0.5,
            ..Default::default()
        };
        let (mut population, launcher) = population(config, vec![conversation(), conversation()]);

        let mut now = T0;
        let mut running = true;
        while running && now < T0 + 10.0 {
            running = population.step(now);
            while launcher.complete_next(canned_response("hi", now, 3, 0)) {}
            now += 0.1;
        }

        assert!(!running);
        assert_eq!(population.admitted(), 2);
        assert_eq!(population.live_sessions(), 0);
        assert_eq!(population.records().len(), 2);
    }

    #[test]
    fn test_finished_sessions_retire_with_their_records() {
        let config = WorkloadConfig {
            num_rounds: 1,
            arrival_interval: 100.0,
            ..Default::default()
        };
        let (mut population, launcher) = population(config, Vec::new());

        population.step(T0);
        launcher.complete_next(canned_response("done", T0, 5, 0));
        population.step(T0 + 0.1);

        assert_eq!(population.live_sessions(), 0);
        assert_eq!(population.records().len(), 1);
        assert_eq!(population.records()[0].user_id, 1);
    }

    #[test]
    fn test_failures_survive_retirement() {
        let config = WorkloadConfig {
            num_rounds: 1,
            arrival_interval: 100.0,
            ..Default::default()
        };
        let (mut population, launcher) = population(config, Vec::new());

        population.step(T0);
        launcher.fail_next(crate::error::ClientError::Protocol("bad".to_string()));
        assert_eq!(population.failed(), 1);

        population.step(T0 + 0.1);
        assert_eq!(population.live_sessions(), 0);
        assert_eq!(population.failed(), 1);
        assert!(population.records().is_empty());
    }

    #[test]
    fn test_summary_is_idempotent() {
        let config = WorkloadConfig {
            num_rounds: 2,
            arrival_interval: 0.5,
            ..Default::default()
        };
        let (mut population, launcher) = population(config, Vec::new());

        for i in 0..=30 {
            let now = T0 + i as f64 * 0.1;
            population.step(now);
            while launcher.complete_next(canned_response("x", now, 4, 0)) {}
        }
        population.stop_admissions();

        let first = population.summary(T0, T0 + 10.0).unwrap();
        let second = population.summary(T0, T0 + 10.0).unwrap();
        assert_eq!(first, second);
        assert!(first.finished > 0);
        assert_eq!(first.pending, 0);
    }

    #[test]
    fn test_summary_without_data() {
        let (mut population, _launcher) = population(WorkloadConfig::default(), Vec::new());
        assert!(matches!(
            population.summary(0.0, 10.0),
            Err(MetricsError::NoData(_))
        ));

        population.step(T0);
        assert!(matches!(
            population.summary(T0, T0 + 1.0),
            Err(MetricsError::NoData(_))
        ));
    }

    #[test]
    fn test_ramp_up_fast_forwards_sessions() {
        let config = WorkloadConfig {
            num_rounds: 10,
            arrival_interval: 2.0,
            request_gap: 1.0,
            ..Default::default()
        };
        let (mut population, launcher) = population(config, Vec::new());

        population.ramp_up(3, T0).unwrap();
        assert_eq!(population.admitted(), 3);
        assert_eq!(population.live_sessions(), 3);

        // Offsets 0, 2 and 4 seconds put the sessions at rounds 1, 3 and 5
        let rounds: Vec<usize> = population.sessions.iter().map(|s| s.question_id()).collect();
        assert_eq!(rounds, vec![1, 3, 5]);

        population.step(T0);
        assert!(launcher.launched().is_empty());
        population.step(T0 + 1.1);
        assert_eq!(launcher.launched().len(), 3);
    }
}
