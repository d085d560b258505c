//! One simulated user.
//!
//! A session issues at most one request at a time. The tick loop drives
//! [`UserSession::step`]; the completion callback of the in-flight request
//! runs on the dispatch worker and only touches this session's shared state.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::config::UserConfig;
use crate::conversation::ConversationState;
use crate::dispatch::{Completion, RequestLauncher};
use crate::error::{ClientError, SessionError};
use crate::http_client::{ChatRequest, Response};
use crate::metrics::RequestRecord;
use crate::models::ChatMessage;
use crate::trace::TraceRecord;

/// Minimum simulated seconds between two "falling behind" warnings.
const BACKLOG_WARNING_INTERVAL: f64 = 10.0;

/// State shared with the completion callback.
#[derive(Debug)]
struct SessionState {
    history: ConversationState,
    in_flight: bool,
    records: Vec<RequestRecord>,
    failed: usize,
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// What the next request sends.
struct Turn {
    query: String,
    max_tokens: u32,
    agent_index: usize,
}

pub struct UserSession {
    config: UserConfig,
    shared: Arc<Mutex<SessionState>>,

    /// Rounds consumed, including rounds skipped by a fast-forward
    question_id: usize,
    /// Requests actually handed to the launcher
    launched: usize,
    last_request_time: Option<f64>,
    last_backlog_warning: f64,
    finished: bool,
}

impl UserSession {
    pub fn new(config: UserConfig) -> Self {
        let history = ConversationState::new(config.history);
        Self {
            config,
            shared: Arc::new(Mutex::new(SessionState {
                history,
                in_flight: false,
                records: Vec::new(),
                failed: 0,
            })),
            question_id: 0,
            launched: 0,
            last_request_time: None,
            last_backlog_warning: 0.0,
            finished: false,
        }
    }

    pub fn user_id(&self) -> u64 {
        self.config.user_id
    }

    pub fn config(&self) -> &UserConfig {
        &self.config
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn has_unfinished_request(&self) -> bool {
        lock(&self.shared).in_flight
    }

    pub fn question_id(&self) -> usize {
        self.question_id
    }

    pub fn launched(&self) -> usize {
        self.launched
    }

    pub fn last_request_time(&self) -> Option<f64> {
        self.last_request_time
    }

    pub fn failed_count(&self) -> usize {
        lock(&self.shared).failed
    }

    pub fn records(&self) -> Vec<RequestRecord> {
        lock(&self.shared).records.clone()
    }

    /// Move the collected records out, leaving the session's list empty.
    pub fn take_records(&mut self) -> Vec<RequestRecord> {
        std::mem::take(&mut lock(&self.shared).records)
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        lock(&self.shared).history.messages().to_vec()
    }

    /// Place the session `offset` seconds after the simulation start.
    ///
    /// Rounds that would already have been issued by then are skipped, and the
    /// request clock is aligned to the last skipped round.
    pub fn fast_forward(&mut self, offset: f64, now: f64) -> Result<(), SessionError> {
        if self.launched > 0 || self.last_request_time.is_some() {
            return Err(SessionError::AlreadyStarted {
                user_id: self.config.user_id,
                issued: self.launched,
            });
        }

        let gap = self.config.request_gap;
        let passed = (offset.max(0.0) / gap).floor() as usize + 1;
        let passed_time = (passed - 1) as f64 * gap;

        self.question_id = passed;
        self.last_request_time = Some(now - offset + passed_time);
        debug!(
            user_id = self.config.user_id,
            question_id = self.question_id,
            last_request_time = ?self.last_request_time,
            "Fast-forwarded session"
        );
        Ok(())
    }

    /// Advance the session to `now`, launching a request if one is due.
    pub fn step(&mut self, now: f64, launcher: &dyn RequestLauncher) {
        if self.finished {
            return;
        }

        let in_flight = self.has_unfinished_request();
        if self.question_id >= self.config.round_budget() && !in_flight {
            self.finished = true;
            debug!(
                user_id = self.config.user_id,
                requests = self.launched,
                "Session finished"
            );
            return;
        }

        let Some(last) = self.last_request_time else {
            self.launch_next(now, launcher);
            return;
        };

        if now - last > self.config.request_gap {
            if in_flight {
                if now - self.last_backlog_warning > BACKLOG_WARNING_INTERVAL {
                    warn!(
                        user_id = self.config.user_id,
                        "User has an unfinished request and cannot keep the request interval"
                    );
                    self.last_backlog_warning = now;
                }
                return;
            }
            self.launch_next(now, launcher);
        }
    }

    fn launch_next(&mut self, now: f64, launcher: &dyn RequestLauncher) {
        let shared = self.shared.clone();
        let mut state = lock(&shared);
        debug_assert!(!state.in_flight);

        let Some(turn) = self.next_turn(state.history.is_empty()) else {
            warn!(
                user_id = self.config.user_id,
                question_id = self.question_id,
                "Trace has no entry for this round, ending session"
            );
            self.question_id = self.config.round_budget();
            return;
        };

        if let Err(e) = state.history.on_user_query(turn.query) {
            error!(user_id = self.config.user_id, error = %e, "Refusing to send malformed history");
            return;
        }
        state.in_flight = true;
        let messages = state.history.messages().to_vec();
        drop(state);

        let input = serde_json::to_string(&messages).unwrap_or_default();
        let mut headers = Vec::new();
        if self.config.send_user_id {
            headers.push(("x-user-id".to_string(), self.config.user_id.to_string()));
        }

        let request = ChatRequest {
            messages,
            max_tokens: turn.max_tokens,
            agent_index: turn.agent_index,
            headers,
        };
        let context = CompletionContext {
            user_id: self.config.user_id,
            question_id: self.question_id,
            model: self.config.model_for(turn.agent_index).to_string(),
            input,
        };
        let callback_state = self.shared.clone();
        let on_complete: Completion =
            Box::new(move |outcome| context.finish(&callback_state, outcome));

        self.launched += 1;
        self.last_request_time = Some(now);
        debug!(
            user_id = self.config.user_id,
            question_id = self.question_id,
            agent = turn.agent_index,
            "Issuing request"
        );

        if let Err(e) = launcher.launch(request, on_complete) {
            error!(
                user_id = self.config.user_id,
                question_id = self.question_id,
                error = %e,
                "Failed to launch request"
            );
            let mut state = lock(&self.shared);
            state.history.abandon_pending_query();
            state.in_flight = false;
            state.failed += 1;
        }
    }

    /// Build the next query and advance the round counter.
    fn next_turn(&mut self, history_empty: bool) -> Option<Turn> {
        let num_agents = self.config.num_agents.max(1);
        let agent_index = self.question_id % num_agents;

        let turn = match self.config.trace.as_deref() {
            None => {
                let mut query = format!(
                    "Here's question #{}: can you tell me a new long story with a happy ending?",
                    self.question_id + 1
                );
                if history_empty {
                    query = self.system_prompt() + &query;
                }
                Turn {
                    query,
                    max_tokens: self.config.answer_len,
                    agent_index,
                }
            }
            Some(TraceRecord::Conversation(trace)) => {
                let round = trace.turn(self.question_id / num_agents, agent_index)?;
                Turn {
                    query: round.input.clone(),
                    max_tokens: round.max_tokens,
                    agent_index,
                }
            }
            Some(TraceRecord::Arrival(arrival)) => Turn {
                query: arrival.prompt(),
                max_tokens: if self.config.prefill_only {
                    1
                } else {
                    arrival.output_length
                },
                agent_index,
            },
            Some(TraceRecord::Prompt(prompt)) => Turn {
                // The rate prefix keeps runs at different rates from sharing a prompt cache
                query: match self.config.qps {
                    Some(qps) => format!("{} {}", qps, prompt.input),
                    None => prompt.input.clone(),
                },
                max_tokens: prompt.output_length,
                agent_index,
            },
        };

        self.question_id += 1;
        Some(turn)
    }

    fn system_prompt(&self) -> String {
        let filler = |len: usize| vec!["hi"; len].join(" ");
        format!(
            "Hi, here's some system prompt: {}.For user {}, here are some other context: {}.",
            filler(self.config.system_prompt_len),
            self.config.user_id,
            filler(self.config.user_info_len)
        )
    }
}

/// What the completion callback needs to file its result.
struct CompletionContext {
    user_id: u64,
    question_id: usize,
    model: String,
    input: String,
}

impl CompletionContext {
    fn finish(self, shared: &Mutex<SessionState>, outcome: Result<Response, ClientError>) {
        let mut state = lock(shared);
        state.in_flight = false;

        match outcome {
            Ok(response) => {
                if let Err(e) = state
                    .history
                    .on_assistant_response(response.body.clone(), response.agent_index)
                {
                    warn!(user_id = self.user_id, error = %e, "Dropping out-of-order response from history");
                }
                debug!(
                    user_id = self.user_id,
                    prompt_tokens = response.prompt_tokens,
                    generation_tokens = response.generation_tokens,
                    "Request finished"
                );
                state.records.push(RequestRecord {
                    prompt_tokens: response.prompt_tokens,
                    generation_tokens: response.generation_tokens,
                    ttft: response.ttft(),
                    generation_time: response.generation_time(),
                    user_id: self.user_id,
                    question_id: self.question_id,
                    launch_time: response.launch_time,
                    finish_time: response.finish_time,
                    agent_id: response.agent_index,
                    input: self.input,
                    output: response.body,
                });
            }
            Err(e) => {
                state.history.abandon_pending_query();
                state.failed += 1;
                error!(
                    user_id = self.user_id,
                    question_id = self.question_id,
                    model = %self.model,
                    error = %e,
                    "Request failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{WorkloadConfig, WorkloadKind};
    use crate::conversation::{roles_alternate, HistoryPolicy};
    use crate::dispatch::testing::{canned_response, ScriptedLauncher};
    use crate::models::Role;
    use crate::trace::{ArrivalRecord, ConversationTrace, PromptRecord, RoundInput};

    const T0: f64 = 1_000.0;

    fn synthetic(num_rounds: usize, num_agents: usize, history: HistoryPolicy) -> UserSession {
        let workload = WorkloadConfig {
            num_rounds,
            num_agents,
            models: vec!["m".to_string(); num_agents],
            history,
            system_prompt_len: 3,
            user_info_len: 2,
            answer_len: 32,
            request_gap: 1.0,
            ..Default::default()
        };
        UserSession::new(UserConfig::new(7, &workload, None))
    }

    fn traced(kind: WorkloadKind, record: TraceRecord, num_agents: usize) -> UserSession {
        let workload = WorkloadConfig {
            kind,
            num_agents,
            models: vec!["m".to_string(); num_agents],
            qps: Some(2.0),
            send_user_id: kind == WorkloadKind::Agentic,
            ..Default::default()
        };
        UserSession::new(UserConfig::new(3, &workload, Some(Arc::new(record))))
    }

    #[test]
    fn test_first_step_launches_immediately() {
        let launcher = ScriptedLauncher::new();
        let mut session = synthetic(3, 1, HistoryPolicy::Full);

        session.step(T0, &launcher);

        let launched = launcher.launched();
        assert_eq!(launched.len(), 1);
        assert!(session.has_unfinished_request());
        assert_eq!(session.last_request_time(), Some(T0));
        assert_eq!(launched[0].max_tokens, 32);
        assert_eq!(
            launched[0].headers,
            vec![("x-user-id".to_string(), "7".to_string())]
        );
        assert_eq!(
            launched[0].messages[0].content,
            "Hi, here's some system prompt: hi hi hi.For user 7, here are some other context: hi hi.\
             Here's question #1: can you tell me a new long story with a happy ending?"
        );
    }

    #[test]
    fn test_never_two_requests_in_flight() {
        let launcher = ScriptedLauncher::new();
        let mut session = synthetic(5, 1, HistoryPolicy::Full);

        session.step(T0, &launcher);
        session.step(T0 + 0.5, &launcher);
        session.step(T0 + 1.5, &launcher);
        session.step(T0 + 30.0, &launcher);
        assert_eq!(launcher.launched().len(), 1);
        assert_eq!(launcher.pending(), 1);

        assert!(launcher.complete_next(canned_response("story", T0, 5, 0)));
        assert!(!session.has_unfinished_request());

        session.step(T0 + 30.1, &launcher);
        assert_eq!(launcher.launched().len(), 2);
        assert!(session.has_unfinished_request());
    }

    #[test]
    fn test_waits_for_request_interval() {
        let launcher = ScriptedLauncher::new();
        let mut session = synthetic(5, 1, HistoryPolicy::Full);

        session.step(T0, &launcher);
        launcher.complete_next(canned_response("a", T0, 5, 0));

        session.step(T0 + 0.9, &launcher);
        session.step(T0 + 1.0, &launcher);
        assert_eq!(launcher.launched().len(), 1);

        session.step(T0 + 1.1, &launcher);
        assert_eq!(launcher.launched().len(), 2);
    }

    #[test]
    fn test_finishes_after_budget() {
        let launcher = ScriptedLauncher::new();
        let mut session = synthetic(3, 1, HistoryPolicy::Full);

        let mut now = T0;
        while !session.is_finished() && now < T0 + 10.0 {
            session.step(now, &launcher);
            while launcher.complete_next(canned_response("ok", now, 5, 0)) {}
            now += 0.1;
        }

        assert!(session.is_finished());
        assert_eq!(launcher.launched().len(), 3);
        let records = session.records();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.generation_tokens == 5));
        assert_eq!(
            records.iter().map(|r| r.question_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(session.history().len(), 6);
    }

    #[test]
    fn test_outgoing_messages_alternate_and_rotate_agents() {
        let launcher = ScriptedLauncher::new();
        let mut session = synthetic(4, 2, HistoryPolicy::Full);

        let mut now = T0;
        for _ in 0..4 {
            session.step(now, &launcher);
            let agent = launcher.launched().last().unwrap().agent_index;
            launcher.complete_next(canned_response("reply", now, 3, agent));
            now += 1.5;
        }

        let launched = launcher.launched();
        assert_eq!(
            launched.iter().map(|r| r.agent_index).collect::<Vec<_>>(),
            vec![0, 1, 0, 1]
        );
        for (round, request) in launched.iter().enumerate() {
            assert!(roles_alternate(&request.messages));
            assert_eq!(request.messages.len(), 2 * round + 1);
            assert_eq!(request.messages.last().unwrap().role, Role::User);
        }
        assert_eq!(launched[1].messages[1].name.as_deref(), Some("agent0"));
        assert_eq!(launched[1].messages[2].name.as_deref(), Some("user"));
        assert!(launched[1].messages[2].content.starts_with("Here's question #2"));
    }

    #[test]
    fn test_compacted_history_sends_last_answer_only() {
        let launcher = ScriptedLauncher::new();
        let mut session = synthetic(3, 1, HistoryPolicy::Compacted);

        let mut now = T0;
        for i in 0..3 {
            session.step(now, &launcher);
            launcher.complete_next(canned_response(&format!("answer {}", i), now, 3, 0));
            now += 1.5;
        }

        assert_eq!(session.history().len(), 1);
        let third = &launcher.launched()[2];
        assert_eq!(third.messages.len(), 2);
        assert_eq!(third.messages[0].content, "answer 1");
    }

    #[test]
    fn test_fast_forward_skips_elapsed_rounds() {
        let mut session = synthetic(10, 1, HistoryPolicy::Full);
        session.fast_forward(3.5, T0).unwrap();

        assert_eq!(session.question_id(), 4);
        assert!((session.last_request_time().unwrap() - (T0 - 0.5)).abs() < 1e-9);

        let launcher = ScriptedLauncher::new();
        session.step(T0, &launcher);
        assert!(launcher.launched().is_empty());
        session.step(T0 + 0.6, &launcher);
        let launched = launcher.launched();
        assert_eq!(launched.len(), 1);
        assert!(launched[0].messages[0]
            .content
            .contains("Here's question #5"));
    }

    #[test]
    fn test_fast_forward_after_launch_is_rejected() {
        let launcher = ScriptedLauncher::new();
        let mut session = synthetic(3, 1, HistoryPolicy::Full);
        session.step(T0, &launcher);

        let err = session.fast_forward(2.0, T0).unwrap_err();
        assert_eq!(
            err,
            SessionError::AlreadyStarted {
                user_id: 7,
                issued: 1
            }
        );
    }

    #[test]
    fn test_failed_request_rolls_back_query() {
        let launcher = ScriptedLauncher::new();
        let mut session = synthetic(3, 1, HistoryPolicy::Full);

        session.step(T0, &launcher);
        assert!(launcher.fail_next(ClientError::Status {
            status: 500,
            message: "boom".to_string()
        }));

        assert!(!session.has_unfinished_request());
        assert_eq!(session.failed_count(), 1);
        assert!(session.records().is_empty());
        assert!(session.history().is_empty());

        session.step(T0 + 1.5, &launcher);
        let second = &launcher.launched()[1];
        assert!(roles_alternate(&second.messages));
        assert_eq!(second.messages.len(), 1);
        assert!(second.messages[0].content.contains("question #2"));
    }

    #[test]
    fn test_rejected_launch_counts_as_failure() {
        let launcher = ScriptedLauncher::new();
        launcher.reject_launches();
        let mut session = synthetic(1, 1, HistoryPolicy::Full);

        session.step(T0, &launcher);
        assert!(!session.has_unfinished_request());
        assert_eq!(session.failed_count(), 1);

        session.step(T0 + 0.1, &launcher);
        assert!(session.is_finished());
    }

    #[test]
    fn test_agentic_trace_replays_rounds() {
        let trace = ConversationTrace {
            rounds: vec![
                vec![
                    RoundInput { input: "plan".into(), max_tokens: 10 },
                    RoundInput { input: "code".into(), max_tokens: 20 },
                ],
                vec![
                    RoundInput { input: "review".into(), max_tokens: 30 },
                    RoundInput { input: "fix".into(), max_tokens: 40 },
                ],
            ],
        };
        let launcher = ScriptedLauncher::new();
        let mut session = traced(WorkloadKind::Agentic, TraceRecord::Conversation(trace), 2);
        assert_eq!(session.config().round_budget(), 4);

        let mut now = T0;
        while !session.is_finished() && now < T0 + 20.0 {
            session.step(now, &launcher);
            while launcher.complete_next(canned_response("ok", now, 2, 0)) {}
            now += 0.5;
        }

        let launched = launcher.launched();
        let sent: Vec<(&str, u32, usize)> = launched
            .iter()
            .map(|r| {
                (
                    r.messages.last().unwrap().content.as_str(),
                    r.max_tokens,
                    r.agent_index,
                )
            })
            .collect();
        assert_eq!(
            sent,
            vec![("plan", 10, 0), ("code", 20, 1), ("review", 30, 0), ("fix", 40, 1)]
        );
        assert!(launched[0].headers.iter().any(|(k, _)| k == "x-user-id"));
    }

    #[test]
    fn test_arrival_prefill_only_requests_one_token() {
        let arrival = TraceRecord::Arrival(ArrivalRecord {
            timestamp_ms: 0,
            hash_ids: vec![9],
            output_length: 64,
        });
        let workload = WorkloadConfig {
            kind: WorkloadKind::Mooncake,
            prefill_only: true,
            send_user_id: false,
            ..Default::default()
        };
        let launcher = ScriptedLauncher::new();
        let mut session = UserSession::new(UserConfig::new(1, &workload, Some(Arc::new(arrival))));

        session.step(T0, &launcher);
        let launched = launcher.launched();
        assert_eq!(launched[0].max_tokens, 1);
        assert!(launched[0].headers.is_empty());
        assert!(launched[0].messages[0].content.starts_with("9hi"));

        launcher.complete_next(canned_response("x", T0, 1, 0));
        session.step(T0 + 0.1, &launcher);
        assert!(session.is_finished());
    }

    #[test]
    fn test_prompt_replay_prefixes_rate() {
        let prompt = TraceRecord::Prompt(PromptRecord {
            input: "Summarize this".to_string(),
            output_length: 12,
        });
        let launcher = ScriptedLauncher::new();
        let mut session = traced(WorkloadKind::ShareGpt, prompt, 1);

        session.step(T0, &launcher);
        let launched = launcher.launched();
        assert_eq!(launched[0].messages[0].content, "2 Summarize this");
        assert_eq!(launched[0].max_tokens, 12);
    }

    #[test]
    fn test_take_records_drains() {
        let launcher = ScriptedLauncher::new();
        let mut session = synthetic(1, 1, HistoryPolicy::Full);
        session.step(T0, &launcher);
        launcher.complete_next(canned_response("done", T0, 4, 0));

        let records = session.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].output, "done");
        assert!(records[0].input.contains("question #1"));
        assert!(session.records().is_empty());
    }
}
