use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::conversation::HistoryPolicy;
use crate::error::ConfigError;
use crate::trace::TraceRecord;
use crate::utils::expand_tilde;

/// Model used when the run targets the bundled mock endpoint.
pub const STANDALONE_MODEL: &str = "mock-model";

/// Which request source drives the sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WorkloadKind {
    /// Generated multi-round conversations
    #[default]
    Synthetic,
    /// Replayed multi-agent conversations from a trace
    Agentic,
    /// Timestamped single requests from an arrival trace
    Mooncake,
    /// Single prompts replayed at a fixed rate
    #[value(name = "sharegpt")]
    ShareGpt,
}

impl WorkloadKind {
    pub fn uses_trace(self) -> bool {
        self != WorkloadKind::Synthetic
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadKind::Synthetic => write!(f, "synthetic"),
            WorkloadKind::Agentic => write!(f, "agentic"),
            WorkloadKind::Mooncake => write!(f, "mooncake"),
            WorkloadKind::ShareGpt => write!(f, "sharegpt"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Chat workload generator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the chat-completion endpoint
    #[arg(long, env = "LOADGEN_BASE_URL", default_value = "http://localhost:8000")]
    pub base_url: String,

    /// Model per agent slot (repeat or comma-separate; one value is shared by all agents)
    #[arg(long = "model", env = "LOADGEN_MODEL", value_delimiter = ',')]
    pub models: Vec<String>,

    /// Number of agent slots per conversation
    #[arg(long, env = "LOADGEN_NUM_AGENTS", default_value = "1")]
    pub num_agents: usize,

    /// Request source
    #[arg(long, value_enum, env = "LOADGEN_WORKLOAD", default_value_t = WorkloadKind::Synthetic)]
    pub workload: WorkloadKind,

    /// How assistant turns are kept in the history
    #[arg(long, value_enum, env = "LOADGEN_HISTORY", default_value_t = HistoryPolicy::Full)]
    pub history: HistoryPolicy,

    /// Shared system prompt length, in filler tokens
    #[arg(long)]
    pub system_prompt_len: Option<usize>,

    /// Per-user context length, in filler tokens
    #[arg(long)]
    pub user_info_len: Option<usize>,

    /// Target answer length in tokens
    #[arg(long)]
    pub answer_len: Option<u32>,

    /// Requests per session
    #[arg(long)]
    pub num_rounds: Option<usize>,

    /// Seconds between a session's requests
    #[arg(long, env = "LOADGEN_REQUEST_INTERVAL", default_value = "1.0")]
    pub request_interval: f64,

    /// Seconds between session admissions
    #[arg(long, env = "LOADGEN_ARRIVAL_INTERVAL", default_value = "1.0")]
    pub arrival_interval: f64,

    /// Requests per second for the sharegpt workload
    #[arg(long)]
    pub qps: Option<f64>,

    /// Multiplier applied to arrival-trace timestamps
    #[arg(long, default_value = "1.0")]
    pub slowdown_factor: f64,

    /// Ask for a single output token on arrival-trace requests
    #[arg(long)]
    pub prefill_only: bool,

    /// Send the x-user-id header on arrival-trace and sharegpt requests
    #[arg(long)]
    pub user_id_header: bool,

    /// Newline-delimited JSON trace to replay
    #[arg(long, env = "LOADGEN_TRACE_FILE")]
    pub trace_file: Option<String>,

    /// Stop admitting and drain after this many seconds
    #[arg(long)]
    pub time: Option<f64>,

    /// Tick length of the stepping loop in milliseconds
    #[arg(long, env = "LOADGEN_TICK_MS", default_value = "100")]
    pub tick_ms: u64,

    /// Seconds between periodic summaries
    #[arg(long, default_value = "30")]
    pub log_interval: f64,

    /// Result CSV path
    #[arg(short, long, env = "LOADGEN_OUTPUT", default_value = "summary.csv")]
    pub output: String,

    /// Throwaway requests issued before the run starts
    #[arg(long, default_value = "0")]
    pub warmup_requests: usize,

    /// Sessions admitted at start as though they joined earlier
    #[arg(long, default_value = "0")]
    pub ramp_up_users: usize,

    /// Bearer token for the endpoint
    #[arg(short = 'k', long, env = "OPENAI_API_KEY")]
    pub api_key: Option<String>,

    /// Per-request timeout in seconds (unset leaves it to the endpoint)
    #[arg(long, env = "LOADGEN_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    /// Run against the bundled mock endpoint
    #[arg(long)]
    pub standalone: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, env = "LOG_FORMAT", default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl CliArgs {
    /// Parse arguments with priority: CLI > ENV (including `.env`) > defaults
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::parse()
    }
}

/// Immutable run configuration, shared by every component.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub kind: WorkloadKind,
    pub history: HistoryPolicy,

    // Endpoint
    pub base_url: String,
    pub models: Vec<String>,
    pub api_key: Option<String>,
    pub request_timeout: Option<Duration>,
    pub standalone: bool,

    // Conversation shape
    pub num_agents: usize,
    pub system_prompt_len: usize,
    pub user_info_len: usize,
    pub answer_len: u32,
    pub num_rounds: usize,

    // Pacing
    pub request_gap: f64,
    pub arrival_interval: f64,
    pub slowdown_factor: f64,
    pub qps: Option<f64>,
    pub prefill_only: bool,
    pub send_user_id: bool,

    // Run control
    pub trace_file: Option<PathBuf>,
    pub run_time: Option<f64>,
    pub tick: Duration,
    pub log_interval: f64,
    pub output: PathBuf,
    pub warmup_requests: usize,
    pub ramp_up_users: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            kind: WorkloadKind::Synthetic,
            history: HistoryPolicy::Full,
            base_url: "http://localhost:8000".to_string(),
            models: vec![STANDALONE_MODEL.to_string()],
            api_key: None,
            request_timeout: None,
            standalone: false,
            num_agents: 1,
            system_prompt_len: 0,
            user_info_len: 0,
            answer_len: 16,
            num_rounds: 1,
            request_gap: 1.0,
            arrival_interval: 1.0,
            slowdown_factor: 1.0,
            qps: None,
            prefill_only: false,
            send_user_id: true,
            trace_file: None,
            run_time: None,
            tick: Duration::from_millis(100),
            log_interval: 30.0,
            output: PathBuf::from("summary.csv"),
            warmup_requests: 0,
            ramp_up_users: 0,
        }
    }
}

impl WorkloadConfig {
    /// Validate parsed arguments into a run configuration.
    ///
    /// Every contradiction is reported here, before any session exists.
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let kind = args.workload;

        let trace_file = match (&args.trace_file, kind.uses_trace()) {
            (Some(_), false) => {
                return Err(ConfigError::Invalid {
                    flag: "--trace-file".to_string(),
                    reason: "the synthetic workload generates its own prompts".to_string(),
                })
            }
            (None, true) => {
                return Err(ConfigError::Missing {
                    workload: kind.to_string(),
                    missing: "--trace-file".to_string(),
                })
            }
            (path, _) => path.as_deref().map(expand_tilde),
        };

        let manual = [
            ("--system-prompt-len", args.system_prompt_len.is_some()),
            ("--user-info-len", args.user_info_len.is_some()),
            ("--answer-len", args.answer_len.is_some()),
            ("--num-rounds", args.num_rounds.is_some()),
        ];
        if kind.uses_trace() {
            let passed: Vec<&str> = manual
                .iter()
                .filter(|(_, given)| *given)
                .map(|(flag, _)| *flag)
                .collect();
            if !passed.is_empty() {
                return Err(ConfigError::TraceConflict(passed.join(", ")));
            }
        } else {
            let missing: Vec<&str> = manual
                .iter()
                .filter(|(_, given)| !*given)
                .map(|(flag, _)| *flag)
                .collect();
            if !missing.is_empty() {
                return Err(ConfigError::Missing {
                    workload: kind.to_string(),
                    missing: missing.join(", "),
                });
            }
        }

        if args.num_agents == 0 {
            return Err(invalid("--num-agents", "must be at least 1"));
        }
        let models = resolve_models(&args.models, args.num_agents, args.standalone, kind)?;

        let arrival_interval = match (kind, args.qps) {
            (WorkloadKind::ShareGpt, Some(qps)) if qps > 0.0 => 1.0 / qps,
            (WorkloadKind::ShareGpt, Some(_)) => return Err(invalid("--qps", "must be positive")),
            (WorkloadKind::ShareGpt, None) => {
                return Err(ConfigError::Missing {
                    workload: kind.to_string(),
                    missing: "--qps".to_string(),
                })
            }
            (_, Some(_)) => {
                return Err(invalid("--qps", "only applies to the sharegpt workload"))
            }
            (_, None) => args.arrival_interval,
        };

        ensure_positive("--request-interval", args.request_interval)?;
        ensure_positive("--arrival-interval", arrival_interval)?;
        ensure_positive("--slowdown-factor", args.slowdown_factor)?;
        ensure_positive("--log-interval", args.log_interval)?;
        if let Some(time) = args.time {
            ensure_positive("--time", time)?;
        }
        if args.tick_ms == 0 {
            return Err(invalid("--tick-ms", "must be positive"));
        }
        if args.ramp_up_users > 0 && kind != WorkloadKind::Synthetic {
            return Err(invalid(
                "--ramp-up-users",
                "only applies to the synthetic workload",
            ));
        }

        let send_user_id = match kind {
            WorkloadKind::Synthetic | WorkloadKind::Agentic => true,
            WorkloadKind::Mooncake | WorkloadKind::ShareGpt => args.user_id_header,
        };

        Ok(Self {
            kind,
            history: args.history,
            base_url: args.base_url.clone(),
            models,
            api_key: args.api_key.clone(),
            request_timeout: args.timeout_secs.map(Duration::from_secs),
            standalone: args.standalone,
            num_agents: args.num_agents,
            system_prompt_len: args.system_prompt_len.unwrap_or(0),
            user_info_len: args.user_info_len.unwrap_or(0),
            answer_len: args.answer_len.unwrap_or(0),
            num_rounds: args.num_rounds.unwrap_or(0),
            request_gap: args.request_interval,
            arrival_interval,
            slowdown_factor: args.slowdown_factor,
            qps: args.qps,
            prefill_only: args.prefill_only,
            send_user_id,
            trace_file,
            run_time: args.time,
            tick: Duration::from_millis(args.tick_ms),
            log_interval: args.log_interval,
            output: expand_tilde(&args.output),
            warmup_requests: args.warmup_requests,
            ramp_up_users: args.ramp_up_users,
        })
    }
}

fn invalid(flag: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        flag: flag.to_string(),
        reason: reason.to_string(),
    }
}

fn ensure_positive(flag: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(invalid(flag, "must be a positive number"))
    }
}

/// One model per agent slot; a single model is shared by all slots.
fn resolve_models(
    models: &[String],
    num_agents: usize,
    standalone: bool,
    kind: WorkloadKind,
) -> Result<Vec<String>, ConfigError> {
    match models.len() {
        0 if standalone => Ok(vec![STANDALONE_MODEL.to_string(); num_agents]),
        0 => Err(ConfigError::Missing {
            workload: kind.to_string(),
            missing: "--model".to_string(),
        }),
        1 => Ok(vec![models[0].clone(); num_agents]),
        n if n == num_agents => Ok(models.to_vec()),
        n => Err(ConfigError::Invalid {
            flag: "--model".to_string(),
            reason: format!("got {} models for {} agent slots", n, num_agents),
        }),
    }
}

/// Per-session snapshot taken at admission.
#[derive(Debug, Clone)]
pub struct UserConfig {
    pub user_id: u64,
    pub kind: WorkloadKind,
    pub history: HistoryPolicy,
    pub models: Vec<String>,
    pub num_agents: usize,
    pub system_prompt_len: usize,
    pub user_info_len: usize,
    pub answer_len: u32,
    pub num_rounds: usize,
    pub request_gap: f64,
    pub prefill_only: bool,
    pub qps: Option<f64>,
    pub send_user_id: bool,
    pub trace: Option<Arc<TraceRecord>>,
}

impl UserConfig {
    pub fn new(user_id: u64, workload: &WorkloadConfig, trace: Option<Arc<TraceRecord>>) -> Self {
        Self {
            user_id,
            kind: workload.kind,
            history: workload.history,
            models: workload.models.clone(),
            num_agents: workload.num_agents,
            system_prompt_len: workload.system_prompt_len,
            user_info_len: workload.user_info_len,
            answer_len: workload.answer_len,
            num_rounds: workload.num_rounds,
            request_gap: workload.request_gap,
            prefill_only: workload.prefill_only,
            qps: workload.qps,
            send_user_id: workload.send_user_id,
            trace,
        }
    }

    /// Model behind an agent slot, for log context.
    pub fn model_for(&self, agent_index: usize) -> &str {
        self.models
            .get(agent_index)
            .map(String::as_str)
            .unwrap_or("unknown")
    }

    /// Number of requests this session issues before finishing.
    pub fn round_budget(&self) -> usize {
        match &self.trace {
            Some(record) => record.request_budget(),
            None => self.num_rounds,
        }
    }
}
