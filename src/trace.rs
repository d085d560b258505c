//! Replay traces.
//!
//! Every trace file is newline-delimited JSON. The record shape depends on
//! the workload kind and is validated when the file is loaded, so the
//! stepping loop only ever sees well-formed records.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

use crate::config::WorkloadKind;
use crate::error::TraceError;

/// Input and token budget of one agent turn in a replayed conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundInput {
    pub input: String,
    pub max_tokens: u32,
}

/// Recorded multi-round conversation; `rounds[r][a]` is agent `a`'s turn in round `r`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTrace {
    pub rounds: Vec<Vec<RoundInput>>,
}

impl ConversationTrace {
    pub fn turn(&self, round: usize, agent: usize) -> Option<&RoundInput> {
        self.rounds.get(round).and_then(|r| r.get(agent))
    }

    pub fn turn_count(&self) -> usize {
        self.rounds.iter().map(Vec::len).sum()
    }
}

/// Scheduled single-request arrival.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArrivalRecord {
    /// Offset from the simulation start in milliseconds
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    pub hash_ids: Vec<u64>,
    pub output_length: u32,
}

impl ArrivalRecord {
    /// Admission offset in seconds, stretched by the slowdown factor.
    pub fn offset_secs(&self, slowdown_factor: f64) -> f64 {
        self.timestamp_ms as f64 / 1000.0 * slowdown_factor
    }

    /// Prompt built from the block hashes so requests sharing a prefix share text.
    pub fn prompt(&self) -> String {
        let filler = vec!["hi"; 512].join(" ");
        let mut prompt = String::new();
        for hash_id in &self.hash_ids {
            prompt.push_str(&hash_id.to_string());
            prompt.push_str(&filler);
        }
        prompt.push_str("Can you tell me a detailed story in 1000 words?");
        prompt
    }
}

fn default_output_length() -> u32 {
    1
}

/// Single prompt replayed at a fixed rate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PromptRecord {
    pub input: String,
    #[serde(default = "default_output_length")]
    pub output_length: u32,
}

/// One trace line, tagged by the workload kind it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRecord {
    Conversation(ConversationTrace),
    Arrival(ArrivalRecord),
    Prompt(PromptRecord),
}

impl TraceRecord {
    /// Number of requests a session driven by this record will issue.
    pub fn request_budget(&self) -> usize {
        match self {
            TraceRecord::Conversation(trace) => trace.turn_count(),
            TraceRecord::Arrival(_) | TraceRecord::Prompt(_) => 1,
        }
    }
}

/// Parse one trace line for the given workload kind.
pub fn parse_record(
    kind: WorkloadKind,
    line: &str,
    num_agents: usize,
) -> Result<TraceRecord, TraceError> {
    match kind {
        WorkloadKind::Agentic => {
            let value: Map<String, Value> = serde_json::from_str(line)
                .map_err(|e| TraceError::Malformed(format!("invalid JSON object: {}", e)))?;
            parse_conversation(&value, num_agents).map(TraceRecord::Conversation)
        }
        WorkloadKind::Mooncake => serde_json::from_str(line)
            .map(TraceRecord::Arrival)
            .map_err(|e| TraceError::Malformed(e.to_string())),
        WorkloadKind::ShareGpt => serde_json::from_str(line)
            .map(TraceRecord::Prompt)
            .map_err(|e| TraceError::Malformed(e.to_string())),
        WorkloadKind::Synthetic => Err(TraceError::Malformed(
            "synthetic workloads do not take trace records".to_string(),
        )),
    }
}

/// Parse `{"round1": {"0_input": .., "0_max_tokens": ..}, "round2": ..}`.
fn parse_conversation(
    value: &Map<String, Value>,
    num_agents: usize,
) -> Result<ConversationTrace, TraceError> {
    let mut rounds = Vec::new();

    while let Some(round) = value.get(&format!("round{}", rounds.len() + 1)) {
        let round_index = rounds.len() + 1;
        let round = round.as_object().ok_or_else(|| {
            TraceError::Malformed(format!("round{} is not an object", round_index))
        })?;

        let mut turns = Vec::with_capacity(num_agents);
        for agent in 0..num_agents {
            let input = round
                .get(&format!("{}_input", agent))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    TraceError::Malformed(format!(
                        "round{} missing string field {}_input",
                        round_index, agent
                    ))
                })?;
            let max_tokens = round
                .get(&format!("{}_max_tokens", agent))
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    TraceError::Malformed(format!(
                        "round{} missing integer field {}_max_tokens",
                        round_index, agent
                    ))
                })?;
            turns.push(RoundInput {
                input: input.to_string(),
                max_tokens,
            });
        }
        rounds.push(turns);
    }

    if rounds.is_empty() {
        return Err(TraceError::Malformed("no round1 entry".to_string()));
    }
    Ok(ConversationTrace { rounds })
}

/// Load a trace file, skipping blank and malformed lines with a warning.
///
/// Arrival records are ordered by timestamp so admission can walk them in order.
pub fn load_trace(
    path: &Path,
    kind: WorkloadKind,
    num_agents: usize,
) -> Result<Vec<TraceRecord>, TraceError> {
    let file = std::fs::File::open(path).map_err(|source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_record(kind, line, num_agents) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                warn!(line = index + 1, error = %e, "Skipping invalid trace record");
            }
        }
    }

    if records.is_empty() {
        return Err(TraceError::Empty(path.to_path_buf()));
    }

    if kind == WorkloadKind::Mooncake {
        records.sort_by_key(|record| match record {
            TraceRecord::Arrival(arrival) => arrival.timestamp_ms,
            _ => 0,
        });
    }

    info!(
        path = %path.display(),
        records = records.len(),
        skipped,
        "Loaded trace"
    );
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_trace(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[test]
    fn test_parse_conversation_record() {
        let line = r#"{"round1": {"0_input": "plan", "0_max_tokens": 32, "1_input": "code", "1_max_tokens": 64},
                       "round2": {"0_input": "review", "0_max_tokens": 16, "1_input": "fix", "1_max_tokens": 8}}"#
            .replace('\n', " ");
        let record = parse_record(WorkloadKind::Agentic, &line, 2).unwrap();

        let TraceRecord::Conversation(trace) = &record else {
            panic!("expected conversation record");
        };
        assert_eq!(trace.rounds.len(), 2);
        assert_eq!(trace.turn(0, 1).unwrap().input, "code");
        assert_eq!(trace.turn(1, 0).unwrap().max_tokens, 16);
        assert_eq!(record.request_budget(), 4);
    }

    #[test]
    fn test_conversation_missing_agent_field_is_malformed() {
        let line = r#"{"round1": {"0_input": "plan", "0_max_tokens": 32}}"#;
        let err = parse_record(WorkloadKind::Agentic, line, 2).unwrap_err();
        assert!(err.to_string().contains("1_input"));
    }

    #[test]
    fn test_conversation_without_rounds_is_malformed() {
        let err = parse_record(WorkloadKind::Agentic, r#"{"other": 1}"#, 1).unwrap_err();
        assert!(matches!(err, TraceError::Malformed(_)));
    }

    #[test]
    fn test_parse_arrival_record() {
        let record = parse_record(
            WorkloadKind::Mooncake,
            r#"{"timestamp": 2500, "hash_ids": [1, 2], "output_length": 40}"#,
            1,
        )
        .unwrap();

        let TraceRecord::Arrival(arrival) = record else {
            panic!("expected arrival record");
        };
        assert_eq!(arrival.offset_secs(1.0), 2.5);
        assert_eq!(arrival.offset_secs(2.0), 5.0);
        let prompt = arrival.prompt();
        assert!(prompt.starts_with("1hi hi"));
        assert!(prompt.contains("hi2hi"));
        assert!(prompt.ends_with("Can you tell me a detailed story in 1000 words?"));
    }

    #[test]
    fn test_arrival_missing_field_is_malformed() {
        let err = parse_record(WorkloadKind::Mooncake, r#"{"timestamp": 0}"#, 1).unwrap_err();
        assert!(matches!(err, TraceError::Malformed(_)));
    }

    #[test]
    fn test_prompt_record_defaults_output_length() {
        let record = parse_record(WorkloadKind::ShareGpt, r#"{"input": "hello"}"#, 1).unwrap();
        assert_eq!(
            record,
            TraceRecord::Prompt(PromptRecord {
                input: "hello".to_string(),
                output_length: 1
            })
        );
    }

    #[test]
    fn test_load_trace_skips_malformed_lines() {
        let file = write_trace(&[
            r#"{"timestamp": 2000, "hash_ids": [7], "output_length": 5}"#,
            "not json",
            "",
            r#"{"timestamp": 0, "hash_ids": [3], "output_length": 5}"#,
            r#"{"hash_ids": [3]}"#,
        ]);

        let records = load_trace(file.path(), WorkloadKind::Mooncake, 1).unwrap();
        assert_eq!(records.len(), 2);
        match &records[0] {
            TraceRecord::Arrival(first) => assert_eq!(first.timestamp_ms, 0),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_load_trace_all_malformed_is_error() {
        let file = write_trace(&["{", "[]"]);
        let err = load_trace(file.path(), WorkloadKind::ShareGpt, 1).unwrap_err();
        assert!(matches!(err, TraceError::Empty(_)));
    }

    #[test]
    fn test_load_trace_missing_file() {
        let err = load_trace(
            Path::new("/nonexistent/trace.jsonl"),
            WorkloadKind::Agentic,
            1,
        )
        .unwrap_err();
        assert!(matches!(err, TraceError::Io { .. }));
    }
}
