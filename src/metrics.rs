//! Per-request records and windowed aggregation.

use hdrhistogram::Histogram;
use serde::Serialize;
use tracing::info;

use crate::error::MetricsError;

/// Upper bound of the TTFT histogram: ten minutes in microseconds
const MAX_TTFT_MICROS: u64 = 600_000_000;

/// One completed request, as exported to the results file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRecord {
    pub prompt_tokens: u64,
    pub generation_tokens: u64,
    pub ttft: f64,
    pub generation_time: f64,
    pub user_id: u64,
    pub question_id: usize,
    pub launch_time: f64,
    pub finish_time: f64,
    pub agent_id: usize,
    /// JSON rendering of the message list that was sent
    pub input: String,
    pub output: String,
}

impl RequestRecord {
    /// Time per output token after the first; undefined for one token or fewer.
    pub fn tpot(&self) -> Option<f64> {
        (self.generation_tokens > 1)
            .then(|| self.generation_time / (self.generation_tokens - 1) as f64)
    }

    /// Generation time spread over every generated token; undefined for zero tokens.
    pub fn itl(&self) -> Option<f64> {
        (self.generation_tokens > 0).then(|| self.generation_time / self.generation_tokens as f64)
    }

    /// Tokens per second of this request's generation phase.
    pub fn generation_throughput(&self) -> Option<f64> {
        let rate = self.generation_tokens as f64 / self.generation_time;
        rate.is_finite().then_some(rate)
    }
}

/// Aggregate statistics over one time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub window_start: f64,
    pub window_end: f64,
    pub duration: f64,

    /// Requests launched inside the window
    pub launched: usize,
    /// Requests finished inside the window
    pub finished: usize,
    /// Requests still in flight at the end of the window
    pub pending: usize,
    /// Requests that ended in an error
    pub failed: usize,

    /// (launched + pending) / duration
    pub offered_qps: f64,
    /// finished / duration
    pub throughput: f64,
    /// prompt tokens per second
    pub prefill_rate: f64,
    /// generated tokens per second
    pub generation_rate: f64,
    pub mean_generation_throughput: Option<f64>,

    pub mean_ttft: f64,
    pub p50_ttft: f64,
    pub p99_ttft: f64,
    pub mean_tpot: Option<f64>,
    pub mean_itl: Option<f64>,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            window_start = self.window_start,
            window_end = self.window_end,
            duration_secs = %format!("{:.2}", self.duration),
            launched = self.launched,
            finished = self.finished,
            pending = self.pending,
            failed = self.failed,
            "📊 Performance summary"
        );
        info!(
            throughput = %format!("{:.4} reqs/s", self.throughput),
            offered_qps = %format!("{:.4} reqs/s", self.offered_qps),
            prefill_rate = %format!("{:.4} tokens/s", self.prefill_rate),
            generation_rate = %format!("{:.4} tokens/s", self.generation_rate),
            per_request_generation = %format_optional(self.mean_generation_throughput, "tokens/req/s"),
            "Throughput"
        );
        info!(
            mean_ttft = %format!("{:.4}s", self.mean_ttft),
            p50_ttft = %format!("{:.4}s", self.p50_ttft),
            p99_ttft = %format!("{:.4}s", self.p99_ttft),
            mean_tpot = %format_optional(self.mean_tpot, "s"),
            mean_itl = %format_optional(self.mean_itl, "s"),
            "Latency"
        );
    }
}

fn format_optional(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.4}{}", v, unit),
        None => "n/a".to_string(),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Reduce records to a summary over `[window_start, window_end]`.
///
/// The window end is clamped to the last finish time on record. Latency
/// statistics use only requests that finished in the window; `pending`
/// counts toward the offered rate but has no latency.
pub fn summarize(
    records: &[RequestRecord],
    window_start: f64,
    window_end: f64,
    pending: usize,
    failed: usize,
) -> Result<MetricsSummary, MetricsError> {
    let last_finish = records
        .iter()
        .map(|r| r.finish_time)
        .fold(f64::NEG_INFINITY, f64::max);
    if !last_finish.is_finite() {
        return Err(MetricsError::NoData("no requests recorded".to_string()));
    }

    let window_end = window_end.min(last_finish);
    let duration = window_end - window_start;
    if duration <= 0.0 {
        return Err(MetricsError::NoData(format!(
            "empty window [{:.3}, {:.3}]",
            window_start, window_end
        )));
    }

    let in_window = |t: f64| window_start <= t && t <= window_end;
    let launched = records.iter().filter(|r| in_window(r.launch_time)).count();
    let finished: Vec<&RequestRecord> = records.iter().filter(|r| in_window(r.finish_time)).collect();
    if finished.is_empty() {
        return Err(MetricsError::NoData(
            "no requests finished in the window".to_string(),
        ));
    }

    let mut ttft_histogram = Histogram::<u64>::new_with_bounds(1, MAX_TTFT_MICROS, 3)
        .map_err(|e| MetricsError::Histogram(e.to_string()))?;
    for record in &finished {
        let micros = (record.ttft.max(0.0) * 1_000_000.0).round() as u64;
        ttft_histogram.saturating_record(micros.max(1));
    }

    let prompt_tokens: u64 = finished.iter().map(|r| r.prompt_tokens).sum();
    let generation_tokens: u64 = finished.iter().map(|r| r.generation_tokens).sum();

    Ok(MetricsSummary {
        window_start,
        window_end,
        duration,
        launched,
        finished: finished.len(),
        pending,
        failed,
        offered_qps: (launched + pending) as f64 / duration,
        throughput: finished.len() as f64 / duration,
        prefill_rate: prompt_tokens as f64 / duration,
        generation_rate: generation_tokens as f64 / duration,
        mean_generation_throughput: mean(
            finished.iter().filter_map(|r| r.generation_throughput()),
        ),
        mean_ttft: mean(finished.iter().map(|r| r.ttft)).unwrap_or(0.0),
        p50_ttft: ttft_histogram.value_at_quantile(0.5) as f64 / 1_000_000.0,
        p99_ttft: ttft_histogram.value_at_quantile(0.99) as f64 / 1_000_000.0,
        mean_tpot: mean(finished.iter().filter_map(|r| r.tpot())),
        mean_itl: mean(finished.iter().filter_map(|r| r.itl())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(launch: f64, ttft: f64, generation_time: f64, generation_tokens: u64) -> RequestRecord {
        RequestRecord {
            prompt_tokens: 100,
            generation_tokens,
            ttft,
            generation_time,
            user_id: 1,
            question_id: 1,
            launch_time: launch,
            finish_time: launch + ttft + generation_time,
            agent_id: 0,
            input: "[]".to_string(),
            output: String::new(),
        }
    }

    #[test]
    fn test_empty_records_report_no_data() {
        let err = summarize(&[], 0.0, 10.0, 0, 0).unwrap_err();
        assert!(matches!(err, MetricsError::NoData(_)));
    }

    #[test]
    fn test_zero_duration_reports_no_data() {
        let records = vec![record(10.0, 0.5, 1.0, 5)];
        let err = summarize(&records, 20.0, 30.0, 0, 0).unwrap_err();
        assert!(matches!(err, MetricsError::NoData(_)));
    }

    #[test]
    fn test_nothing_finished_in_window_reports_no_data() {
        let records = vec![record(0.0, 0.5, 1.0, 5), record(50.0, 0.5, 1.0, 5)];
        let err = summarize(&records, 10.0, 40.0, 1, 0).unwrap_err();
        assert!(matches!(err, MetricsError::NoData(_)));
    }

    #[test]
    fn test_rates_over_window() {
        // finishes at 1.5, 3.5 and 5.5
        let records = vec![
            record(0.0, 0.5, 1.0, 5),
            record(2.0, 0.5, 1.0, 5),
            record(4.0, 0.5, 1.0, 5),
        ];
        let summary = summarize(&records, 0.0, 100.0, 2, 1).unwrap();

        assert_eq!(summary.window_end, 5.5);
        assert!((summary.duration - 5.5).abs() < 1e-9);
        assert_eq!(summary.finished, 3);
        assert_eq!(summary.launched, 3);
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.failed, 1);
        assert!((summary.throughput - 3.0 / 5.5).abs() < 1e-9);
        assert!((summary.offered_qps - 5.0 / 5.5).abs() < 1e-9);
        assert!((summary.prefill_rate - 300.0 / 5.5).abs() < 1e-9);
        assert!((summary.generation_rate - 15.0 / 5.5).abs() < 1e-9);
        assert!((summary.mean_ttft - 0.5).abs() < 1e-9);
        assert!((summary.p50_ttft - 0.5).abs() < 0.001);
        assert!((summary.p99_ttft - 0.5).abs() < 0.001);
        assert!((summary.mean_tpot.unwrap() - 0.25).abs() < 1e-9);
        assert!((summary.mean_itl.unwrap() - 0.2).abs() < 1e-9);
        assert!((summary.mean_generation_throughput.unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_tpot_and_itl_undefined_for_short_outputs() {
        let one = record(0.0, 0.1, 0.0, 1);
        assert_eq!(one.tpot(), None);
        assert_eq!(one.itl(), Some(0.0));
        assert_eq!(one.generation_throughput(), None);

        let none = record(0.0, 0.0, 0.0, 0);
        assert_eq!(none.tpot(), None);
        assert_eq!(none.itl(), None);

        let summary = summarize(&[one, none], 0.0, 1.0, 0, 0).unwrap();
        assert_eq!(summary.mean_tpot, None);
        assert_eq!(summary.mean_itl, Some(0.0));
        assert_eq!(summary.mean_generation_throughput, None);
    }

    #[test]
    fn test_percentiles_track_slow_tail() {
        let mut records: Vec<RequestRecord> =
            (0..199).map(|i| record(i as f64, 0.1, 0.5, 10)).collect();
        records.push(record(199.0, 5.0, 0.5, 10));

        let summary = summarize(&records, 0.0, 300.0, 0, 0).unwrap();
        assert!((summary.p50_ttft - 0.1).abs() < 0.001);
        assert!(summary.p99_ttft < 0.2);
        assert!(summary.mean_ttft > 0.1);
    }

    #[test]
    fn test_summary_is_repeatable() {
        let records = vec![record(0.0, 0.2, 1.0, 4), record(1.0, 0.3, 2.0, 8)];
        let first = summarize(&records, 0.0, 10.0, 1, 0).unwrap();
        let second = summarize(&records, 0.0, 10.0, 1, 0).unwrap();
        assert_eq!(first, second);
    }
}
