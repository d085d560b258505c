//! Result export.

use std::path::Path;
use tracing::info;

use crate::error::ExportError;
use crate::metrics::RequestRecord;

/// Column order of the results file.
pub const COLUMNS: [&str; 11] = [
    "prompt_tokens",
    "generation_tokens",
    "ttft",
    "generation_time",
    "user_id",
    "question_id",
    "launch_time",
    "finish_time",
    "agent_id",
    "input",
    "output",
];

/// Write one row per completed request, ordered by launch time.
///
/// Returns the number of rows written.
pub fn write_csv(path: &Path, records: &[RequestRecord]) -> Result<usize, ExportError> {
    let csv_error = |source| ExportError::Csv {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let mut sorted: Vec<&RequestRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.launch_time.total_cmp(&b.launch_time));

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(csv_error)?;
    writer.write_record(COLUMNS).map_err(csv_error)?;
    for record in &sorted {
        writer.serialize(record).map_err(csv_error)?;
    }
    writer.flush().map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!(path = %path.display(), rows = sorted.len(), "💾 Results written");
    Ok(sorted.len())
}
