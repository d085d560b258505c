// Small shared helpers

use std::path::PathBuf;

/// Wall-clock time as fractional seconds since the Unix epoch.
///
/// All timestamps in results and in the stepping loop use this clock.
pub fn unix_now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() as f64 / 1_000_000.0
}

/// Expand tilde (~) in file paths to user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
