//! Per-line progress extraction from the backup tool's output.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;

use crate::jobs::model::JobProgress;

/// File status line from `--list`: one marker character, whitespace, a path.
/// A = added, M = modified, U = unchanged, D = deleted.
static FILE_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[AMUD]\s+(\S.*)$").unwrap());

/// What a single output line turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    /// Free-form text; progress untouched.
    Plain,
    /// A file status line; progress was advanced.
    File,
    /// The tool's single-shot JSON statistics (first element of the array).
    InlineStats(serde_json::Value),
}

/// Recognizes structured fragments in the output stream.
///
/// Implementations must be stateless: everything they learn goes into the
/// `JobProgress` they are handed or into the returned event.
pub trait ProgressExtractor: Send + Sync {
    fn extract(&self, line: &str, progress: &mut JobProgress) -> LineEvent;
}

/// Extractor for borg/borgmatic `--list` and `--json` output.
#[derive(Debug, Default, Clone, Copy)]
pub struct BorgProgressExtractor;

impl ProgressExtractor for BorgProgressExtractor {
    fn extract(&self, line: &str, progress: &mut JobProgress) -> LineEvent {
        if let Some(caps) = FILE_LINE.captures(line) {
            progress.files_processed += 1;
            progress.current_file = Some(caps[1].to_string());
            progress.last_update = Some(Utc::now());
            return LineEvent::File;
        }

        if line.starts_with("[{") {
            return match parse_inline_stats(line) {
                Some(value) => LineEvent::InlineStats(value),
                None => LineEvent::Plain,
            };
        }

        LineEvent::Plain
    }
}

/// Parse a `[{...}]` line; anything else (including bad JSON) is `None`.
fn parse_inline_stats(line: &str) -> Option<serde_json::Value> {
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(serde_json::Value::Array(mut items)) if !items.is_empty() && items[0].is_object() => {
            Some(items.swap_remove(0))
        }
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("Ignoring JSON-looking output line: {e}");
            None
        }
    }
}
