//! Decoding of restic's `--json` progress protocol.
//!
//! Restic prints one JSON object per line with a `message_type` of `status`, `summary` or
//! `error`. Anything that doesn't decode is passed through as plain log text.

use crate::restic::command::LineHandler;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackupStatus {
    pub percent_done: f64,
    pub total_files: u64,
    pub files_done: u64,
    pub total_bytes: u64,
    pub bytes_done: u64,
    pub current_files: Vec<String>,
    pub error_count: u64,
    pub seconds_remaining: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSummary {
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub dirs_new: u64,
    pub dirs_changed: u64,
    pub dirs_unmodified: u64,
    pub data_blobs: u64,
    pub tree_blobs: u64,
    pub data_added: u64,
    pub total_files_processed: u64,
    pub total_bytes_processed: u64,
    pub total_duration: f64,
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ErrorDetail {
    #[serde(alias = "Op")]
    pub op: String,
    #[serde(alias = "Path")]
    pub path: String,
    #[serde(alias = "Err")]
    pub err: Option<i64>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackupError {
    pub error: ErrorDetail,
    pub during: String,
    pub item: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
enum Envelope {
    Status(BackupStatus),
    Summary(BackupSummary),
    Error(BackupError),
    #[serde(other)]
    Other,
}

/// One classified line of restic output.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Status(BackupStatus),
    Summary(BackupSummary),
    Error(BackupError),
    Unstructured(String),
}

impl Message {
    pub fn parse(line: &str) -> Message {
        match serde_json::from_str::<Envelope>(line) {
            Ok(Envelope::Status(s)) => Message::Status(s),
            Ok(Envelope::Summary(s)) => Message::Summary(s),
            Ok(Envelope::Error(e)) => Message::Error(e),
            Ok(Envelope::Other) | Err(_) => Message::Unstructured(line.to_string()),
        }
    }
}

/// Renders a progress message.
pub type StatusFormatter = fn(&str, &BackupStatus);

pub fn print_status(source: &str, status: &BackupStatus) {
    tracing::info!(
        source,
        eta = %human_readable_time(status.seconds_remaining),
        percentage = %format!("{:.2}%", status.percent_done * 100.0),
        files = %format!("{}/{}", status.files_done, status.total_files),
        size = %format!(
            "{}/{}",
            human_readable(status.bytes_done as f64),
            human_readable(status.total_bytes as f64)
        ),
        current_files = ?status.current_files,
        "progress"
    );
}

/// Percentages are meaningless when the total size isn't known upfront.
pub fn ignore_status(_source: &str, _status: &BackupStatus) {}

pub fn human_readable(mut bytes: f64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut unit = 0;
    while bytes > 1024.0 && unit < UNITS.len() - 1 {
        bytes /= 1024.0;
        unit += 1;
    }
    format!("{bytes:.2}{}", UNITS[unit])
}

pub fn human_readable_time(seconds: u64) -> String {
    let parts = [
        (seconds / 3600, "h"),
        ((seconds % 3600) / 60, "m"),
        (seconds % 60, "s"),
    ];
    let rendered: Vec<String> = parts
        .iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();
    if rendered.is_empty() {
        "0s".to_string()
    } else {
        rendered.join(" ")
    }
}

pub type SummaryCallback = Box<dyn FnOnce(BackupSummary, usize) + Send>;

struct State {
    errors: usize,
    summary: Option<BackupSummary>,
    callback: Option<SummaryCallback>,
}

/// Line sink for `restic backup --json`.
///
/// Restic writes progress and the summary to stdout and errors to stderr, so the classifier
/// is cloned into both output sinks and shares its state. The summary is handed to the
/// callback by [`OutputClassifier::finish`] once both streams were drained, which makes the
/// error count final.
#[derive(Clone)]
pub struct OutputClassifier {
    source: Arc<str>,
    status: StatusFormatter,
    state: Arc<Mutex<State>>,
}

impl OutputClassifier {
    pub fn new(source: &str, status: StatusFormatter, callback: SummaryCallback) -> Self {
        Self {
            source: Arc::from(source),
            status,
            state: Arc::new(Mutex::new(State {
                errors: 0,
                summary: None,
                callback: Some(callback),
            })),
        }
    }

    pub fn error_count(&self) -> usize {
        self.lock().errors
    }

    pub fn classify(&self, line: &str) {
        match Message::parse(line) {
            Message::Status(status) => (self.status)(&self.source, &status),
            Message::Error(err) => {
                self.lock().errors += 1;
                tracing::error!(
                    source = %self.source,
                    item = %err.item,
                    during = %err.during,
                    op = %err.error.op,
                    message = %err.error.message,
                    "error occurred during backup"
                );
            }
            Message::Summary(summary) => {
                let mut state = self.lock();
                tracing::info!(
                    source = %self.source,
                    new_files = summary.files_new,
                    changed_files = summary.files_changed,
                    errors = state.errors,
                    "backup finished"
                );
                tracing::info!(
                    source = %self.source,
                    time = summary.total_duration,
                    bytes_added = summary.data_added,
                    bytes_processed = summary.total_bytes_processed,
                    "stats"
                );
                if state.summary.is_some() {
                    tracing::warn!(source = %self.source, "ignoring repeated summary");
                } else {
                    state.summary = Some(summary);
                }
            }
            Message::Unstructured(text) => {
                if !text.trim().is_empty() {
                    tracing::info!(source = %self.source, "restic output: {text}");
                }
            }
        }
    }

    /// Hands the summary and the final error count to the callback.
    ///
    /// Returns the summary if one was seen. The callback runs at most once no matter how often
    /// this is called.
    pub fn finish(&self) -> Option<BackupSummary> {
        let (summary, errors, callback) = {
            let mut state = self.lock();
            let summary = state.summary.clone()?;
            (summary, state.errors, state.callback.take())
        };
        if let Some(callback) = callback {
            callback(summary.clone(), errors);
        }
        Some(summary)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LineHandler for OutputClassifier {
    fn handle_line(&mut self, line: &str) {
        self.classify(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ERROR_LINE: &str = r#"{"message_type":"error","error":{"Op":"open","Path":"/data/a","Err":13},"during":"archival","item":"/data/a"}"#;
    const STATUS_LINE: &str = r#"{"message_type":"status","percent_done":0.5,"total_files":4,"files_done":2,"total_bytes":2048,"bytes_done":1024}"#;
    const SUMMARY_LINE: &str = r#"{"message_type":"summary","files_new":3,"files_changed":1,"files_unmodified":0,"dirs_new":1,"dirs_changed":0,"dirs_unmodified":0,"data_added":4096,"total_files_processed":4,"total_bytes_processed":8192,"total_duration":1.5,"snapshot_id":"aaa111"}"#;

    fn recording() -> (OutputClassifier, Arc<Mutex<Vec<(BackupSummary, usize)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let classifier = OutputClassifier::new(
            "/data/pvc",
            ignore_status,
            Box::new(move |summary, errors| sink.lock().unwrap().push((summary, errors))),
        );
        (classifier, calls)
    }

    #[test]
    fn test_parse_shapes() {
        assert!(matches!(Message::parse(STATUS_LINE), Message::Status(s) if s.files_done == 2));
        assert!(matches!(Message::parse(ERROR_LINE), Message::Error(e) if e.error.err == Some(13)));
        assert!(
            matches!(Message::parse(SUMMARY_LINE), Message::Summary(s) if s.snapshot_id == "aaa111")
        );
        assert_eq!(
            Message::parse("Fatal: unable to open config file"),
            Message::Unstructured("Fatal: unable to open config file".to_string())
        );
        assert!(matches!(
            Message::parse(r#"{"message_type":"verbose_status","action":"new"}"#),
            Message::Unstructured(_)
        ));
    }

    #[test]
    fn test_newer_error_shape() {
        let line = r#"{"message_type":"error","error":{"message":"permission denied"},"during":"archival","item":"/data/b"}"#;
        match Message::parse(line) {
            Message::Error(e) => {
                assert_eq!(e.error.message, "permission denied");
                assert_eq!(e.item, "/data/b");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_summary_callback_once_with_error_count() {
        let (mut classifier, calls) = recording();
        for line in [STATUS_LINE, ERROR_LINE, STATUS_LINE, ERROR_LINE, SUMMARY_LINE] {
            classifier.handle_line(line);
        }
        let summary = classifier.finish().unwrap();
        classifier.finish();

        assert_eq!(summary.files_new, 3);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, 2);
        assert_eq!(calls[0].0.snapshot_id, "aaa111");
    }

    #[test]
    fn test_unstructured_lines_are_not_errors() {
        let (mut classifier, calls) = recording();
        classifier.handle_line(ERROR_LINE);
        classifier.handle_line("open repository");
        classifier.handle_line("{ not json");
        classifier.handle_line(SUMMARY_LINE);
        classifier.finish();

        assert_eq!(classifier.error_count(), 1);
        assert_eq!(calls.lock().unwrap()[0].1, 1);
    }

    #[test]
    fn test_no_summary_no_callback() {
        let (mut classifier, calls) = recording();
        classifier.handle_line(ERROR_LINE);
        assert!(classifier.finish().is_none());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_clones_share_error_count() {
        let (classifier, _) = recording();
        let mut stdout = classifier.clone();
        let mut stderr = classifier.clone();
        stdout.handle_line(STATUS_LINE);
        stderr.handle_line(ERROR_LINE);
        stderr.handle_line(ERROR_LINE);
        assert_eq!(classifier.error_count(), 2);
    }

    #[test]
    fn test_status_formatter_is_used() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        fn count(_: &str, _: &BackupStatus) {
            SEEN.fetch_add(1, Ordering::SeqCst);
        }
        let mut classifier = OutputClassifier::new("db.sql", count, Box::new(|_, _| {}));
        classifier.handle_line(STATUS_LINE);
        classifier.handle_line(STATUS_LINE);
        assert_eq!(SEEN.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_human_readable() {
        assert_eq!(human_readable(512.0), "512.00B");
        assert_eq!(human_readable(1536.0), "1.50KB");
        assert_eq!(human_readable(3.0 * 1024.0 * 1024.0 * 1024.0), "3.00GB");
    }

    #[test]
    fn test_human_readable_time() {
        assert_eq!(human_readable_time(0), "0s");
        assert_eq!(human_readable_time(59), "59s");
        assert_eq!(human_readable_time(5400), "1h 30m");
        assert_eq!(human_readable_time(3661), "1h 1m 1s");
    }
}
