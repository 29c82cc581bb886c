// Log Consolidation
// Merges per-task logs into the job log and extracts error digests

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Markers wrapped tools print in front of fatal errors
const ERROR_MARKERS: &[&str] = &["##### ERROR", "[E::"];

/// Append each task log, in order, to `job_log` and delete the task logs.
///
/// Missing task logs are skipped. Every task log is removed even when
/// appending fails; the first error is returned afterwards.
pub fn merge_into_job_log(task_logs: &[PathBuf], job_log: &Path) -> io::Result<()> {
    let mut first_error = None;

    let mut out = match OpenOptions::new().create(true).append(true).open(job_log) {
        Ok(file) => Some(file),
        Err(e) => {
            first_error = Some(e);
            None
        }
    };

    for log in task_logs {
        if let Some(out) = out.as_mut() {
            match File::open(log) {
                Ok(mut input) => {
                    if let Err(e) = io::copy(&mut input, out) {
                        first_error.get_or_insert(e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match fs::remove_file(log) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[derive(Debug, Default)]
struct LogDigest {
    /// Lines carrying an error marker, newline terminated
    marked: String,
    /// Last non-empty line, newline terminated
    last_line: String,
}

impl LogDigest {
    fn read(path: &Path) -> Self {
        let mut digest = Self::default();
        let Ok(file) = File::open(path) else {
            return digest;
        };

        for line in BufReader::new(file).lines().map_while(Result::ok) {
            if ERROR_MARKERS.iter().any(|marker| line.contains(marker)) {
                digest.marked.push_str(&line);
                digest.marked.push('\n');
            } else if !line.is_empty() {
                digest.last_line = format!("{}\n", line);
            }
        }
        digest
    }

    fn summary(&self) -> &str {
        if self.marked.is_empty() {
            &self.last_line
        } else {
            &self.marked
        }
    }
}

/// Find the error message shared by a set of failed task logs.
///
/// Each log is reduced to its marked error lines, or its last line when it
/// has none. When all logs agree the common message is returned. When they
/// disagree, the first disagreeing log's marked lines are returned if it has
/// any; otherwise there is no single message to report.
pub fn find_error(logs: &[PathBuf]) -> Option<String> {
    let mut message: Option<String> = None;

    for log in logs {
        let digest = LogDigest::read(log);
        let summary = digest.summary();
        if summary.is_empty() {
            continue;
        }

        match &message {
            None => message = Some(summary.to_string()),
            Some(current) if current == summary => {}
            Some(_) => {
                return if digest.marked.is_empty() {
                    None
                } else {
                    Some(digest.marked)
                };
            }
        }
    }

    message
}
