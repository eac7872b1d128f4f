//! Per-task structured log files.
//!
//! Each task gets `logs/<taskId>/` with one append-only file per step type.
//! Files open lazily on first write. Writes to the same step file are
//! serialised by a per-file mutex; distinct steps write concurrently.
//! Logging never fails the caller: errors are reported to the process log.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing::error;

const LINE_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Per-task log store keyed by step type.
pub struct TaskLogStore {
    task_id: String,
    log_dir: PathBuf,
    writers: Mutex<HashMap<String, Arc<Mutex<File>>>>,
}

impl TaskLogStore {
    /// Create the store under the default `logs/` root.
    pub fn new(task_id: &str) -> Self {
        Self::new_in(Path::new("logs"), task_id)
    }

    /// Create the store under an explicit root.
    pub fn new_in(root: &Path, task_id: &str) -> Self {
        let log_dir = root.join(task_id);
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            error!("failed to create task log directory {}: {}", log_dir.display(), e);
        }
        Self {
            task_id: task_id.to_string(),
            log_dir,
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn writer(&self, step_type: &str) -> Option<Arc<Mutex<File>>> {
        let mut writers = self.writers.lock().unwrap();
        if let Some(w) = writers.get(step_type) {
            return Some(w.clone());
        }

        let path = self.log_dir.join(format!("{}.log", step_type));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                let handle = Arc::new(Mutex::new(file));
                writers.insert(step_type.to_string(), handle.clone());
                Some(handle)
            }
            Err(e) => {
                error!("failed to open step log {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Append a `YYYY/MM/DD HH:MM:SS [LEVEL] message` line to a step log.
    pub fn write_step(&self, step_type: &str, level: &str, message: &str) {
        let Some(handle) = self.writer(step_type) else {
            return;
        };
        let line = format!(
            "{} [{}] {}\n",
            Local::now().format(LINE_TIME_FORMAT),
            level,
            message
        );
        let mut file = handle.lock().unwrap();
        if let Err(e) = file.write_all(line.as_bytes()) {
            error!("failed to write step log: {}", e);
        }
    }

    /// Append a command invocation: `[COMMAND]` header, the raw combined
    /// output bytes, and an `[ERROR]` footer when the command failed.
    pub fn write_command(
        &self,
        step_type: &str,
        command: &str,
        output: &[u8],
        err: Option<&str>,
    ) {
        let Some(handle) = self.writer(step_type) else {
            return;
        };
        let timestamp = Local::now().format(LINE_TIME_FORMAT);
        let mut file = handle.lock().unwrap();

        let header = format!("{} [COMMAND] {}\n", timestamp, command);
        let _ = file.write_all(header.as_bytes());
        if !output.is_empty() {
            let _ = file.write_all(output);
            let _ = file.write_all(b"\n");
        }
        if let Some(err) = err {
            let footer = format!("{} [ERROR] Command failed: {}\n", timestamp, err);
            let _ = file.write_all(footer.as_bytes());
        }
        if let Err(e) = file.flush() {
            error!("failed to flush step log: {}", e);
        }
    }

    /// Convenience sink for task-level lines.
    pub fn write_console(&self, level: &str, message: &str) {
        self.write_step("console", level, message);
    }

    /// Append sink suitable for streaming subprocess output in real time
    /// (consumed by the log-tail endpoint outside the core).
    pub fn step_writer(&self, step_type: &str) -> Option<StepWriter> {
        self.writer(step_type).map(StepWriter)
    }

    /// Close all open handles. Subsequent writes reopen lazily.
    pub fn close(&self) {
        let mut writers = self.writers.lock().unwrap();
        writers.clear();
    }
}

/// `io::Write` over a single step log file.
pub struct StepWriter(Arc<Mutex<File>>);

impl Write for StepWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_step_line_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskLogStore::new_in(dir.path(), "task-1");
        store.write_step("pullOnline", "INFO", "pulling image");

        let contents =
            std::fs::read_to_string(dir.path().join("task-1").join("pullOnline.log")).unwrap();
        assert!(contents.contains("[INFO] pulling image"));
        // leading timestamp: YYYY/MM/DD HH:MM:SS
        assert_eq!(contents.as_bytes()[4], b'/');
        assert_eq!(contents.as_bytes()[7], b'/');
    }

    #[test]
    fn test_write_command_with_error_footer() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskLogStore::new_in(dir.path(), "task-1");
        store.write_command(
            "tagImages",
            "docker tag a b",
            b"raw output",
            Some("exit status 1"),
        );

        let contents =
            std::fs::read_to_string(dir.path().join("task-1").join("tagImages.log")).unwrap();
        assert!(contents.contains("[COMMAND] docker tag a b"));
        assert!(contents.contains("raw output"));
        assert!(contents.contains("[ERROR] Command failed: exit status 1"));
    }

    #[test]
    fn test_steps_write_to_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskLogStore::new_in(dir.path(), "task-2");
        store.write_step("pullOnline", "INFO", "a");
        store.write_step("pushLocal", "INFO", "b");
        store.close();

        let task_dir = dir.path().join("task-2");
        assert!(task_dir.join("pullOnline.log").exists());
        assert!(task_dir.join("pushLocal.log").exists());
    }

    #[test]
    fn test_append_across_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskLogStore::new_in(dir.path(), "task-3");
        store.write_step("deployService", "INFO", "first");
        store.close();
        store.write_step("deployService", "INFO", "second");

        let contents =
            std::fs::read_to_string(dir.path().join("task-3").join("deployService.log")).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
    }
}
