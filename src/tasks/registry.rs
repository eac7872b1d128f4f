//! In-flight task registry.
//!
//! One cancellation token per task id. The token handed out at registration
//! is the task's cancel handle: every executor, polling loop and subprocess
//! spawned for the task observes it.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// Process-wide index of in-flight tasks.
#[derive(Default)]
pub struct TaskRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and return its cancellation token. An existing entry
    /// under the same id is replaced; the old token is dropped unfired.
    pub fn register(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut tokens = self.tokens.lock().unwrap();
        tokens.insert(task_id.to_string(), token.clone());
        token
    }

    /// Fire a task's cancellation signal and drop the entry. Returns false
    /// when the task is unknown or already finished.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut tokens = self.tokens.lock().unwrap();
        match tokens.remove(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a finished task's entry without firing. Idempotent.
    pub fn cleanup(&self, task_id: &str) {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.remove(task_id);
    }

    /// Number of in-flight tasks.
    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_cancel() {
        let registry = TaskRegistry::new();
        let token = registry.register("task-1");
        assert!(!token.is_cancelled());

        assert!(registry.cancel("task-1"));
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_unknown_task() {
        let registry = TaskRegistry::new();
        assert!(!registry.cancel("missing"));
    }

    #[test]
    fn test_cleanup_does_not_fire() {
        let registry = TaskRegistry::new();
        let token = registry.register("task-1");
        registry.cleanup("task-1");
        registry.cleanup("task-1");
        assert!(!token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregister_replaces_without_firing() {
        let registry = TaskRegistry::new();
        let old = registry.register("task-1");
        let new = registry.register("task-1");
        assert!(!old.is_cancelled());
        assert!(registry.cancel("task-1"));
        assert!(new.is_cancelled());
        assert!(!old.is_cancelled());
    }
}
