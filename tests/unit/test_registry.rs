//! Task registry cancellation tests.

use std::sync::Arc;
use std::time::Duration;

use cicd_agent::tasks::registry::TaskRegistry;

#[tokio::test]
async fn test_cancel_reaches_waiting_worker_quickly() {
    let registry = Arc::new(TaskRegistry::new());
    let token = registry.register("task-1");

    let worker = tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => "cancelled",
            _ = tokio::time::sleep(Duration::from_secs(30)) => "timed out",
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(registry.cancel("task-1"));

    let outcome = tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .expect("worker did not observe cancellation within 1s")
        .unwrap();
    assert_eq!(outcome, "cancelled");
}

#[tokio::test]
async fn test_terminal_cleanup_leaves_no_entry() {
    let registry = TaskRegistry::new();
    registry.register("task-1");
    registry.register("task-2");

    // normal completion path
    registry.cleanup("task-1");
    // cancellation path removes on fire
    assert!(registry.cancel("task-2"));

    assert!(registry.is_empty());
    // second cancel finds nothing
    assert!(!registry.cancel("task-1"));
    assert!(!registry.cancel("task-2"));
}

#[tokio::test]
async fn test_cancel_is_sticky_for_cloned_tokens() {
    let registry = TaskRegistry::new();
    let token = registry.register("task-1");
    let clone = token.clone();

    registry.cancel("task-1");
    assert!(token.is_cancelled());
    assert!(clone.is_cancelled());
    // observers joining after the fact still see the signal
    clone.cancelled().await;
}
