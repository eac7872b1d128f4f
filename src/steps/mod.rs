//! Step executors.
//!
//! Each executor wraps one external-tool invocation pattern. The common
//! contract: take the task's cancellation token and log store, return
//! `Ok(())` or a typed failure, and observe cancellation within about a
//! second — including any subprocess spawned on the task's behalf.

pub mod check_image;
pub mod check_service;
pub mod cleanup;
pub mod deploy;
pub mod pull;
pub mod push;
pub mod tag;
pub mod traffic;
pub mod web;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::errors::AgentError;

/// Fan-out width for image operations: one worker per item, capped at 20.
pub(crate) fn fanout_concurrency(item_count: usize) -> usize {
    item_count.clamp(1, 20)
}

/// Run a batch of jobs with bounded concurrency.
///
/// All jobs are driven to completion (in-flight workers drain after a
/// failure); the first error wins. A fired cancellation token outranks
/// individual worker errors.
pub(crate) async fn run_fanout<F>(
    cancel: &CancellationToken,
    cap: usize,
    jobs: Vec<F>,
) -> Result<(), AgentError>
where
    F: Future<Output = Result<(), AgentError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(cap.max(1)));
    let mut handles = Vec::with_capacity(jobs.len());

    for job in jobs {
        let sem = semaphore.clone();
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            let _permit = match sem.acquire().await {
                Ok(p) => p,
                Err(_) => return Err(AgentError::Cancelled),
            };
            if token.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            job.await
        }));
    }

    let mut first_error: Option<AgentError> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(AgentError::Internal(format!("worker panicked: {}", e)));
                }
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(AgentError::Cancelled);
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fanout_concurrency_bounds() {
        assert_eq!(fanout_concurrency(0), 1);
        assert_eq!(fanout_concurrency(1), 1);
        assert_eq!(fanout_concurrency(15), 15);
        assert_eq!(fanout_concurrency(20), 20);
        assert_eq!(fanout_concurrency(500), 20);
    }

    #[tokio::test]
    async fn test_run_fanout_runs_all_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let jobs: Vec<_> = (0..10)
            .map(|_| {
                let c = counter.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .collect();

        run_fanout(&cancel, 3, jobs).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_run_fanout_first_error_wins_after_drain() {
        let completed = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let mut jobs = Vec::new();
        for i in 0..5 {
            let c = completed.clone();
            jobs.push(async move {
                if i == 2 {
                    Err(AgentError::ToolError("boom".to_string()))
                } else {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        let err = run_fanout(&cancel, 5, jobs).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolError(_)));
        assert_eq!(completed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_run_fanout_cancellation_outranks_errors() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let jobs = vec![async { Err(AgentError::ToolError("never reached".to_string())) }];
        let err = run_fanout(&cancel, 1, jobs).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
