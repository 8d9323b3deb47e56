//! Startup crash-recovery sweep.
//!
//! Marks runs abandoned mid-execution as failed with a distinguishing
//! error code. A crashed run is conservatively abandoned, never retried
//! automatically, and no engine state is re-derived. The sweep cannot
//! tell a truly crashed run from one stuck in a very long tool call past
//! the window; the window is operator-tunable for exactly that reason.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::core::errors::Result;
use crate::engine::executor::EngineConfig;
use crate::engine::state::{RunError, RunStatus};
use crate::storage::WorkflowRepository;

/// Error code distinguishing crash-induced failures from application
/// failures.
pub const CRASH_ERROR_CODE: &str = "crash_recovered";

/// Outcome counts of one sweep, for operator logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Stale running runs found.
    pub scanned: usize,
    /// Runs successfully marked failed.
    pub failed: usize,
    /// Runs the sweep could not update.
    pub errors: usize,
}

/// Scans for runs still marked `running` past the staleness window and
/// fails them.
pub struct RecoverySweep {
    repository: Arc<dyn WorkflowRepository>,
    window: Duration,
}

impl RecoverySweep {
    pub fn new(repository: Arc<dyn WorkflowRepository>) -> Self {
        Self {
            repository,
            window: Duration::from_secs(300),
        }
    }

    /// Overrides the staleness window (production default: 5 minutes).
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn from_config(repository: Arc<dyn WorkflowRepository>, config: &EngineConfig) -> Self {
        Self::new(repository).with_window(Duration::from_secs(config.stale_run_timeout_secs))
    }

    /// Runs one sweep. Call on process start, before accepting new work.
    pub async fn sweep(&self) -> Result<RecoveryStats> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.window)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        info!(window_secs = self.window.as_secs(), "starting crash-recovery sweep");

        let stale = self
            .repository
            .list_stale(RunStatus::Running, cutoff)
            .await?;
        let mut stats = RecoveryStats {
            scanned: stale.len(),
            ..Default::default()
        };

        for mut run in stale {
            warn!(
                run_id = %run.id,
                definition_id = %run.definition_id,
                last_update = %run.updated_at,
                "marking stale running run as failed"
            );
            run.status = RunStatus::Failed;
            run.error = Some(RunError::new(
                format!(
                    "run abandoned: no progress since {} (staleness window {}s)",
                    run.updated_at,
                    self.window.as_secs()
                ),
                CRASH_ERROR_CODE,
            ));
            run.completed_at = Some(Utc::now());
            match self.repository.update_run(&run).await {
                Ok(()) => stats.failed += 1,
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "failed to mark run as crashed");
                    stats.errors += 1;
                }
            }
        }

        info!(
            scanned = stats.scanned,
            failed = stats.failed,
            errors = stats.errors,
            "crash-recovery sweep completed"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryRepository, Page};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use crate::engine::state::WorkflowRun;

    async fn seed_run(
        repo: &MemoryRepository,
        status: RunStatus,
        age_minutes: i64,
    ) -> WorkflowRun {
        let mut run = WorkflowRun::new("def-1", 1, json!({}));
        run.status = status;
        run.updated_at = Utc::now() - ChronoDuration::minutes(age_minutes);
        repo.create_run(&run).await.unwrap();
        run
    }

    #[tokio::test]
    async fn test_sweep_fails_only_stale_running_runs() {
        let repo = Arc::new(MemoryRepository::new());
        let stale = seed_run(&repo, RunStatus::Running, 10).await;
        let fresh = seed_run(&repo, RunStatus::Running, 0).await;
        let suspended = seed_run(&repo, RunStatus::Suspended, 10).await;

        let stats = RecoverySweep::new(repo.clone())
            .with_window(Duration::from_secs(300))
            .sweep()
            .await
            .unwrap();

        assert_eq!(stats, RecoveryStats { scanned: 1, failed: 1, errors: 0 });

        let recovered = repo.get_run(&stale.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, RunStatus::Failed);
        let error = recovered.error.unwrap();
        assert_eq!(error.code, CRASH_ERROR_CODE);
        assert!(recovered.completed_at.is_some());

        // Fresh and suspended runs are untouched.
        assert_eq!(
            repo.get_run(&fresh.id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
        assert_eq!(
            repo.get_run(&suspended.id).await.unwrap().unwrap().status,
            RunStatus::Suspended
        );
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let repo = Arc::new(MemoryRepository::new());
        seed_run(&repo, RunStatus::Running, 10).await;

        let sweep = RecoverySweep::new(repo.clone());
        let first = sweep.sweep().await.unwrap();
        assert_eq!(first.failed, 1);

        // The run is failed now, so a second sweep finds nothing.
        let second = sweep.sweep().await.unwrap();
        assert_eq!(second, RecoveryStats::default());

        let runs = repo.list_runs(None, Page::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_window_from_config() {
        let repo = Arc::new(MemoryRepository::new());
        seed_run(&repo, RunStatus::Running, 2).await;

        let config = EngineConfig {
            stale_run_timeout_secs: 60,
            ..Default::default()
        };
        let stats = RecoverySweep::from_config(repo, &config).sweep().await.unwrap();
        assert_eq!(stats.failed, 1);
    }
}
