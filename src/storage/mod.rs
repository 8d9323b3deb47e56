//! Run/step repository seam.
//!
//! The engine only depends on the `WorkflowRepository` trait; the durable
//! store behind it belongs to the surrounding system. The SQLite
//! implementation here is the default adapter; the in-memory one backs
//! tests and single-process embedding.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::core::errors::Result;
use crate::engine::state::{RunStatus, WorkflowRun, WorkflowStep};

pub use sqlite::SqliteRepository;

/// Pagination window for list queries.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// CRUD and query surface for runs and their step audit rows.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn create_run(&self, run: &WorkflowRun) -> Result<()>;

    /// Persists the run's current state, stamping `updated_at`.
    async fn update_run(&self, run: &WorkflowRun) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>>;

    /// Runs ordered newest-first, optionally filtered by definition.
    async fn list_runs(
        &self,
        definition_id: Option<&str>,
        page: Page,
    ) -> Result<Vec<WorkflowRun>>;

    /// Runs in `status` whose last update precedes `cutoff`. Feeds the
    /// crash-recovery sweep.
    async fn list_stale(
        &self,
        status: RunStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRun>>;

    async fn append_step(&self, step: &WorkflowStep) -> Result<()>;

    async fn update_step(&self, step: &WorkflowStep) -> Result<()>;

    /// Steps for a run in sequence order.
    async fn list_steps(&self, run_id: &str, page: Page) -> Result<Vec<WorkflowStep>>;
}

/// In-memory repository; no durability, same contract.
#[derive(Default)]
pub struct MemoryRepository {
    runs: DashMap<String, WorkflowRun>,
    steps: DashMap<String, Vec<WorkflowStep>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for MemoryRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        self.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<()> {
        let mut stored = run.clone();
        stored.updated_at = Utc::now();
        self.runs.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn list_runs(
        &self,
        definition_id: Option<&str>,
        page: Page,
    ) -> Result<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .iter()
            .filter(|r| definition_id.map(|id| r.definition_id == id).unwrap_or(true))
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn list_stale(
        &self,
        status: RunStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRun>> {
        Ok(self
            .runs
            .iter()
            .filter(|r| r.status == status && r.updated_at < cutoff)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn append_step(&self, step: &WorkflowStep) -> Result<()> {
        self.steps
            .entry(step.run_id.clone())
            .or_default()
            .push(step.clone());
        Ok(())
    }

    async fn update_step(&self, step: &WorkflowStep) -> Result<()> {
        if let Some(mut steps) = self.steps.get_mut(&step.run_id) {
            if let Some(existing) = steps.iter_mut().find(|s| s.id == step.id) {
                *existing = step.clone();
            }
        }
        Ok(())
    }

    async fn list_steps(&self, run_id: &str, page: Page) -> Result<Vec<WorkflowStep>> {
        let mut steps = self
            .steps
            .get(run_id)
            .map(|s| s.value().clone())
            .unwrap_or_default();
        steps.sort_by_key(|s| s.sequence);
        Ok(steps
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }
}
