//! Parallel-branch coordinator.
//!
//! Runs a set of named, independent async branches under a merge strategy
//! and an error-handling mode. Branches are isolated by construction: the
//! caller builds each branch future over its own copy of prior results, so
//! siblings can never observe each other. A branch that outlives its
//! timeout is treated as rejected for merge purposes but its task is not
//! force-aborted; the result is simply discarded.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::core::errors::{EngineError, Result};

/// How branch outcomes are combined into one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Wait for every branch; the result carries one entry per branch.
    #[default]
    All,
    /// Return as soon as one branch succeeds; error if all fail.
    Any,
    /// Return whichever branch settles first, success or failure.
    First,
}

/// Failure containment under the `all` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorHandling {
    /// Propagate the first branch error immediately.
    #[default]
    FailFast,
    /// Wait for every branch and report per-branch outcomes, never
    /// throwing.
    CollectAll,
}

/// Settled state of one branch, keyed by branch name in the merged result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BranchOutcome {
    Fulfilled { value: Value },
    Rejected { error: String },
}

impl BranchOutcome {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled { .. })
    }
}

/// One named branch of work.
pub struct ParallelBranch {
    pub name: String,
    pub future: BoxFuture<'static, anyhow::Result<Value>>,
}

/// Inputs to a coordinated fan-out.
pub struct BranchRequest {
    pub branches: Vec<ParallelBranch>,
    pub merge_strategy: MergeStrategy,
    pub error_handling: ErrorHandling,
    /// When set, a branch not settled within the window is forced to a
    /// rejected outcome; other branches are unaffected.
    pub timeout_ms: Option<u64>,
}

struct Settled {
    name: String,
    outcome: std::result::Result<Value, BranchFailure>,
}

struct BranchFailure {
    message: String,
    timed_out: bool,
}

/// Executes the branches and merges their outcomes.
pub async fn execute_parallel_branches(
    request: BranchRequest,
) -> Result<BTreeMap<String, BranchOutcome>> {
    let BranchRequest {
        branches,
        merge_strategy,
        error_handling,
        timeout_ms,
    } = request;

    let total = branches.len();
    debug!(branches = total, ?merge_strategy, ?error_handling, "starting parallel fan-out");

    let mut in_flight: FuturesUnordered<_> = branches
        .into_iter()
        .map(|branch| {
            let ParallelBranch { name, future } = branch;
            // Spawn so abandoned branches keep running detached after an
            // early return; their results are dropped with the stream.
            let handle = tokio::spawn(async move {
                match timeout_ms {
                    Some(ms) => match timeout(Duration::from_millis(ms), future).await {
                        Ok(settled) => settled.map_err(|e| BranchFailure {
                            message: e.to_string(),
                            timed_out: false,
                        }),
                        Err(_) => Err(BranchFailure {
                            message: format!("branch timed out after {ms}ms"),
                            timed_out: true,
                        }),
                    },
                    None => future.await.map_err(|e| BranchFailure {
                        message: e.to_string(),
                        timed_out: false,
                    }),
                }
            });
            async move {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(join_error) => Err(BranchFailure {
                        message: format!("branch panicked: {join_error}"),
                        timed_out: false,
                    }),
                };
                Settled { name, outcome }
            }
        })
        .collect();

    match merge_strategy {
        MergeStrategy::First => {
            let mut merged = BTreeMap::new();
            if let Some(settled) = in_flight.next().await {
                merged.insert(settled.name, to_outcome(settled.outcome));
            }
            Ok(merged)
        }
        MergeStrategy::Any => {
            let mut failures: Vec<(String, String)> = Vec::new();
            while let Some(settled) = in_flight.next().await {
                match settled.outcome {
                    Ok(value) => {
                        let mut merged = BTreeMap::new();
                        merged.insert(settled.name, BranchOutcome::Fulfilled { value });
                        return Ok(merged);
                    }
                    Err(failure) => failures.push((settled.name, failure.message)),
                }
            }
            let detail = failures
                .iter()
                .map(|(name, message)| format!("{name}: {message}"))
                .collect::<Vec<_>>()
                .join("; ");
            Err(EngineError::AllBranchesFailed(detail))
        }
        MergeStrategy::All => {
            let mut merged = BTreeMap::new();
            while let Some(settled) = in_flight.next().await {
                if error_handling == ErrorHandling::FailFast {
                    if let Err(failure) = &settled.outcome {
                        warn!(branch = %settled.name, error = %failure.message, "branch failed, short-circuiting");
                        return Err(if failure.timed_out {
                            EngineError::Timeout {
                                operation: format!("branch '{}'", settled.name),
                                timeout_ms: timeout_ms.unwrap_or_default(),
                            }
                        } else {
                            EngineError::Branch {
                                branch: settled.name.clone(),
                                message: failure.message.clone(),
                            }
                        });
                    }
                }
                merged.insert(settled.name, to_outcome(settled.outcome));
            }
            debug_assert_eq!(merged.len(), total);
            Ok(merged)
        }
    }
}

fn to_outcome(settled: std::result::Result<Value, BranchFailure>) -> BranchOutcome {
    match settled {
        Ok(value) => BranchOutcome::Fulfilled { value },
        Err(failure) => BranchOutcome::Rejected {
            error: failure.message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::sleep;

    fn branch(
        name: &str,
        delay_ms: u64,
        result: anyhow::Result<Value>,
    ) -> ParallelBranch {
        let name = name.to_string();
        ParallelBranch {
            name,
            future: Box::pin(async move {
                sleep(Duration::from_millis(delay_ms)).await;
                result
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_collects_every_branch() {
        let merged = execute_parallel_branches(BranchRequest {
            branches: vec![
                branch("a", 10, Ok(json!(1))),
                branch("b", 5, Ok(json!(2))),
                branch("c", 1, Err(anyhow::anyhow!("broken"))),
            ],
            merge_strategy: MergeStrategy::All,
            error_handling: ErrorHandling::CollectAll,
            timeout_ms: None,
        })
        .await
        .unwrap();

        assert_eq!(merged.len(), 3);
        assert_eq!(merged["a"], BranchOutcome::Fulfilled { value: json!(1) });
        assert_eq!(merged["b"], BranchOutcome::Fulfilled { value: json!(2) });
        assert!(!merged["c"].is_fulfilled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_all_always_one_entry_per_branch() {
        // Every branch fails; collect-all must still report all of them.
        let merged = execute_parallel_branches(BranchRequest {
            branches: (0..5)
                .map(|i| branch(&format!("b{i}"), i, Err(anyhow::anyhow!("fail {i}"))))
                .collect(),
            merge_strategy: MergeStrategy::All,
            error_handling: ErrorHandling::CollectAll,
            timeout_ms: None,
        })
        .await
        .unwrap();
        assert_eq!(merged.len(), 5);
        assert!(merged.values().all(|o| !o.is_fulfilled()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_propagates_first_error() {
        let err = execute_parallel_branches(BranchRequest {
            branches: vec![
                branch("slow-ok", 100, Ok(json!("fine"))),
                branch("fast-bad", 1, Err(anyhow::anyhow!("exploded"))),
            ],
            merge_strategy: MergeStrategy::All,
            error_handling: ErrorHandling::FailFast,
            timeout_ms: None,
        })
        .await
        .unwrap_err();

        match err {
            EngineError::Branch { branch, message } => {
                assert_eq!(branch, "fast-bad");
                assert_eq!(message, "exploded");
            }
            other => panic!("expected branch error, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_returns_first_success() {
        let merged = execute_parallel_branches(BranchRequest {
            branches: vec![
                branch("fails", 1, Err(anyhow::anyhow!("nope"))),
                branch("wins", 10, Ok(json!("winner"))),
                branch("slower", 500, Ok(json!("late"))),
            ],
            merge_strategy: MergeStrategy::Any,
            error_handling: ErrorHandling::FailFast,
            timeout_ms: None,
        })
        .await
        .unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged["wins"],
            BranchOutcome::Fulfilled { value: json!("winner") }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_aggregates_when_all_fail() {
        let err = execute_parallel_branches(BranchRequest {
            branches: vec![
                branch("x", 1, Err(anyhow::anyhow!("x failed"))),
                branch("y", 2, Err(anyhow::anyhow!("y failed"))),
            ],
            merge_strategy: MergeStrategy::Any,
            error_handling: ErrorHandling::FailFast,
            timeout_ms: None,
        })
        .await
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("x failed"));
        assert!(message.contains("y failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_settles_on_fastest_even_if_rejected() {
        let merged = execute_parallel_branches(BranchRequest {
            branches: vec![
                branch("fast-bad", 1, Err(anyhow::anyhow!("first and broken"))),
                branch("slow-ok", 100, Ok(json!("ok"))),
            ],
            merge_strategy: MergeStrategy::First,
            error_handling: ErrorHandling::FailFast,
            timeout_ms: None,
        })
        .await
        .unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged["fast-bad"],
            BranchOutcome::Rejected { error: "first and broken".to_string() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_slow_branch_only() {
        let merged = execute_parallel_branches(BranchRequest {
            branches: vec![
                branch("fast", 10, Ok(json!("made it"))),
                branch("slow", 500, Ok(json!("too late"))),
            ],
            merge_strategy: MergeStrategy::All,
            error_handling: ErrorHandling::CollectAll,
            timeout_ms: Some(50),
        })
        .await
        .unwrap();

        assert_eq!(
            merged["fast"],
            BranchOutcome::Fulfilled { value: json!("made it") }
        );
        match &merged["slow"] {
            BranchOutcome::Rejected { error } => assert!(error.contains("timed out")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_escalates_under_fail_fast() {
        let err = execute_parallel_branches(BranchRequest {
            branches: vec![branch("slow", 500, Ok(json!("late")))],
            merge_strategy: MergeStrategy::All,
            error_handling: ErrorHandling::FailFast,
            timeout_ms: Some(50),
        })
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::Timeout { timeout_ms: 50, .. }));
    }
}
