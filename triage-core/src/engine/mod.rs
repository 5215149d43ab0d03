//! Task graph engine: runs analysis phases over registered providers.
//!
//! A phase is an ordered set of task specs executed either sequentially or in
//! parallel under one phase-level deadline. Every scheduled task comes back
//! with a terminal outcome (or `pending` when never dispatched), so incomplete
//! phases are always visible to the caller.

pub mod graph;
pub mod retry;

pub use graph::{GraphResult, TaskGraph};
pub use retry::RetryPolicy;

use crate::providers::{AnalysisContext, AnalysisProvider, ProviderRegistry};
use crate::types::{
    AnalysisTask, ErrorDescriptor, FailureKind, IncidentSnapshot, ProviderId, ProviderKind,
    TaskOutcome,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How the tasks of a phase are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseMode {
    /// Each task starts after its predecessor succeeds; a failure short-circuits.
    Sequential,
    /// All tasks start at once under the phase deadline.
    Parallel,
}

impl fmt::Display for PhaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseMode::Sequential => write!(f, "sequential"),
            PhaseMode::Parallel => write!(f, "parallel"),
        }
    }
}

/// One provider invocation within a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub provider: ProviderId,
    pub timeout: Duration,
}

impl TaskSpec {
    pub fn new(provider: impl Into<String>, timeout: Duration) -> Self {
        Self {
            provider: ProviderId::new(provider),
            timeout,
        }
    }
}

/// A named phase of the task graph.
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub name: String,
    pub mode: PhaseMode,
    pub deadline: Duration,
    pub tasks: Vec<TaskSpec>,
    pub depends_on: Vec<String>,
}

impl PhaseSpec {
    pub fn new(name: impl Into<String>, mode: PhaseMode, deadline: Duration) -> Self {
        Self {
            name: name.into(),
            mode,
            deadline,
            tasks: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn task(mut self, provider: impl Into<String>, timeout: Duration) -> Self {
        self.tasks.push(TaskSpec::new(provider, timeout));
        self
    }

    pub fn after(mut self, phase: impl Into<String>) -> Self {
        self.depends_on.push(phase.into());
        self
    }
}

/// Outcomes of one phase, keyed by provider.
#[derive(Debug, Clone)]
pub struct PhaseResult {
    pub phase: String,
    pub mode: PhaseMode,
    pub outcomes: BTreeMap<ProviderId, AnalysisTask>,
    /// False when the deadline hit or a sequential chain short-circuited.
    pub complete: bool,
    /// The phase was never dispatched because a dependency blocked it.
    pub skipped: bool,
    pub elapsed: Duration,
}

impl PhaseResult {
    pub fn successes(&self) -> usize {
        self.outcomes
            .values()
            .filter(|t| t.outcome.is_success())
            .count()
    }

    /// Whether phases depending on this one must not run.
    pub fn is_blocking(&self) -> bool {
        self.skipped
            || (self.mode == PhaseMode::Sequential && !self.complete)
            || self.successes() == 0
    }
}

/// Runs phases against a provider registry under an explicit retry policy.
#[derive(Clone)]
pub struct TaskGraphEngine {
    registry: ProviderRegistry,
    retry: RetryPolicy,
    cancellation_grace: Duration,
}

impl TaskGraphEngine {
    pub fn new(registry: ProviderRegistry, retry: RetryPolicy, cancellation_grace: Duration) -> Self {
        Self {
            registry,
            retry,
            cancellation_grace,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn cancellation_grace(&self) -> Duration {
        self.cancellation_grace
    }

    fn pending_task(
        &self,
        spec: &TaskSpec,
        snapshot: &IncidentSnapshot,
        deadline: DateTime<Utc>,
    ) -> AnalysisTask {
        let kind = self
            .registry
            .kind_of(&spec.provider)
            .unwrap_or(ProviderKind::Inference);
        AnalysisTask::pending(spec.provider.clone(), kind, snapshot.id.clone(), deadline)
    }

    /// A phase that was never dispatched: every task stays `pending`.
    pub fn skipped_phase(&self, snapshot: &IncidentSnapshot, phase: &PhaseSpec) -> PhaseResult {
        let deadline = wall_clock_deadline(phase.deadline);
        PhaseResult {
            phase: phase.name.clone(),
            mode: phase.mode,
            outcomes: phase
                .tasks
                .iter()
                .map(|spec| (spec.provider.clone(), self.pending_task(spec, snapshot, deadline)))
                .collect(),
            complete: false,
            skipped: true,
            elapsed: Duration::ZERO,
        }
    }

    /// Run one phase to completion or to its deadline, whichever comes first.
    pub async fn run_phase(
        &self,
        snapshot: Arc<IncidentSnapshot>,
        ctx: &AnalysisContext,
        phase: &PhaseSpec,
    ) -> PhaseResult {
        let started = Instant::now();
        let deadline = started + phase.deadline;
        let phase_ctx = ctx.child();
        info!(
            incident_id = %snapshot.id,
            phase = %phase.name,
            mode = %phase.mode,
            tasks = phase.tasks.len(),
            deadline_ms = phase.deadline.as_millis() as u64,
            "Starting analysis phase"
        );

        let (outcomes, complete) = match phase.mode {
            PhaseMode::Parallel => self.run_parallel(&snapshot, &phase_ctx, phase, deadline).await,
            PhaseMode::Sequential => {
                self.run_sequential(&snapshot, &phase_ctx, phase, deadline)
                    .await
            }
        };
        // Whatever is still in flight belongs to this phase only.
        phase_ctx.cancel.cancel();

        let result = PhaseResult {
            phase: phase.name.clone(),
            mode: phase.mode,
            outcomes,
            complete,
            skipped: false,
            elapsed: started.elapsed(),
        };
        info!(
            incident_id = %snapshot.id,
            phase = %phase.name,
            complete = result.complete,
            successes = result.successes(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Analysis phase finished"
        );
        result
    }

    fn job(
        &self,
        spec: &TaskSpec,
        task: AnalysisTask,
        snapshot: &Arc<IncidentSnapshot>,
        ctx: &AnalysisContext,
        phase_deadline: Instant,
    ) -> TaskJob {
        TaskJob {
            provider: self.registry.get(&spec.provider),
            task,
            snapshot: Arc::clone(snapshot),
            ctx: ctx.clone(),
            timeout: spec.timeout,
            phase_deadline,
            retry: self.retry.clone(),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    async fn run_parallel(
        &self,
        snapshot: &Arc<IncidentSnapshot>,
        ctx: &AnalysisContext,
        phase: &PhaseSpec,
        deadline: Instant,
    ) -> (BTreeMap<ProviderId, AnalysisTask>, bool) {
        let wall_deadline = wall_clock_deadline(phase.deadline);
        let mut outcomes = BTreeMap::new();
        let mut attempts: HashMap<ProviderId, Arc<AtomicU32>> = HashMap::new();
        let mut spawned: HashMap<tokio::task::Id, ProviderId> = HashMap::new();
        let mut set = JoinSet::new();

        for spec in &phase.tasks {
            let task = self.pending_task(spec, snapshot, wall_deadline);
            outcomes.insert(spec.provider.clone(), task.clone());
            let job = self.job(spec, task, snapshot, ctx, deadline);
            attempts.insert(spec.provider.clone(), Arc::clone(&job.attempts));
            let handle = set.spawn(job.run());
            spawned.insert(handle.id(), spec.provider.clone());
        }

        let mut deadline_hit = false;
        loop {
            match tokio::time::timeout_at(deadline, set.join_next_with_id()).await {
                Ok(None) => break,
                Ok(Some(Ok((_, task)))) => {
                    debug!(
                        incident_id = %snapshot.id,
                        provider = %task.provider,
                        outcome = task.outcome.label(),
                        attempts = task.attempts,
                        "Task finished"
                    );
                    outcomes.insert(task.provider.clone(), task);
                }
                Ok(Some(Err(err))) => {
                    if let Some(provider) = spawned.get(&err.id()) {
                        if let Some(task) = outcomes.get_mut(provider) {
                            record_join_error(task, &err, attempts.get(provider));
                        }
                    }
                }
                Err(_) => {
                    deadline_hit = true;
                    break;
                }
            }
        }

        if deadline_hit {
            ctx.cancel.cancel();
            set.abort_all();
            for task in outcomes.values_mut() {
                if !task.outcome.is_terminal() {
                    warn!(
                        incident_id = %snapshot.id,
                        provider = %task.provider,
                        "Task still pending at phase deadline, marking timed out"
                    );
                    task.outcome = TaskOutcome::TimedOut;
                    task.elapsed_ms = phase.deadline.as_millis() as u64;
                    if let Some(counter) = attempts.get(&task.provider) {
                        task.attempts = counter.load(Ordering::SeqCst);
                    }
                }
            }
            let drained = tokio::time::timeout(self.cancellation_grace, async {
                while set.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    incident_id = %snapshot.id,
                    grace_ms = self.cancellation_grace.as_millis() as u64,
                    "Aborted tasks did not wind down within the grace period"
                );
                set.detach_all();
            }
        }

        (outcomes, !deadline_hit)
    }

    async fn run_sequential(
        &self,
        snapshot: &Arc<IncidentSnapshot>,
        ctx: &AnalysisContext,
        phase: &PhaseSpec,
        deadline: Instant,
    ) -> (BTreeMap<ProviderId, AnalysisTask>, bool) {
        let wall_deadline = wall_clock_deadline(phase.deadline);
        let mut outcomes: BTreeMap<ProviderId, AnalysisTask> = phase
            .tasks
            .iter()
            .map(|spec| (spec.provider.clone(), self.pending_task(spec, snapshot, wall_deadline)))
            .collect();

        for spec in &phase.tasks {
            let Some(task) = outcomes.get(&spec.provider).cloned() else {
                continue;
            };
            let job = self.job(spec, task.clone(), snapshot, ctx, deadline);
            let counter = Arc::clone(&job.attempts);
            let mut handle = tokio::spawn(job.run());
            let finished = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(finished)) => finished,
                Ok(Err(err)) => {
                    let mut failed = task;
                    record_join_error(&mut failed, &err, Some(&counter));
                    failed
                }
                Err(_) => {
                    ctx.cancel.cancel();
                    handle.abort();
                    let _ = tokio::time::timeout(self.cancellation_grace, handle).await;
                    let mut timed_out = task;
                    timed_out.outcome = TaskOutcome::TimedOut;
                    timed_out.attempts = counter.load(Ordering::SeqCst);
                    timed_out.elapsed_ms = phase.deadline.as_millis() as u64;
                    timed_out
                }
            };
            let succeeded = finished.outcome.is_success();
            debug!(
                incident_id = %snapshot.id,
                provider = %finished.provider,
                outcome = finished.outcome.label(),
                "Sequential task finished"
            );
            outcomes.insert(finished.provider.clone(), finished);
            if !succeeded {
                warn!(
                    incident_id = %snapshot.id,
                    phase = %phase.name,
                    provider = %spec.provider,
                    "Sequential chain short-circuited"
                );
                return (outcomes, false);
            }
        }
        (outcomes, true)
    }
}

fn wall_clock_deadline(budget: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(budget).unwrap_or_else(|_| chrono::Duration::zero())
}

fn record_join_error(task: &mut AnalysisTask, err: &JoinError, attempts: Option<&Arc<AtomicU32>>) {
    let (kind, message) = if err.is_panic() {
        (FailureKind::Panicked, format!("provider '{}' panicked", task.provider))
    } else {
        (FailureKind::Permanent, format!("provider '{}' task was aborted", task.provider))
    };
    warn!(provider = %task.provider, error = %message, "Task did not complete normally");
    if let Some(counter) = attempts {
        task.attempts = counter.load(Ordering::SeqCst);
    }
    task.outcome = TaskOutcome::Failed {
        error: ErrorDescriptor { kind, message },
    };
}

/// One task plus everything needed to drive it, moved into its own tokio task.
struct TaskJob {
    provider: Option<Arc<dyn AnalysisProvider>>,
    task: AnalysisTask,
    snapshot: Arc<IncidentSnapshot>,
    ctx: AnalysisContext,
    timeout: Duration,
    phase_deadline: Instant,
    retry: RetryPolicy,
    // Shared with the phase so timed-out tasks still report their attempts.
    attempts: Arc<AtomicU32>,
}

impl TaskJob {
    /// Drive the task through its attempts.
    ///
    /// Each attempt is bounded by the per-task timeout; the phase deadline is
    /// enforced by the caller. Retryable failures are resubmitted only while
    /// the backoff still fits before the phase deadline. A per-attempt timeout
    /// is terminal.
    async fn run(self) -> AnalysisTask {
        let TaskJob {
            provider,
            mut task,
            snapshot,
            ctx,
            timeout,
            phase_deadline,
            retry,
            attempts,
        } = self;
        let started = Instant::now();
        let Some(provider) = provider else {
            task.outcome = TaskOutcome::Failed {
                error: ErrorDescriptor {
                    kind: FailureKind::Permanent,
                    message: format!("no provider registered as '{}'", task.provider),
                },
            };
            return task;
        };

        loop {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            task.attempts = attempt;
            let attempt_timeout = Instant::now() + timeout;
            let result = tokio::time::timeout_at(
                attempt_timeout,
                provider.analyze(&snapshot, &ctx, attempt_timeout.min(phase_deadline)),
            )
            .await;

            task.outcome = match result {
                Ok(Ok(finding)) => TaskOutcome::Success { finding },
                Ok(Err(err)) => {
                    if retry.should_retry(&err, attempt) {
                        let delay = retry.backoff(attempt);
                        if Instant::now() + delay < phase_deadline && !ctx.cancel.is_cancelled() {
                            warn!(
                                incident_id = %task.incident_id,
                                provider = %task.provider,
                                attempt,
                                max = retry.max_attempts,
                                backoff_ms = delay.as_millis() as u64,
                                error = %err,
                                "Retrying after transient provider error"
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        debug!(provider = %task.provider, "Backoff would overrun the phase deadline");
                    }
                    let kind = if err.is_retryable() {
                        FailureKind::Transient
                    } else {
                        FailureKind::Permanent
                    };
                    TaskOutcome::Failed {
                        error: ErrorDescriptor {
                            kind,
                            message: err.to_string(),
                        },
                    }
                }
                Err(_) => TaskOutcome::TimedOut,
            };
            break;
        }

        task.elapsed_ms = started.elapsed().as_millis() as u64;
        task
    }
}
