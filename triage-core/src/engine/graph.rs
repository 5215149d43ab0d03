//! Phase dependency graph.
//!
//! Uses petgraph's DiGraph to order phases; edges run from a dependency to
//! the phase that waits on it.

use super::{PhaseMode, PhaseResult, PhaseSpec, TaskGraphEngine};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::providers::AnalysisContext;
use crate::types::{AnalysisTask, IncidentSnapshot, ProviderId};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Validated set of phases with a fixed execution order.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    phases: Vec<PhaseSpec>,
    order: Vec<usize>,
}

impl TaskGraph {
    /// Validate phases and compute their topological order.
    pub fn new(phases: Vec<PhaseSpec>) -> Result<Self, EngineError> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut name_to_node: HashMap<&str, NodeIndex> = HashMap::new();
        let mut providers = HashSet::new();

        for (idx, phase) in phases.iter().enumerate() {
            if name_to_node.contains_key(phase.name.as_str()) {
                return Err(EngineError::DuplicatePhase {
                    phase: phase.name.clone(),
                });
            }
            for task in &phase.tasks {
                if !providers.insert(task.provider.clone()) {
                    return Err(EngineError::DuplicateProvider {
                        provider: task.provider.to_string(),
                    });
                }
            }
            name_to_node.insert(phase.name.as_str(), graph.add_node(idx));
        }

        for phase in &phases {
            let to = name_to_node[phase.name.as_str()];
            for dep in &phase.depends_on {
                let from = name_to_node.get(dep.as_str()).copied().ok_or_else(|| {
                    EngineError::UnknownDependency {
                        phase: phase.name.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                graph.add_edge(from, to, ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| EngineError::CyclicDependency {
            phase: phases[graph[cycle.node_id()]].name.clone(),
        })?;
        let order = sorted.into_iter().map(|node| graph[node]).collect();
        Ok(Self { phases, order })
    }

    /// Build the graph declared in configuration.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let phases = config
            .phases
            .iter()
            .map(|p| {
                let deadline = Duration::from_millis(p.deadline_ms.unwrap_or(config.phase_deadline_ms));
                let timeout =
                    Duration::from_millis(p.task_timeout_ms.unwrap_or(config.task_timeout_ms));
                let mut spec = PhaseSpec::new(p.name.clone(), p.mode, deadline);
                for provider in &p.providers {
                    spec = spec.task(provider.clone(), timeout);
                }
                spec.depends_on = p.depends_on.clone();
                spec
            })
            .collect();
        Self::new(phases)
    }

    /// A single parallel phase over `providers`.
    pub fn single_parallel(
        name: &str,
        providers: &[&str],
        deadline: Duration,
        task_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let mut phase = PhaseSpec::new(name, PhaseMode::Parallel, deadline);
        for provider in providers {
            phase = phase.task(*provider, task_timeout);
        }
        Self::new(vec![phase])
    }

    /// Phases in execution order.
    pub fn ordered(&self) -> impl Iterator<Item = &PhaseSpec> {
        self.order.iter().map(|&idx| &self.phases[idx])
    }

    /// Every provider scheduled anywhere in the graph.
    pub fn providers(&self) -> impl Iterator<Item = &ProviderId> {
        self.phases
            .iter()
            .flat_map(|p| p.tasks.iter().map(|t| &t.provider))
    }

    /// Upper bound on wall-clock time for a full run.
    pub fn total_deadline(&self) -> Duration {
        self.phases.iter().map(|p| p.deadline).sum()
    }
}

/// Results of every phase of a graph run, in execution order.
#[derive(Debug, Clone, Default)]
pub struct GraphResult {
    pub phases: Vec<PhaseResult>,
}

impl GraphResult {
    /// All task outcomes across phases.
    pub fn outcomes(&self) -> BTreeMap<ProviderId, AnalysisTask> {
        self.phases
            .iter()
            .flat_map(|p| p.outcomes.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    pub fn complete(&self) -> bool {
        self.phases.iter().all(|p| p.complete)
    }

    /// Whether a sequential chain was broken somewhere in the run.
    pub fn chain_broken(&self) -> Option<&PhaseResult> {
        self.phases
            .iter()
            .find(|p| p.mode == PhaseMode::Sequential && !p.complete && !p.skipped)
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == name)
    }
}

impl TaskGraphEngine {
    /// Run every phase in dependency order.
    ///
    /// A phase whose dependency ended blocking is not dispatched; its tasks
    /// are reported as `pending` and the phase is flagged skipped.
    pub async fn run_graph(
        &self,
        graph: &TaskGraph,
        snapshot: Arc<IncidentSnapshot>,
        ctx: &AnalysisContext,
    ) -> GraphResult {
        let mut result = GraphResult::default();
        let mut blocking: HashSet<&str> = HashSet::new();

        for phase in graph.ordered() {
            let blocked_by = phase
                .depends_on
                .iter()
                .find(|dep| blocking.contains(dep.as_str()));
            let phase_result = match blocked_by {
                Some(dep) => {
                    warn!(
                        incident_id = %snapshot.id,
                        phase = %phase.name,
                        dependency = %dep,
                        "Skipping phase blocked by its dependency"
                    );
                    self.skipped_phase(&snapshot, phase)
                }
                None => self.run_phase(Arc::clone(&snapshot), ctx, phase).await,
            };
            if phase_result.is_blocking() {
                blocking.insert(phase.name.as_str());
            }
            result.phases.push(phase_result);
        }
        result
    }
}
