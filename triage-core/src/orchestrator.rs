//! Orchestrator: drives an incident through one cycle of the pipeline.
//!
//! `analyzing -> aggregated -> allocating -> validating -> notifying -> monitoring`
//!
//! Every stage is checkpointed to the store. A cycle-fatal error moves the
//! incident to `failed` with a structured cause, so the store always holds
//! a terminal record for the cycle that just ran. Stage failures are not
//! returned as errors; they are visible on the incident and the summary.
//! A cycle cut short by a store error is failed at its last checkpoint
//! before the error is returned. One that was dropped mid-flight is found
//! by the next `run_cycle` and failed as `interrupted`.

use crate::aggregator::Aggregator;
use crate::allocator::Allocator;
use crate::config::{OrchestratorConfig, TriageConfig};
use crate::dispatcher::Dispatcher;
use crate::engine::{RetryPolicy, TaskGraph, TaskGraphEngine};
use crate::error::{InventoryError, OrchestrationError, Result, TriageError};
use crate::inventory::{CommitOutcome, InventorySnapshot, ResourceInventory};
use crate::providers::{AnalysisContext, ProviderRegistry};
use crate::store::IncidentStore;
use crate::types::{
    AllocationPlan, DeliveryStatus, FailureCause, Incident, IncidentId, IncidentReport,
    IncidentStatus, Severity, SosMessage, Stage, UnifiedReport,
};
use crate::validator::{ValidationContext, Validator};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What a finished cycle left behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub incident_id: IncidentId,
    pub cycle: u64,
    pub status: IncidentStatus,
    pub severity: Option<Severity>,
    pub partial_plan: bool,
    pub delivery: Option<DeliveryStatus>,
    pub failure: Option<FailureCause>,
}

impl CycleSummary {
    fn of(incident: &Incident) -> Self {
        Self {
            incident_id: incident.id.clone(),
            cycle: incident.cycle,
            status: incident.status,
            severity: incident.severity,
            partial_plan: incident.plan.as_ref().is_some_and(|p| p.partial),
            delivery: incident.notification.as_ref().map(|n| n.status),
            failure: incident.failure.clone(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == IncidentStatus::Monitoring
    }
}

/// An approved and committed plan.
struct Committed {
    plan: AllocationPlan,
    version: u64,
}

pub struct Orchestrator {
    store: Arc<IncidentStore>,
    engine: TaskGraphEngine,
    graph: TaskGraph,
    aggregator: Aggregator,
    allocator: Allocator,
    validator: Validator,
    dispatcher: Dispatcher,
    inventory: Arc<dyn ResourceInventory>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Wire up an orchestrator from validated configuration.
    pub fn new(
        config: &TriageConfig,
        store: Arc<IncidentStore>,
        registry: ProviderRegistry,
        inventory: Arc<dyn ResourceInventory>,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        config.validate()?;
        let graph = TaskGraph::from_config(&config.engine)?;
        for provider in graph.providers() {
            if registry.get(provider).is_none() {
                warn!(provider = %provider, "Scheduled provider is not registered, its tasks will fail");
            }
        }
        let engine = TaskGraphEngine::new(
            registry,
            RetryPolicy::from_config(&config.engine.retry),
            config.engine.cancellation_grace(),
        );
        Ok(Self {
            store,
            engine,
            graph,
            aggregator: Aggregator::new(config.aggregation.clone()),
            allocator: Allocator::new(config.allocation.clone()),
            validator: Validator::new(config.validation.clone()),
            dispatcher,
            inventory,
            config: config.orchestrator.clone(),
        })
    }

    /// Replace the configured task graph.
    pub fn with_graph(mut self, graph: TaskGraph) -> Self {
        self.graph = graph;
        self
    }

    /// Replace the engine's retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.engine = TaskGraphEngine::new(
            self.engine.registry().clone(),
            retry,
            self.engine.cancellation_grace(),
        );
        self
    }

    pub fn store(&self) -> &Arc<IncidentStore> {
        &self.store
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Register a newly reported incident in `created`.
    pub async fn report_incident(&self, report: IncidentReport) -> Result<Incident> {
        let mut incident = Incident::from_report(report);
        incident.register_providers(self.graph.providers());
        self.store.create(incident).await
    }

    pub async fn incident(&self, id: &IncidentId) -> Result<Incident> {
        self.store.get(id).await
    }

    /// Append an incoming signal.
    ///
    /// Returns whether the incident is waiting for a cycle to pick it up
    /// (`created`, or `monitoring` and thus due for re-analysis).
    pub async fn submit_signal(&self, id: &IncidentId, signal: SosMessage) -> Result<bool> {
        let _lease = self.store.acquire(id).await?;
        let incident = self
            .store
            .update(id, |incident| {
                if incident.is_terminal() {
                    return Err(OrchestrationError::NotRunnable {
                        id: incident.id.to_string(),
                        status: incident.status,
                    }
                    .into());
                }
                if !incident.signals.iter().any(|s| s.id == signal.id) {
                    incident.signals.push(signal.clone());
                }
                Ok(())
            })
            .await?;
        let awaiting = incident.status.is_runnable();
        info!(
            incident_id = %id,
            signals = incident.signals.len(),
            status = %incident.status,
            awaiting_cycle = awaiting,
            "Signal received"
        );
        Ok(awaiting)
    }

    /// Operator action: close the incident.
    pub async fn resolve(&self, id: &IncidentId) -> Result<Incident> {
        let _lease = self.store.acquire(id).await?;
        let incident = self
            .store
            .update(id, |incident| {
                incident.transition(IncidentStatus::Resolved, Some("resolved by operator".into()))?;
                Ok(())
            })
            .await?;
        info!(incident_id = %id, cycle = incident.cycle, "Incident resolved");
        Ok(incident)
    }

    /// Remove a terminal incident from the store.
    pub async fn archive(&self, id: &IncidentId) -> Result<Incident> {
        self.store.archive(id).await
    }

    /// Run one orchestration cycle.
    ///
    /// Holds the incident's lease for the whole cycle. A second caller for
    /// the same incident gets a `ConcurrencyConflict` straight away and
    /// should retry against fresh state.
    pub async fn run_cycle(&self, id: &IncidentId) -> Result<CycleSummary> {
        let _lease = self.store.try_acquire(id)?;
        let mut incident = self.store.get(id).await?;
        if let Some(stage) = incident.status.cycle_stage() {
            // Nobody holds the lease, so the cycle that wrote this status is gone.
            let message = format!(
                "cycle {} stopped during {stage} without recording an outcome",
                incident.cycle
            );
            warn!(incident_id = %id, cycle = incident.cycle, stage = %stage, "Recovering abandoned cycle");
            incident.fail(Stage::Interrupted, message)?;
            self.store.save(&mut incident).await?;
        }
        if !incident.status.is_runnable() {
            return Err(OrchestrationError::NotRunnable {
                id: id.to_string(),
                status: incident.status,
            }
            .into());
        }

        let retrigger = incident.status == IncidentStatus::Monitoring;
        incident.cycle += 1;
        incident.plan = None;
        incident.notification = None;
        incident.register_providers(self.graph.providers());
        let note = retrigger.then(|| "re-analysis on new signals".to_string());
        incident.transition(IncidentStatus::Analyzing, note)?;
        self.store.save(&mut incident).await?;
        info!(incident_id = %id, cycle = incident.cycle, retrigger, "Orchestration cycle started");

        if let Err(e) = self.drive(&mut incident).await {
            self.record_aborted(id, &e).await;
            return Err(e);
        }

        let summary = CycleSummary::of(&incident);
        match &summary.failure {
            Some(cause) if summary.status == IncidentStatus::Failed => warn!(
                incident_id = %id,
                cycle = summary.cycle,
                stage = %cause.stage,
                error = %cause.message,
                "Orchestration cycle failed"
            ),
            _ => info!(
                incident_id = %id,
                cycle = summary.cycle,
                status = %summary.status,
                severity = ?summary.severity,
                "Orchestration cycle finished"
            ),
        }
        Ok(summary)
    }

    /// Stages after `analyzing`. Returns early, with the incident failed and
    /// saved, on the first cycle-fatal error.
    async fn drive(&self, incident: &mut Incident) -> Result<()> {
        // Analysis
        let ctx = AnalysisContext::new(incident.cycle).with_prior_report(incident.report.clone());
        let snapshot = Arc::new(incident.snapshot());
        let result = self.engine.run_graph(&self.graph, snapshot, &ctx).await;
        ctx.cancel.cancel();

        let outcomes = result.outcomes();
        for task in outcomes.values() {
            incident.record_provider_result(incident.cycle, task.clone());
        }
        if let Some(phase) = result.chain_broken() {
            let message = format!("sequential phase '{}' was broken by a failed predecessor", phase.phase);
            return self.fail(incident, Stage::Analysis, message).await;
        }

        // Aggregation
        let report = match self.aggregator.aggregate(incident, &outcomes) {
            Ok(report) => report,
            Err(e) => return self.fail(incident, Stage::Aggregation, e.to_string()).await,
        };
        incident.severity = Some(report.severity);
        incident.report = Some(report.clone());
        self.advance(incident, IncidentStatus::Aggregated).await?;

        // Allocation
        self.advance(incident, IncidentStatus::Allocating).await?;
        let inventory = match self.inventory_snapshot().await {
            Ok(s) => s,
            Err(e) => return self.fail(incident, Stage::Allocation, e.to_string()).await,
        };
        let plan = match self.allocator.allocate(&report, &inventory) {
            Ok(plan) => plan,
            Err(e) => return self.fail(incident, Stage::Allocation, e.to_string()).await,
        };
        incident.plan = Some(plan.clone());

        // Validation and commit
        self.advance(incident, IncidentStatus::Validating).await?;
        let committed = match self.validate_and_commit(&report, plan).await {
            Ok(committed) => committed,
            Err((stage, message)) => return self.fail(incident, stage, message).await,
        };
        debug!(
            incident_id = %incident.id,
            inventory_version = committed.version,
            "Plan committed"
        );
        incident.plan = Some(committed.plan);

        // Notification
        self.advance(incident, IncidentStatus::Notifying).await?;
        let Some(plan) = incident.plan.clone() else {
            return self.fail(incident, Stage::Notification, "no committed plan").await;
        };
        let record = self.dispatcher.dispatch(&plan, incident).await;
        let status = record.status;
        let failed_channels: Vec<String> = record
            .deliveries
            .iter()
            .filter(|d| !d.delivered)
            .map(|d| d.channel.clone())
            .collect();
        incident.notification = Some(record);
        if status == DeliveryStatus::None && self.dispatcher.channel_count() > 0 {
            let message = format!("delivery failed on every channel: {}", failed_channels.join(", "));
            return self.fail(incident, Stage::Notification, message).await;
        }
        if self.dispatcher.channel_count() == 0 {
            warn!(incident_id = %incident.id, "No notification channels registered");
        }
        self.advance(incident, IncidentStatus::Monitoring).await
    }

    /// Validate against a fresh inventory read and commit, re-allocating on
    /// commit conflicts up to the configured ceiling.
    async fn validate_and_commit(
        &self,
        report: &UnifiedReport,
        mut plan: AllocationPlan,
    ) -> std::result::Result<Committed, (Stage, String)> {
        let attempts = self.config.max_commit_attempts.max(1);
        let mut last_conflict = String::new();

        for attempt in 1..=attempts {
            let fresh = self
                .inventory_snapshot()
                .await
                .map_err(|e| (Stage::Validation, e.to_string()))?;
            if attempt > 1 {
                plan = self
                    .allocator
                    .allocate(report, &fresh)
                    .map_err(|e| (Stage::Allocation, e.to_string()))?;
            } else if fresh.version != plan.inventory_version {
                debug!(
                    incident_id = %report.incident_id,
                    plan_version = plan.inventory_version,
                    current = fresh.version,
                    "Inventory moved since allocation"
                );
            }

            let outcome = self.validator.validate(
                &plan,
                ValidationContext {
                    inventory: &fresh,
                    report,
                },
            );
            if let Some(rejection) = outcome.rejection() {
                return Err((Stage::Validation, rejection.to_string()));
            }

            let commit = self
                .bounded("commit", self.inventory.commit(&plan))
                .await
                .map_err(|e| (Stage::Commit, e.to_string()))?;
            match commit {
                CommitOutcome::Committed { version } => return Ok(Committed { plan, version }),
                CommitOutcome::Conflict { reason } => {
                    warn!(
                        incident_id = %report.incident_id,
                        attempt,
                        max = attempts,
                        reason = %reason,
                        "Inventory commit conflict, re-allocating"
                    );
                    last_conflict = reason;
                }
            }
        }
        Err((
            Stage::Commit,
            format!("commit conflicted {attempts} times, last: {last_conflict}"),
        ))
    }

    async fn inventory_snapshot(&self) -> std::result::Result<InventorySnapshot, InventoryError> {
        self.bounded("snapshot", self.inventory.snapshot()).await
    }

    /// Bound a collaborator call by the configured timeout.
    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = std::result::Result<T, InventoryError>>,
    ) -> std::result::Result<T, InventoryError> {
        let limit: Duration = self.config.collaborator_timeout();
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| {
                Err(InventoryError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })
            })
    }

    async fn advance(&self, incident: &mut Incident, to: IncidentStatus) -> Result<()> {
        incident.transition(to, None)?;
        self.store.save(incident).await?;
        info!(incident_id = %incident.id, cycle = incident.cycle, status = %to, "Stage reached");
        Ok(())
    }

    /// Best-effort `failed` record for a cycle cut short by an error, based
    /// on the last checkpoint that reached the store.
    async fn record_aborted(&self, id: &IncidentId, error: &TriageError) {
        let mut incident = match self.store.get(id).await {
            Ok(incident) => incident,
            Err(e) => {
                error!(incident_id = %id, error = %e, "Cannot read incident to record aborted cycle");
                return;
            }
        };
        let Some(stage) = incident.status.cycle_stage() else {
            return;
        };
        let recorded = match incident.fail(stage, error.to_string()) {
            Ok(()) => self.store.save(&mut incident).await.map_err(TriageError::from),
            Err(e) => Err(e.into()),
        };
        match recorded {
            Ok(()) => warn!(
                incident_id = %id,
                cycle = incident.cycle,
                stage = %stage,
                error = %error,
                "Orchestration cycle aborted"
            ),
            Err(e) => error!(
                incident_id = %id,
                stage = %stage,
                error = %e,
                "Failed to record aborted cycle, next cycle will mark it interrupted"
            ),
        }
    }

    async fn fail(&self, incident: &mut Incident, stage: Stage, message: impl Into<String>) -> Result<()> {
        incident.fail(stage, message)?;
        self.store.save(incident).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NotificationConfig, RequirementRule};
    use crate::dispatcher::{AlertMessage, Audience, NotificationChannel};
    use crate::engine::tests::{ScriptedProvider, Step};
    use crate::error::{DispatchError, StoreError};
    use crate::inventory::{Depot, InMemoryInventory};
    use crate::store::{InMemoryRepository, IncidentRepository};
    use std::sync::atomic::{AtomicU32, Ordering};
    use crate::types::{AudienceKind, Category, Location, ProviderKind, ResourceType};
    use async_trait::async_trait;

    struct Always(bool);

    /// Repository whose n-th write fails once.
    struct FailingWrite {
        inner: InMemoryRepository,
        writes: AtomicU32,
        fail_on: u32,
    }

    #[async_trait]
    impl IncidentRepository for FailingWrite {
        async fn get(&self, id: &IncidentId) -> std::result::Result<Option<Incident>, StoreError> {
            self.inner.get(id).await
        }

        async fn put(
            &self,
            incident: &Incident,
            expected_version: Option<u64>,
        ) -> std::result::Result<(), StoreError> {
            if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(StoreError::Backend {
                    message: "disk full".into(),
                });
            }
            self.inner.put(incident, expected_version).await
        }

        async fn list(&self) -> std::result::Result<Vec<IncidentId>, StoreError> {
            self.inner.list().await
        }

        async fn delete(&self, id: &IncidentId) -> std::result::Result<bool, StoreError> {
            self.inner.delete(id).await
        }
    }

    #[async_trait]
    impl NotificationChannel for Always {
        fn name(&self) -> &str {
            if self.0 { "ok" } else { "down" }
        }

        async fn send(&self, _m: &AlertMessage, _a: &Audience) -> std::result::Result<String, DispatchError> {
            if self.0 {
                Ok("r-1".into())
            } else {
                Err(DispatchError::ChannelFailed {
                    channel: "down".into(),
                    message: "unreachable".into(),
                })
            }
        }
    }

    fn config() -> TriageConfig {
        let mut config = TriageConfig::default();
        config.engine.phase_deadline_ms = 1_000;
        config.engine.task_timeout_ms = 500;
        config.engine.retry.initial_backoff_ms = 5;
        config.aggregation.quorum = Vec::new();
        config.allocation.base_requirements = vec![RequirementRule {
            category: Category::Fire,
            resource: ResourceType::FireEngine,
            base: 2,
        }];
        config.notification = NotificationConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            send_timeout_ms: 100,
            evacuation_buffer_km: 2.0,
        };
        config
    }

    fn registry(weather: Vec<Step>, imagery: Vec<Step>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(ScriptedProvider::new("weather", ProviderKind::Weather, weather));
        registry.register(ScriptedProvider::new("imagery", ProviderKind::Imagery, imagery));
        registry
    }

    fn orchestrator(registry: ProviderRegistry, engines: u32, channel_ok: bool) -> Orchestrator {
        orchestrator_on(IncidentStore::in_memory(), registry, engines, channel_ok)
    }

    fn orchestrator_on(
        store: IncidentStore,
        registry: ProviderRegistry,
        engines: u32,
        channel_ok: bool,
    ) -> Orchestrator {
        let inventory = InMemoryInventory::new(vec![
            Depot::new("north", Location::new(34.1, -118.2)).with_stock(ResourceType::FireEngine, engines),
        ]);
        let mut dispatcher = Dispatcher::new(config().notification);
        dispatcher.register(Arc::new(Always(channel_ok)), Audience::new(AudienceKind::Responders));
        let graph = TaskGraph::single_parallel(
            "assessment",
            &["weather", "imagery"],
            Duration::from_secs(1),
            Duration::from_millis(500),
        )
        .unwrap();
        Orchestrator::new(
            &config(),
            Arc::new(store),
            registry,
            Arc::new(inventory),
            dispatcher,
        )
        .unwrap()
        .with_graph(graph)
    }

    fn fire() -> IncidentReport {
        IncidentReport {
            category: Category::Fire,
            location: Location::new(34.05, -118.24),
            description: None,
            signals: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_cycle_reaches_monitoring() {
        let orch = orchestrator(
            registry(vec![Step::Ok(Severity::High)], vec![Step::Ok(Severity::Critical)]),
            10,
            true,
        );
        let incident = orch.report_incident(fire()).await.unwrap();
        let summary = orch.run_cycle(&incident.id).await.unwrap();
        assert!(summary.succeeded(), "{summary:?}");
        assert_eq!(summary.severity, Some(Severity::Critical));
        assert_eq!(summary.delivery, Some(DeliveryStatus::Full));

        let stored = orch.incident(&incident.id).await.unwrap();
        assert_eq!(stored.status, IncidentStatus::Monitoring);
        assert!(stored.plan.is_some());
        let path: Vec<IncidentStatus> = stored.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![
                IncidentStatus::Analyzing,
                IncidentStatus::Aggregated,
                IncidentStatus::Allocating,
                IncidentStatus::Validating,
                IncidentStatus::Notifying,
                IncidentStatus::Monitoring,
            ]
        );
    }

    #[tokio::test]
    async fn test_no_successful_provider_fails_aggregation() {
        let orch = orchestrator(registry(vec![Step::Permanent], vec![Step::Permanent]), 10, true);
        let incident = orch.report_incident(fire()).await.unwrap();
        let summary = orch.run_cycle(&incident.id).await.unwrap();
        assert_eq!(summary.status, IncidentStatus::Failed);
        assert_eq!(summary.failure.unwrap().stage, Stage::Aggregation);
    }

    #[tokio::test]
    async fn test_partial_plan_rejected_by_default() {
        let orch = orchestrator(
            registry(vec![Step::Ok(Severity::Medium)], vec![Step::Ok(Severity::Medium)]),
            1,
            true,
        );
        let incident = orch.report_incident(fire()).await.unwrap();
        let summary = orch.run_cycle(&incident.id).await.unwrap();
        assert_eq!(summary.status, IncidentStatus::Failed);
        assert!(summary.partial_plan);
        let cause = summary.failure.unwrap();
        assert_eq!(cause.stage, Stage::Validation);
        assert!(cause.message.contains("inventory_availability"), "{}", cause.message);
    }

    #[tokio::test]
    async fn test_all_channels_down_fails_notification() {
        let orch = orchestrator(
            registry(vec![Step::Ok(Severity::Medium)], vec![Step::Ok(Severity::Medium)]),
            10,
            false,
        );
        let incident = orch.report_incident(fire()).await.unwrap();
        let summary = orch.run_cycle(&incident.id).await.unwrap();
        assert_eq!(summary.status, IncidentStatus::Failed);
        assert_eq!(summary.delivery, Some(DeliveryStatus::None));
        assert_eq!(summary.failure.unwrap().stage, Stage::Notification);
    }

    #[tokio::test]
    async fn test_terminal_incident_is_not_runnable() {
        let orch = orchestrator(
            registry(vec![Step::Ok(Severity::Low)], vec![Step::Ok(Severity::Low)]),
            10,
            true,
        );
        let incident = orch.report_incident(fire()).await.unwrap();
        orch.resolve(&incident.id).await.unwrap();
        let err = orch.run_cycle(&incident.id).await.unwrap_err();
        assert!(matches!(
            err,
            TriageError::Orchestration(OrchestrationError::NotRunnable { .. })
        ));
    }

    #[tokio::test]
    async fn test_signal_retriggers_monitoring_incident() {
        let orch = orchestrator(
            registry(
                vec![Step::Ok(Severity::Medium), Step::Ok(Severity::High)],
                vec![Step::Ok(Severity::Medium), Step::Ok(Severity::High)],
            ),
            20,
            true,
        );
        let incident = orch.report_incident(fire()).await.unwrap();
        orch.run_cycle(&incident.id).await.unwrap();
        let sos = SosMessage::new("help, trapped", Location::new(34.05, -118.24), "sms");
        assert!(orch.submit_signal(&incident.id, sos).await.unwrap());

        let summary = orch.run_cycle(&incident.id).await.unwrap();
        assert_eq!(summary.cycle, 2);
        assert!(summary.succeeded());
        let stored = orch.incident(&incident.id).await.unwrap();
        assert_eq!(stored.signals.len(), 1);
        assert!(stored.provider_results.values().flatten().all(|r| r.cycle == 2));
    }

    #[tokio::test]
    async fn test_dropped_cycle_is_recorded_as_interrupted() {
        let orch = orchestrator(
            registry(
                vec![Step::Sleep(Duration::from_millis(400))],
                vec![Step::Ok(Severity::High)],
            ),
            10,
            true,
        );
        let incident = orch.report_incident(fire()).await.unwrap();
        let dropped = tokio::time::timeout(Duration::from_millis(50), orch.run_cycle(&incident.id)).await;
        assert!(dropped.is_err());
        assert_eq!(
            orch.incident(&incident.id).await.unwrap().status,
            IncidentStatus::Analyzing
        );

        let err = orch.run_cycle(&incident.id).await.unwrap_err();
        assert!(matches!(
            err,
            TriageError::Orchestration(OrchestrationError::NotRunnable {
                status: IncidentStatus::Failed,
                ..
            })
        ));
        let stored = orch.incident(&incident.id).await.unwrap();
        assert_eq!(stored.status, IncidentStatus::Failed);
        let cause = stored.failure.unwrap();
        assert_eq!(cause.stage, Stage::Interrupted);
        assert_eq!(cause.cycle, 1);
        assert!(cause.message.contains("analysis"), "{}", cause.message);
    }

    #[tokio::test]
    async fn test_store_error_mid_cycle_still_fails_incident() {
        // writes: create, analyzing, then the aggregated checkpoint fails
        let store = IncidentStore::new(
            Arc::new(FailingWrite {
                inner: InMemoryRepository::new(),
                writes: AtomicU32::new(0),
                fail_on: 3,
            }),
            3,
        );
        let orch = orchestrator_on(
            store,
            registry(vec![Step::Ok(Severity::High)], vec![Step::Ok(Severity::High)]),
            10,
            true,
        );
        let incident = orch.report_incident(fire()).await.unwrap();
        let err = orch.run_cycle(&incident.id).await.unwrap_err();
        assert!(matches!(err, TriageError::Store(StoreError::Backend { .. })));

        let stored = orch.incident(&incident.id).await.unwrap();
        assert_eq!(stored.status, IncidentStatus::Failed);
        let cause = stored.failure.unwrap();
        assert_eq!(cause.stage, Stage::Analysis);
        assert!(cause.message.contains("disk full"), "{}", cause.message);
    }

    #[tokio::test]
    async fn test_archive_requires_terminal() {
        let orch = orchestrator(registry(Vec::new(), Vec::new()), 10, true);
        let incident = orch.report_incident(fire()).await.unwrap();
        assert!(orch.archive(&incident.id).await.is_err());
        orch.resolve(&incident.id).await.unwrap();
        orch.archive(&incident.id).await.unwrap();
        assert!(orch.incident(&incident.id).await.is_err());
    }
}
