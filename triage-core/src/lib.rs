//! # Triage Core
//!
//! Core library for the Triage incident orchestration engine.
//! Runs analysis providers under a task graph, merges their findings into a
//! unified report, allocates and validates a resource plan, and dispatches
//! alerts, while keeping every incident's status consistent in the store.

pub mod aggregator;
pub mod allocator;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod orchestrator;
pub mod persistence;
pub mod providers;
pub mod store;
pub mod types;
pub mod validator;

// Re-export commonly used types at the crate root.
pub use aggregator::Aggregator;
pub use allocator::Allocator;
pub use config::{TriageConfig, load_config};
pub use dispatcher::{AlertMessage, Audience, Dispatcher, NotificationChannel};
pub use engine::{PhaseMode, PhaseSpec, RetryPolicy, TaskGraph, TaskGraphEngine};
pub use error::{Result, TriageError};
pub use inventory::{CommitOutcome, Depot, InMemoryInventory, InventorySnapshot, ResourceInventory};
pub use orchestrator::{CycleSummary, Orchestrator};
pub use providers::{AnalysisContext, AnalysisProvider, ProviderRegistry};
pub use store::{FileRepository, InMemoryRepository, IncidentRepository, IncidentStore};
pub use types::{
    AllocationPlan, Category, Finding, Incident, IncidentId, IncidentReport, IncidentStatus,
    Location, ProviderId, ProviderKind, ResourceType, Severity, SosMessage, UnifiedReport,
};
pub use validator::{ValidationOutcome, Validator};
