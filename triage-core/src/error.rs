//! Error types for the Triage orchestration core.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering providers, aggregation, allocation, validation, dispatch, storage,
//! configuration and the orchestrator itself.

use crate::types::{GateKind, IncidentStatus};
use std::path::PathBuf;

/// Top-level error type for the Triage core library.
#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Validation rejected: {0}")]
    Validation(#[from] ValidationRejection),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Task graph error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TriageError {
    /// Whether this error is lock or compare-and-swap contention on the store.
    ///
    /// Callers are expected to retry against freshly read state.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            TriageError::Store(StoreError::ConcurrencyConflict { .. })
        )
    }
}

/// Errors raised by analysis providers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider '{provider}' transiently failed: {message}")]
    Transient { provider: String, message: String },

    #[error("Provider '{provider}' permanently failed: {message}")]
    Permanent { provider: String, message: String },
}

impl ProviderError {
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Default retry classification: only transient failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    pub fn provider(&self) -> &str {
        match self {
            ProviderError::Transient { provider, .. } | ProviderError::Permanent { provider, .. } => {
                provider
            }
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::Transient { message, .. } | ProviderError::Permanent { message, .. } => {
                message
            }
        }
    }
}

/// Errors from the external data sources wrapped by providers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("Source temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Source rejected the request: {0}")]
    Rejected(String),
}

impl SourceError {
    /// Classify this source failure on behalf of a provider.
    pub fn into_provider_error(self, provider: &str) -> ProviderError {
        match self {
            SourceError::Unavailable(message) => ProviderError::transient(provider, message),
            SourceError::Rejected(message) => ProviderError::permanent(provider, message),
        }
    }
}

/// Errors from merging provider outcomes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationError {
    #[error("Quorum not met: needed {required} of [{candidates}], got {succeeded}")]
    QuorumNotMet {
        candidates: String,
        required: usize,
        succeeded: usize,
    },

    #[error("No successful provider produced a severity estimate")]
    MissingSeverity,
}

/// Kind of allocation infeasibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationErrorKind {
    InsufficientInventory,
    NoViableRoute,
}

impl std::fmt::Display for AllocationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationErrorKind::InsufficientInventory => write!(f, "insufficient_inventory"),
            AllocationErrorKind::NoViableRoute => write!(f, "no_viable_route"),
        }
    }
}

/// The allocator could not assign anything at all.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AllocationError {
    pub kind: AllocationErrorKind,
    pub message: String,
}

impl AllocationError {
    pub fn new(kind: AllocationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A named validation gate refused the plan.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("gate '{gate}' failed: {reason}")]
pub struct ValidationRejection {
    pub gate: GateKind,
    pub reason: String,
}

/// Per-channel notification failures. Never fatal to the other channels.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Channel '{channel}' failed to deliver: {message}")]
    ChannelFailed { channel: String, message: String },

    #[error("Channel '{channel}' timed out after {timeout_ms}ms")]
    Timeout { channel: String, timeout_ms: u64 },
}

/// Errors from the resource inventory collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InventoryError {
    #[error("Inventory unavailable: {message}")]
    Unavailable { message: String },

    #[error("Inventory call '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
}

/// Errors from the incident store and its persistence backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Concurrency conflict on incident {id}: {detail}")]
    ConcurrencyConflict { id: String, detail: String },

    #[error("Incident not found: {id}")]
    NotFound { id: String },

    #[error("Incident already exists: {id}")]
    AlreadyExists { id: String },

    #[error("Storage backend error: {message}")]
    Backend { message: String },
}

/// Errors from building or validating a task graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Duplicate phase name: {phase}")]
    DuplicatePhase { phase: String },

    #[error("Phase '{phase}' depends on unknown phase '{dependency}'")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Provider '{provider}' is scheduled in more than one phase")]
    DuplicateProvider { provider: String },

    #[error("Phase dependency cycle detected at '{phase}'")]
    CyclicDependency { phase: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the orchestrator driving an incident.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },

    #[error("Incident {id} cannot start a cycle from status {status}")]
    NotRunnable { id: String, status: IncidentStatus },

    #[error("Incident {id} is not terminal (status {status}) and cannot be archived")]
    NotTerminal { id: String, status: IncidentStatus },

    #[error("Unknown incident category: {value}")]
    UnknownCategory { value: String },
}

/// A type alias for results using the top-level `TriageError`.
pub type Result<T> = std::result::Result<T, TriageError>;
