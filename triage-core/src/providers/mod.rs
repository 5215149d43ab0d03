//! Analysis providers: pluggable units that turn an incident snapshot into a
//! typed [`Finding`].
//!
//! Providers are registered in a [`ProviderRegistry`] keyed by provider id and
//! dispatched through the task graph engine. Each call receives an explicit
//! [`AnalysisContext`] scoped to one orchestration cycle.

pub mod imagery;
pub mod sos;
pub mod weather;

use crate::error::ProviderError;
use crate::types::{Finding, IncidentSnapshot, ProviderId, ProviderKind, UnifiedReport};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use imagery::{FireDetection, ImageryProvider, ImagerySource, TerrainProfile};
pub use sos::{SosFeed, SosProvider};
pub use weather::{WeatherObservation, WeatherProvider, WeatherSource};

/// Per-cycle context handed to every provider call.
///
/// Replaces any ambient session state: whatever a provider needs to know
/// about the cycle travels here and is dropped when the cycle ends.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub cycle: u64,
    pub cycle_id: Uuid,
    /// Cancelled when the enclosing phase hits its deadline.
    pub cancel: CancellationToken,
    /// Report from the previous cycle, if the incident is being re-analyzed.
    pub prior_report: Option<Arc<UnifiedReport>>,
}

impl AnalysisContext {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            cycle_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            prior_report: None,
        }
    }

    pub fn with_prior_report(mut self, report: Option<UnifiedReport>) -> Self {
        self.prior_report = report.map(Arc::new);
        self
    }

    /// Same cycle, with a child token that can be cancelled independently.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }
}

/// Contract every analysis provider satisfies.
///
/// Calls must be stateless and safe to retry. Errors are classified through
/// [`ProviderError`]: only transient failures are retried by the engine.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Registry key, e.g. `weather`.
    fn id(&self) -> ProviderId;

    fn kind(&self) -> ProviderKind;

    async fn analyze(
        &self,
        snapshot: &IncidentSnapshot,
        ctx: &AnalysisContext,
        deadline: Instant,
    ) -> Result<Finding, ProviderError>;
}

/// Registry of providers keyed by id.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderId, Arc<dyn AnalysisProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any provider with the same id.
    pub fn register(&mut self, provider: Arc<dyn AnalysisProvider>) {
        self.providers.insert(provider.id(), provider);
    }

    pub fn get(&self, id: &ProviderId) -> Option<Arc<dyn AnalysisProvider>> {
        self.providers.get(id).cloned()
    }

    pub fn kind_of(&self, id: &ProviderId) -> Option<ProviderKind> {
        self.providers.get(id).map(|p| p.kind())
    }

    pub fn ids(&self) -> impl Iterator<Item = &ProviderId> {
        self.providers.keys()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Wait for `fut` unless the context is cancelled first.
pub(crate) async fn unless_cancelled<T>(
    ctx: &AnalysisContext,
    provider: &str,
    fut: impl std::future::Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(ProviderError::transient(provider, "cancelled at phase deadline")),
        result = fut => result,
    }
}
