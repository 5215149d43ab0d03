//! Configuration system for Triage.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/triage/config.toml` and/or `.triage/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::PhaseMode;
use crate::error::ConfigError;
use crate::providers::imagery::ImageryConfig;
use crate::providers::sos::SosConfig;
use crate::types::{Category, ProviderKind, ReportField, ResourceType};

/// Top-level configuration for the orchestration engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriageConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Task graph engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default deadline for one phase, in milliseconds.
    pub phase_deadline_ms: u64,
    /// Default timeout for one provider attempt, in milliseconds.
    pub task_timeout_ms: u64,
    /// How long aborted tasks may take to wind down after a phase deadline.
    pub cancellation_grace_ms: u64,
    pub retry: RetryConfig,
    /// Analysis phases, in declaration order.
    pub phases: Vec<PhaseConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            phase_deadline_ms: 30_000,
            task_timeout_ms: 10_000,
            cancellation_grace_ms: 250,
            retry: RetryConfig::default(),
            phases: vec![PhaseConfig {
                name: "assessment".to_string(),
                mode: PhaseMode::Parallel,
                providers: vec!["sos".into(), "weather".into(), "imagery".into()],
                deadline_ms: None,
                task_timeout_ms: None,
                depends_on: Vec::new(),
            }],
        }
    }
}

impl EngineConfig {
    pub fn phase_deadline(&self) -> Duration {
        Duration::from_millis(self.phase_deadline_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }
}

/// Retry schedule for retryable provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

/// One analysis phase of the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub mode: PhaseMode,
    pub providers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_timeout_ms: Option<u64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Minimum set of successful providers required to aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumRule {
    pub any_of: Vec<String>,
    pub min_successes: usize,
}

/// Rank of a provider kind for one report field; higher wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecedenceRule {
    pub field: ReportField,
    pub kind: ProviderKind,
    pub rank: u8,
}

/// Aggregator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub quorum: Vec<QuorumRule>,
    /// Severity levels two equal-rank providers may differ by without a conflict.
    pub severity_tolerance: u8,
    /// Relative spread allowed between numeric estimates (0.25 = 25%).
    pub numeric_tolerance: f64,
    pub precedence: Vec<PrecedenceRule>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        use ProviderKind::*;
        use ReportField::*;
        let table = [
            (Severity, Weather, 2),
            (Severity, Imagery, 2),
            (Severity, SosExtraction, 1),
            (Severity, Inference, 0),
            (AffectedArea, Imagery, 2),
            (AffectedArea, SosExtraction, 1),
            (AffectedArea, Weather, 1),
            (AffectedArea, Inference, 0),
            (PeopleAtRisk, SosExtraction, 2),
            (PeopleAtRisk, Imagery, 1),
            (PeopleAtRisk, Weather, 0),
            (PeopleAtRisk, Inference, 0),
        ];
        Self {
            quorum: vec![QuorumRule {
                any_of: vec!["weather".into(), "imagery".into()],
                min_successes: 1,
            }],
            severity_tolerance: 0,
            numeric_tolerance: 0.25,
            precedence: table
                .into_iter()
                .map(|(field, kind, rank)| PrecedenceRule { field, kind, rank })
                .collect(),
        }
    }
}

/// Base requirement of one resource for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementRule {
    pub category: Category,
    pub resource: ResourceType,
    pub base: u32,
}

/// Multipliers applied to base requirements per severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityFactors {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for SeverityFactors {
    fn default() -> Self {
        Self {
            low: 0.5,
            medium: 1.0,
            high: 1.5,
            critical: 2.5,
        }
    }
}

/// Resource allocator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    pub base_requirements: Vec<RequirementRule>,
    pub severity_factors: SeverityFactors,
    /// Area that adds one full multiple of the base requirement.
    pub area_unit_km2: f64,
    pub max_area_factor: f64,
    /// Extra optional units reserved after the minimum set (0.2 = 20%).
    pub surplus_ratio: f64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        use Category::*;
        use ResourceType::*;
        let table = [
            (Fire, FireEngine, 2),
            (Fire, Ambulance, 1),
            (Fire, Helicopter, 1),
            (Flood, Boat, 2),
            (Flood, SearchAndRescue, 1),
            (Flood, Ambulance, 1),
            (Flood, SupplyTruck, 1),
            (Seismic, SearchAndRescue, 2),
            (Seismic, Ambulance, 2),
            (Seismic, SupplyTruck, 1),
            (Storm, SearchAndRescue, 1),
            (Storm, Ambulance, 1),
            (Storm, SupplyTruck, 1),
            (Other, Ambulance, 1),
        ];
        Self {
            base_requirements: table
                .into_iter()
                .map(|(category, resource, base)| RequirementRule {
                    category,
                    resource,
                    base,
                })
                .collect(),
            severity_factors: SeverityFactors::default(),
            area_unit_km2: 10.0,
            max_area_factor: 4.0,
            surplus_ratio: 0.0,
        }
    }
}

/// Resource types grounded while a hazard is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardRestriction {
    pub hazard: String,
    pub resources: Vec<ResourceType>,
}

/// Validator gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Let partial plans through the inventory-availability gate.
    pub allow_degraded_response: bool,
    pub max_route_km: f64,
    pub min_readiness: f64,
    pub restrictions: Vec<HazardRestriction>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allow_degraded_response: false,
            max_route_km: 300.0,
            min_readiness: 0.5,
            restrictions: vec![
                HazardRestriction {
                    hazard: "high_wind".into(),
                    resources: vec![ResourceType::Helicopter],
                },
                HazardRestriction {
                    hazard: "low_visibility".into(),
                    resources: vec![ResourceType::Helicopter],
                },
                HazardRestriction {
                    hazard: "storm_surge".into(),
                    resources: vec![ResourceType::Boat],
                },
            ],
        }
    }
}

/// Notification dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub send_timeout_ms: u64,
    /// Added to the affected-area radius for the public evacuation zone.
    pub evacuation_buffer_km: f64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            send_timeout_ms: 5_000,
            evacuation_buffer_km: 2.0,
        }
    }
}

/// Orchestrator policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Allocation attempts when the inventory reports commit conflicts.
    pub max_commit_attempts: u32,
    /// Upper bound on every inventory collaborator call.
    pub collaborator_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: 3,
            collaborator_timeout_ms: 5_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }
}

/// Which persistence backend holds incidents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
}

/// Incident store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Directory for the file backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Read-modify-write attempts before a CAS conflict is surfaced.
    pub max_cas_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: None,
            max_cas_retries: 5,
        }
    }
}

/// Settings for the bundled analysis providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub sos: SosConfig,
    #[serde(default)]
    pub imagery: ImageryConfig,
}

impl TriageConfig {
    /// Check cross-field constraints figment cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });

        if self.engine.retry.max_attempts == 0 {
            return invalid("engine.retry.max_attempts must be at least 1".into());
        }
        if self.engine.retry.multiplier < 1.0 {
            return invalid("engine.retry.multiplier must be >= 1.0".into());
        }
        if self.engine.phase_deadline_ms == 0 || self.engine.task_timeout_ms == 0 {
            return invalid("engine deadlines must be non-zero".into());
        }
        if self.engine.phases.is_empty() {
            return invalid("engine.phases must declare at least one phase".into());
        }
        for phase in &self.engine.phases {
            if phase.name.trim().is_empty() {
                return invalid("engine.phases entries need a name".into());
            }
            if phase.providers.is_empty() {
                return invalid(format!("phase '{}' schedules no providers", phase.name));
            }
        }
        for rule in &self.aggregation.quorum {
            if rule.min_successes > rule.any_of.len() {
                return invalid(format!(
                    "quorum rule needs {} of {} providers",
                    rule.min_successes,
                    rule.any_of.len()
                ));
            }
        }
        if self.aggregation.numeric_tolerance < 0.0 {
            return invalid("aggregation.numeric_tolerance must be >= 0".into());
        }
        if self.allocation.area_unit_km2 <= 0.0 || self.allocation.max_area_factor < 1.0 {
            return invalid("allocation area scaling is out of range".into());
        }
        if self.allocation.surplus_ratio < 0.0 {
            return invalid("allocation.surplus_ratio must be >= 0".into());
        }
        if !(0.0..=1.0).contains(&self.validation.min_readiness) {
            return invalid("validation.min_readiness must be within 0..=1".into());
        }
        if self.notification.max_attempts == 0 || self.orchestrator.max_commit_attempts == 0 {
            return invalid("attempt ceilings must be at least 1".into());
        }
        if self.store.backend == StoreBackend::File && self.store.path.is_none() {
            return invalid("store.path is required for the file backend".into());
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `TRIAGE_`)
/// 3. Workspace-local config (`.triage/config.toml`)
/// 4. User config (`~/.config/triage/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&TriageConfig>,
) -> Result<TriageConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(TriageConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "triage", "triage") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".triage").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // TRIAGE_VALIDATION__ALLOW_DEGRADED_RESPONSE=true, TRIAGE_ENGINE__PHASE_DEADLINE_MS=5000, ...
    figment = figment.merge(Env::prefixed("TRIAGE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "triage", "triage") {
        if config_dir.config_dir().join("config.toml").exists() {
            return true;
        }
    }
    workspace.is_some_and(|ws| ws.join(".triage").join("config.toml").exists())
}
