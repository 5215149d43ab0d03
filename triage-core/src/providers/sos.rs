//! SOS-signal extraction provider.
//!
//! Merges the incident's attached distress signals with an optional live
//! feed, keeps keyword matches near the incident and clusters them on a
//! coarse grid to estimate severity, people at risk and affected area.

use super::{AnalysisContext, AnalysisProvider, unless_cancelled};
use crate::error::{ProviderError, SourceError};
use crate::types::{
    Finding, IncidentSnapshot, Location, ProviderId, ProviderKind, Severity, SosMessage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

const KM_PER_DEGREE: f64 = 111.0;

/// Live source of recent distress messages (social media, SMS gateway, ...).
#[async_trait]
pub trait SosFeed: Send + Sync {
    async fn recent_messages(
        &self,
        center: Location,
        radius_km: f64,
    ) -> Result<Vec<SosMessage>, SourceError>;
}

/// SOS extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SosConfig {
    pub keywords: Vec<String>,
    pub radius_km: f64,
    /// Grid cell edge used for clustering.
    pub cluster_cell_km: f64,
}

impl Default for SosConfig {
    fn default() -> Self {
        Self {
            keywords: vec![
                "sos".into(),
                "help".into(),
                "emergency".into(),
                "trapped".into(),
            ],
            radius_km: 50.0,
            cluster_cell_km: 5.0,
        }
    }
}

pub struct SosProvider {
    feed: Option<Arc<dyn SosFeed>>,
    config: SosConfig,
}

impl SosProvider {
    pub const ID: &'static str = "sos";

    pub fn new(feed: Option<Arc<dyn SosFeed>>, config: SosConfig) -> Self {
        Self { feed, config }
    }

    fn is_distress(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.config
            .keywords
            .iter()
            .any(|k| lower.contains(&k.to_lowercase()))
    }

    /// Score the relevant subset of `messages` around `center`.
    pub fn assess(&self, center: Location, messages: &[SosMessage]) -> Finding {
        let mut seen = HashSet::new();
        let relevant: Vec<&SosMessage> = messages
            .iter()
            .filter(|m| seen.insert(m.id.as_str()))
            .filter(|m| self.is_distress(&m.text))
            .filter(|m| center.distance_km(&m.location) <= self.config.radius_km)
            .collect();

        let cell_deg = self.config.cluster_cell_km / KM_PER_DEGREE;
        let clusters: BTreeSet<(i64, i64)> = relevant
            .iter()
            .map(|m| {
                (
                    (m.location.latitude / cell_deg).floor() as i64,
                    (m.location.longitude / cell_deg).floor() as i64,
                )
            })
            .collect();
        let trapped = relevant
            .iter()
            .filter(|m| m.text.to_lowercase().contains("trapped"))
            .count();

        let count = relevant.len();
        let severity = if count >= 20 || trapped > 0 {
            Severity::Critical
        } else if count >= 10 {
            Severity::High
        } else if count >= 3 {
            Severity::Medium
        } else {
            Severity::Low
        };

        let mut finding = Finding::with_severity(severity);
        finding.people_at_risk = Some(count as u32);
        if !clusters.is_empty() {
            let cell_area = self.config.cluster_cell_km * self.config.cluster_cell_km;
            finding.affected_area_km2 = Some(clusters.len() as f64 * cell_area);
        }
        if trapped > 0 {
            finding = finding.hazard("trapped_persons");
        }
        finding
            .attributes
            .insert("message_count".into(), count.into());
        finding
            .attributes
            .insert("cluster_count".into(), clusters.len().into());
        finding
            .attributes
            .insert("trapped_mentions".into(), trapped.into());
        finding
    }
}

#[async_trait]
impl AnalysisProvider for SosProvider {
    fn id(&self) -> ProviderId {
        ProviderId::from(Self::ID)
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::SosExtraction
    }

    async fn analyze(
        &self,
        snapshot: &IncidentSnapshot,
        ctx: &AnalysisContext,
        _deadline: Instant,
    ) -> Result<Finding, ProviderError> {
        let mut messages = snapshot.signals.clone();
        if let Some(feed) = &self.feed {
            let fetched = unless_cancelled(ctx, Self::ID, async {
                feed.recent_messages(snapshot.location, self.config.radius_km)
                    .await
                    .map_err(|e| e.into_provider_error(Self::ID))
            })
            .await?;
            messages.extend(fetched);
        }
        debug!(
            incident_id = %snapshot.id,
            messages = messages.len(),
            "Scoring distress signals"
        );
        Ok(self.assess(snapshot.location, &messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, IncidentId};

    const CENTER: Location = Location {
        latitude: 34.0522,
        longitude: -118.2437,
    };

    fn msg(id: &str, text: &str, location: Location) -> SosMessage {
        let mut m = SosMessage::new(text, location, "twitter");
        m.id = id.into();
        m
    }

    fn provider() -> SosProvider {
        SosProvider::new(None, SosConfig::default())
    }

    struct FailingFeed;

    #[async_trait]
    impl SosFeed for FailingFeed {
        async fn recent_messages(
            &self,
            _center: Location,
            _radius_km: f64,
        ) -> Result<Vec<SosMessage>, SourceError> {
            Err(SourceError::Unavailable("rate limited".into()))
        }
    }

    #[test]
    fn test_volume_drives_severity() {
        let messages: Vec<SosMessage> = (0..10)
            .map(|i| msg(&format!("m{i}"), "Need help on Main St", CENTER))
            .collect();
        let finding = provider().assess(CENTER, &messages);
        assert_eq!(finding.severity, Some(Severity::High));
        assert_eq!(finding.people_at_risk, Some(10));
        assert_eq!(finding.affected_area_km2, Some(25.0));
    }

    #[test]
    fn test_trapped_is_critical() {
        let messages = vec![msg("a", "Family TRAPPED on roof", CENTER)];
        let finding = provider().assess(CENTER, &messages);
        assert_eq!(finding.severity, Some(Severity::Critical));
        assert!(finding.hazards.contains("trapped_persons"));
    }

    #[test]
    fn test_filters_irrelevant_and_distant_messages() {
        let far = Location::new(40.7128, -74.0060);
        let messages = vec![
            msg("a", "sos", CENTER),
            msg("a", "sos", CENTER),
            msg("b", "lovely sunset", CENTER),
            msg("c", "emergency", far),
        ];
        let finding = provider().assess(CENTER, &messages);
        assert_eq!(finding.people_at_risk, Some(1));
        assert_eq!(finding.severity, Some(Severity::Low));
    }

    #[tokio::test]
    async fn test_feed_failure_is_transient() {
        let provider = SosProvider::new(Some(Arc::new(FailingFeed)), SosConfig::default());
        let snapshot = IncidentSnapshot {
            id: IncidentId::new("INC-1"),
            category: Category::Flood,
            location: CENTER,
            description: None,
            severity: None,
            signals: Vec::new(),
            cycle: 1,
        };
        let err = provider
            .analyze(&snapshot, &AnalysisContext::new(1), Instant::now())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.provider(), "sos");
    }
}
