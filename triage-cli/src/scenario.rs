//! Scenario fixtures: a JSON description of one incident and the world
//! around it, turned into provider sources, an inventory and channels.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use triage_core::error::{DispatchError, SourceError};
use triage_core::providers::{
    FireDetection, ImageryProvider, ImagerySource, SosFeed, SosProvider, TerrainProfile,
    WeatherObservation, WeatherProvider, WeatherSource,
};
use triage_core::types::AudienceKind;
use triage_core::{
    AlertMessage, Audience, Category, Depot, Dispatcher, IncidentReport, Location,
    NotificationChannel, ProviderRegistry, ResourceType, Severity, SosMessage, TriageConfig,
};

/// A distress message as written in a scenario file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalFixture {
    pub text: String,
    pub location: Location,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "scenario".into()
}

impl SignalFixture {
    fn to_message(&self) -> SosMessage {
        SosMessage::new(self.text.clone(), self.location, self.source.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentFixture {
    pub category: Category,
    pub location: Location,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub signals: Vec<SignalFixture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelFixture {
    pub name: String,
    pub audience: AudienceKind,
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Simulate an outage on this channel.
    #[serde(default)]
    pub down: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub incident: IncidentFixture,
    #[serde(default)]
    pub weather: Option<WeatherObservation>,
    #[serde(default)]
    pub fire_detections: Vec<FireDetection>,
    #[serde(default)]
    pub terrain: Option<TerrainProfile>,
    /// Messages served by the live SOS feed.
    #[serde(default)]
    pub feed: Vec<SignalFixture>,
    #[serde(default)]
    pub depots: Vec<Depot>,
    #[serde(default)]
    pub channels: Vec<ChannelFixture>,
}

impl Scenario {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read scenario {}: {}", path.display(), e))?;
        serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid scenario {}: {}", path.display(), e))
    }

    /// Wildfire east of downtown Los Angeles with a stretched inventory.
    pub fn demo() -> Self {
        let scene = Location::new(34.0522, -118.2437);
        let near = |dlat: f64, dlon: f64| Location::new(scene.latitude + dlat, scene.longitude + dlon);
        Self {
            incident: IncidentFixture {
                category: Category::Fire,
                location: scene,
                description: Some("Brush fire moving toward residential hillside".into()),
                signals: vec![SignalFixture {
                    text: "Help! Smoke everywhere on our street".into(),
                    location: near(0.004, 0.002),
                    source: "sms".into(),
                }],
            },
            weather: Some(WeatherObservation {
                temperature_c: 38.0,
                conditions: "clear".into(),
                wind_speed_ms: 11.0,
                humidity_pct: 14.0,
                visibility_m: 6_000.0,
            }),
            fire_detections: (0..6)
                .map(|i| FireDetection {
                    latitude: scene.latitude + 0.003 * f64::from(i),
                    longitude: scene.longitude - 0.002 * f64::from(i),
                    brightness: 350.0 + 10.0 * f64::from(i),
                    confidence: "high".into(),
                })
                .collect(),
            terrain: Some(TerrainProfile {
                elevation_m: 180.0,
                slope_deg: 22.0,
                flood_risk: Severity::Low,
                land_cover: "chaparral".into(),
            }),
            feed: vec![
                SignalFixture {
                    text: "SOS family trapped near the canyon road".into(),
                    location: near(0.01, -0.01),
                    source: "twitter".into(),
                },
                SignalFixture {
                    text: "emergency, fire crossed the ridge".into(),
                    location: near(-0.02, 0.015),
                    source: "twitter".into(),
                },
            ],
            depots: vec![
                Depot::new("station-12", near(0.05, 0.03))
                    .with_stock(ResourceType::FireEngine, 6)
                    .with_stock(ResourceType::Ambulance, 3),
                Depot::new("county-air", near(-0.12, 0.2))
                    .with_stock(ResourceType::Helicopter, 3)
                    .with_readiness(0.9),
                Depot::new("valley-depot", near(0.3, -0.25))
                    .with_stock(ResourceType::FireEngine, 8)
                    .with_stock(ResourceType::Ambulance, 4)
                    .with_stock(ResourceType::SupplyTruck, 2),
            ],
            channels: vec![
                ChannelFixture {
                    name: "public-sms".into(),
                    audience: AudienceKind::Public,
                    recipients: Vec::new(),
                    down: false,
                },
                ChannelFixture {
                    name: "dispatch-radio".into(),
                    audience: AudienceKind::Responders,
                    recipients: vec!["engine-co-12".into(), "air-ops".into()],
                    down: false,
                },
                ChannelFixture {
                    name: "eoc-email".into(),
                    audience: AudienceKind::Authorities,
                    recipients: vec!["eoc@example.org".into()],
                    down: false,
                },
            ],
        }
    }

    pub fn report(&self) -> IncidentReport {
        IncidentReport {
            category: self.incident.category,
            location: self.incident.location,
            description: self.incident.description.clone(),
            signals: self.incident.signals.iter().map(SignalFixture::to_message).collect(),
        }
    }

    /// The bundled providers, backed by this scenario's fixtures.
    pub fn registry(&self, config: &TriageConfig) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        let feed: Arc<dyn SosFeed> = Arc::new(FixtureFeed {
            messages: self.feed.iter().map(SignalFixture::to_message).collect(),
        });
        registry.register(Arc::new(SosProvider::new(Some(feed), config.providers.sos.clone())));
        registry.register(Arc::new(WeatherProvider::new(Arc::new(FixtureWeather {
            observation: self.weather.clone(),
        }))));
        registry.register(Arc::new(ImageryProvider::new(
            Arc::new(FixtureImagery {
                detections: self.fire_detections.clone(),
                terrain: self.terrain.clone(),
            }),
            config.providers.imagery.clone(),
        )));
        registry
    }

    pub fn dispatcher(&self, config: &TriageConfig) -> Dispatcher {
        let mut dispatcher = Dispatcher::new(config.notification.clone());
        for channel in &self.channels {
            dispatcher.register(
                Arc::new(LoggingChannel {
                    name: channel.name.clone(),
                    down: channel.down,
                }),
                Audience::new(channel.audience).with_recipients(channel.recipients.clone()),
            );
        }
        dispatcher
    }
}

struct FixtureWeather {
    observation: Option<WeatherObservation>,
}

#[async_trait]
impl WeatherSource for FixtureWeather {
    async fn current(&self, _location: Location) -> Result<WeatherObservation, SourceError> {
        self.observation
            .clone()
            .ok_or_else(|| SourceError::Rejected("scenario has no weather observation".into()))
    }
}

struct FixtureImagery {
    detections: Vec<FireDetection>,
    terrain: Option<TerrainProfile>,
}

#[async_trait]
impl ImagerySource for FixtureImagery {
    async fn fire_detections(
        &self,
        center: Location,
        radius_km: f64,
    ) -> Result<Vec<FireDetection>, SourceError> {
        Ok(self
            .detections
            .iter()
            .filter(|d| d.location().distance_km(&center) <= radius_km)
            .cloned()
            .collect())
    }

    async fn terrain(&self, _location: Location) -> Result<TerrainProfile, SourceError> {
        self.terrain
            .clone()
            .ok_or_else(|| SourceError::Rejected("scenario has no terrain profile".into()))
    }
}

struct FixtureFeed {
    messages: Vec<SosMessage>,
}

#[async_trait]
impl SosFeed for FixtureFeed {
    async fn recent_messages(
        &self,
        center: Location,
        radius_km: f64,
    ) -> Result<Vec<SosMessage>, SourceError> {
        Ok(self
            .messages
            .iter()
            .filter(|m| m.location.distance_km(&center) <= radius_km)
            .cloned()
            .collect())
    }
}

/// Channel that writes alerts to the log instead of a gateway.
struct LoggingChannel {
    name: String,
    down: bool,
}

#[async_trait]
impl NotificationChannel for LoggingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &AlertMessage, audience: &Audience) -> Result<String, DispatchError> {
        if self.down {
            warn!(channel = %self.name, "Simulated channel outage");
            return Err(DispatchError::ChannelFailed {
                channel: self.name.clone(),
                message: "simulated outage".into(),
            });
        }
        info!(
            channel = %self.name,
            audience = %audience.kind,
            recipients = audience.recipients.len(),
            subject = %message.subject,
            body = %message.body,
            "ALERT"
        );
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_round_trips_through_json() {
        let json = serde_json::to_string(&Scenario::demo()).unwrap();
        let scenario: Scenario = serde_json::from_str(&json).unwrap();
        assert_eq!(scenario.incident.category, Category::Fire);
        assert_eq!(scenario.depots.len(), 3);
        assert_eq!(scenario.report().signals.len(), 1);
    }

    #[test]
    fn test_minimal_scenario_defaults() {
        let scenario: Scenario = serde_json::from_str(
            r#"{"incident":{"category":"flood","location":{"latitude":29.76,"longitude":-95.37}}}"#,
        )
        .unwrap();
        assert!(scenario.weather.is_none());
        assert!(scenario.channels.is_empty());
        assert!(scenario.depots.is_empty());
    }

    #[tokio::test]
    async fn test_fixture_feed_filters_by_radius() {
        let center = Location::new(34.05, -118.24);
        let feed = FixtureFeed {
            messages: vec![
                SosMessage::new("help", center, "sms"),
                SosMessage::new("help", Location::new(40.7, -74.0), "sms"),
            ],
        };
        let found = feed.recent_messages(center, 50.0).await.unwrap();
        assert_eq!(found.len(), 1);
    }
}
