//! Notification dispatcher: turns an approved plan into per-audience alerts.
//!
//! Every registered channel is sent to concurrently. Each channel retries on
//! its own under a per-send timeout; one channel failing never affects the
//! others.

use crate::config::NotificationConfig;
use crate::error::DispatchError;
use crate::types::{
    AllocationPlan, Assignment, AudienceKind, Category, ChannelDelivery, DeliveryStatus, Incident,
    IncidentId, Location, NotificationRecord, Severity,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Who a channel delivers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audience {
    pub kind: AudienceKind,
    #[serde(default)]
    pub recipients: Vec<String>,
}

impl Audience {
    pub fn new(kind: AudienceKind) -> Self {
        Self {
            kind,
            recipients: Vec::new(),
        }
    }

    pub fn with_recipients(mut self, recipients: Vec<String>) -> Self {
        self.recipients = recipients;
        self
    }
}

/// A rendered alert for one audience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub incident_id: IncidentId,
    pub audience: AudienceKind,
    pub category: Category,
    pub severity: Option<Severity>,
    pub location: Location,
    pub subject: String,
    pub body: String,
    /// Public evacuation zone around the incident.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evacuation_radius_km: Option<f64>,
    /// Deployment orders, for responders.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<Assignment>,
}

/// Outbound messaging collaborator (SMS gateway, push topic, email, ...).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Human-readable name of this channel instance.
    fn name(&self) -> &str;

    /// Deliver one message. Returns a delivery receipt on success.
    async fn send(&self, message: &AlertMessage, audience: &Audience) -> Result<String, DispatchError>;
}

struct Registered {
    channel: Arc<dyn NotificationChannel>,
    audience: Audience,
}

pub struct Dispatcher {
    channels: Vec<Registered>,
    config: NotificationConfig,
}

impl Dispatcher {
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            channels: Vec::new(),
            config,
        }
    }

    pub fn register(&mut self, channel: Arc<dyn NotificationChannel>, audience: Audience) {
        self.channels.push(Registered { channel, audience });
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Public evacuation radius: the affected area as a circle, plus a buffer.
    pub fn evacuation_radius_km(&self, affected_area_km2: Option<f64>) -> f64 {
        let area = affected_area_km2.unwrap_or(0.0).max(0.0);
        (area / PI).sqrt() + self.config.evacuation_buffer_km
    }

    /// Render the message a given audience receives.
    pub fn compose(&self, plan: &AllocationPlan, incident: &Incident, audience: AudienceKind) -> AlertMessage {
        let severity = incident.report.as_ref().map(|r| r.severity).or(incident.severity);
        let severity_label = severity.map_or_else(|| "unassessed".to_string(), |s| s.to_string());
        let area = incident.report.as_ref().and_then(|r| r.affected_area_km2);
        let loc = incident.location;
        let mut message = AlertMessage {
            incident_id: incident.id.clone(),
            audience,
            category: incident.category,
            severity,
            location: loc,
            subject: String::new(),
            body: String::new(),
            evacuation_radius_km: None,
            assignments: Vec::new(),
        };

        match audience {
            AudienceKind::Public => {
                let radius = self.evacuation_radius_km(area);
                message.subject = format!("EMERGENCY: {} {} alert", severity_label, incident.category);
                message.body = format!(
                    "Evacuate the area within {:.1} km of ({:.4}, {:.4}). Follow instructions from local authorities.",
                    radius, loc.latitude, loc.longitude
                );
                message.evacuation_radius_km = Some(radius);
            }
            AudienceKind::Responders => {
                message.subject = format!("Deployment order for {}", incident.id);
                let lines: Vec<String> = plan
                    .assignments
                    .iter()
                    .map(|a| {
                        format!(
                            "{} x {} from {} ({:.1} km){}",
                            a.quantity,
                            a.resource_type,
                            a.source_depot,
                            a.distance_km,
                            if a.optional { " [optional]" } else { "" }
                        )
                    })
                    .collect();
                message.body = format!(
                    "Proceed to ({:.4}, {:.4}).\n{}",
                    loc.latitude,
                    loc.longitude,
                    lines.join("\n")
                );
                message.assignments = plan.assignments.clone();
            }
            AudienceKind::Authorities => {
                message.subject = format!("Situation report {}", incident.id);
                let hazards = incident
                    .report
                    .as_ref()
                    .map(|r| r.hazards.iter().cloned().collect::<Vec<_>>().join(", "))
                    .unwrap_or_default();
                message.body = format!(
                    "{} incident, severity {}. Units deployed: {}. Shortfall: {}. Hazards: {}.",
                    incident.category,
                    severity_label,
                    plan.assignments.iter().map(|a| a.quantity).sum::<u32>(),
                    plan.shortfall.values().sum::<u32>(),
                    if hazards.is_empty() { "none" } else { hazards.as_str() }
                );
            }
        }
        message
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .config
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(ms)
    }

    async fn deliver(&self, registered: &Registered, message: AlertMessage) -> ChannelDelivery {
        let name = registered.channel.name().to_string();
        let timeout = Duration::from_millis(self.config.send_timeout_ms);
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let result = tokio::time::timeout(timeout, registered.channel.send(&message, &registered.audience))
                .await
                .unwrap_or_else(|_| {
                    Err(DispatchError::Timeout {
                        channel: name.clone(),
                        timeout_ms: self.config.send_timeout_ms,
                    })
                });
            match result {
                Ok(receipt) => {
                    info!(
                        incident_id = %message.incident_id,
                        channel = %name,
                        audience = %registered.audience.kind,
                        attempt,
                        "Alert delivered"
                    );
                    return ChannelDelivery {
                        channel: name,
                        audience: registered.audience.kind,
                        attempts: attempt,
                        delivered: true,
                        receipt: Some(receipt),
                        error: None,
                    };
                }
                Err(e) => {
                    warn!(
                        incident_id = %message.incident_id,
                        channel = %name,
                        attempt,
                        max = max_attempts,
                        error = %e,
                        "Alert delivery failed"
                    );
                    last_error = Some(e.to_string());
                    if attempt < max_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        ChannelDelivery {
            channel: name,
            audience: registered.audience.kind,
            attempts: max_attempts,
            delivered: false,
            receipt: None,
            error: last_error,
        }
    }

    /// Deliver alerts for an approved plan on every channel.
    pub async fn dispatch(&self, plan: &AllocationPlan, incident: &Incident) -> NotificationRecord {
        let sends = self.channels.iter().map(|registered| {
            let message = self.compose(plan, incident, registered.audience.kind);
            self.deliver(registered, message)
        });
        let deliveries = futures::future::join_all(sends).await;

        let delivered = deliveries.iter().filter(|d| d.delivered).count();
        let status = if delivered == 0 {
            DeliveryStatus::None
        } else if delivered == deliveries.len() {
            DeliveryStatus::Full
        } else {
            DeliveryStatus::Partial
        };
        info!(
            incident_id = %incident.id,
            status = %status,
            delivered,
            channels = deliveries.len(),
            "Notification dispatch finished"
        );

        NotificationRecord {
            cycle: incident.cycle,
            status,
            deliveries,
            dispatched_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IncidentReport, ResourceType};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockChannel {
        name: String,
        fail_first: u32,
        hang: bool,
        calls: AtomicU32,
        sent: Mutex<Vec<AlertMessage>>,
    }

    impl MockChannel {
        fn new(name: &str, fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                fail_first,
                hang: false,
                calls: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn hanging(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                fail_first: 0,
                hang: true,
                calls: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NotificationChannel for MockChannel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, message: &AlertMessage, _audience: &Audience) -> Result<String, DispatchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hang {
                std::future::pending::<()>().await;
            }
            if call <= self.fail_first {
                return Err(DispatchError::ChannelFailed {
                    channel: self.name.clone(),
                    message: "gateway 502".into(),
                });
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(format!("{}-{}", self.name, call))
        }
    }

    fn config() -> NotificationConfig {
        NotificationConfig {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            send_timeout_ms: 50,
            evacuation_buffer_km: 2.0,
        }
    }

    fn incident() -> Incident {
        Incident::from_report(IncidentReport {
            category: Category::Fire,
            location: Location::new(34.05, -118.24),
            description: None,
            signals: Vec::new(),
        })
    }

    fn plan() -> AllocationPlan {
        AllocationPlan {
            incident_id: IncidentId::new("INC-1"),
            cycle: 1,
            inventory_version: 1,
            assignments: vec![Assignment {
                resource_type: ResourceType::FireEngine,
                quantity: 2,
                source_depot: "north".into(),
                destination: Location::new(34.05, -118.24),
                distance_km: 12.0,
                optional: false,
            }],
            required: BTreeMap::from([(ResourceType::FireEngine, 2)]),
            shortfall: BTreeMap::new(),
            partial: false,
        }
    }

    #[tokio::test]
    async fn test_full_delivery_with_retry() {
        let sms = MockChannel::new("sms", 2);
        let mut dispatcher = Dispatcher::new(config());
        dispatcher.register(sms.clone(), Audience::new(AudienceKind::Public));
        let record = dispatcher.dispatch(&plan(), &incident()).await;
        assert_eq!(record.status, DeliveryStatus::Full);
        assert_eq!(record.deliveries[0].attempts, 3);
        assert_eq!(record.deliveries[0].receipt.as_deref(), Some("sms-3"));
    }

    #[tokio::test]
    async fn test_one_failing_channel_is_partial() {
        let ok = MockChannel::new("radio", 0);
        let broken = MockChannel::new("sms", 10);
        let mut dispatcher = Dispatcher::new(config());
        dispatcher.register(ok.clone(), Audience::new(AudienceKind::Responders));
        dispatcher.register(broken.clone(), Audience::new(AudienceKind::Public));
        let record = dispatcher.dispatch(&plan(), &incident()).await;
        assert_eq!(record.status, DeliveryStatus::Partial);
        assert_eq!(broken.calls.load(Ordering::SeqCst), 3);
        let failed = record.deliveries.iter().find(|d| d.channel == "sms").unwrap();
        assert!(!failed.delivered);
        assert!(failed.error.as_ref().unwrap().contains("gateway 502"));
        let sent = ok.sent.lock().unwrap();
        assert_eq!(sent[0].assignments.len(), 1);
    }

    #[tokio::test]
    async fn test_hanging_channel_times_out() {
        let stuck = MockChannel::hanging("email");
        let mut dispatcher = Dispatcher::new(config());
        dispatcher.register(stuck, Audience::new(AudienceKind::Authorities));
        let record = dispatcher.dispatch(&plan(), &incident()).await;
        assert_eq!(record.status, DeliveryStatus::None);
        assert!(record.deliveries[0].error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_no_channels_is_none() {
        let dispatcher = Dispatcher::new(config());
        let record = dispatcher.dispatch(&plan(), &incident()).await;
        assert_eq!(record.status, DeliveryStatus::None);
        assert!(record.deliveries.is_empty());
    }

    #[test]
    fn test_evacuation_radius() {
        let dispatcher = Dispatcher::new(config());
        assert!((dispatcher.evacuation_radius_km(None) - 2.0).abs() < 1e-9);
        let r = dispatcher.evacuation_radius_km(Some(PI * 9.0));
        assert!((r - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_public_message_mentions_radius() {
        let dispatcher = Dispatcher::new(config());
        let msg = dispatcher.compose(&plan(), &incident(), AudienceKind::Public);
        assert_eq!(msg.evacuation_radius_km, Some(2.0));
        assert!(msg.body.contains("2.0 km"));
        assert!(msg.assignments.is_empty());
    }
}
