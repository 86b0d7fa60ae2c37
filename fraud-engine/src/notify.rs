//! Alert notification dispatch
//!
//! Dispatch is fire-and-forget: a full queue drops the notification with a
//! warning instead of blocking the evaluation.

use crate::alerts::SecurityAlert;
use crate::settings::NotificationPreferences;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    /// Email
    Email,
    /// SMS
    Sms,
    /// Push notification
    Push,
}

/// Alert plus the channels the user opted into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    /// Alert being announced
    pub alert: SecurityAlert,

    /// Target channels, never empty
    pub channels: Vec<NotificationChannel>,
}

impl AlertNotification {
    /// Build a notification honoring the preferences; `None` if the user opted out
    pub fn for_alert(alert: &SecurityAlert, prefs: &NotificationPreferences) -> Option<Self> {
        if !prefs.wants(alert.severity) {
            return None;
        }

        let channels: Vec<_> = [
            (prefs.email, NotificationChannel::Email),
            (prefs.sms, NotificationChannel::Sms),
            (prefs.push, NotificationChannel::Push),
        ]
        .into_iter()
        .filter_map(|(enabled, channel)| enabled.then_some(channel))
        .collect();

        Some(Self {
            alert: alert.clone(),
            channels,
        })
    }
}

/// Outbound notification sink
pub trait Notifier: Send + Sync {
    /// Hand off a notification; returns whether it was accepted
    fn notify(&self, notification: AlertNotification) -> bool;
}

/// Notifier that forwards into a bounded channel drained by a delivery task
pub struct ChannelNotifier {
    tx: mpsc::Sender<AlertNotification>,
}

impl ChannelNotifier {
    /// Create notifier and the receiving end for the delivery task
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AlertNotification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: AlertNotification) -> bool {
        let alert_id = notification.alert.id;
        match self.tx.try_send(notification) {
            Ok(()) => {
                debug!("Queued notification for alert {}", alert_id);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Notification queue full, dropping alert {}", alert_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Notification queue closed, dropping alert {}", alert_id);
                false
            }
        }
    }
}

/// Notifier that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: AlertNotification) -> bool {
        true
    }
}

/// Notifier that keeps notifications in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<AlertNotification>>,
}

impl RecordingNotifier {
    /// Create empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received so far
    pub fn sent(&self) -> Vec<AlertNotification> {
        self.sent.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: AlertNotification) -> bool {
        self.sent.lock().push(notification);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertType;
    use crate::{RiskLevel, Score};
    use chrono::Utc;
    use uuid::Uuid;

    fn alert(severity: RiskLevel) -> SecurityAlert {
        SecurityAlert {
            id: Uuid::new_v4(),
            user_id: "bob".to_string(),
            transaction_id: Uuid::new_v4(),
            alert_type: AlertType::HighRiskScore,
            severity,
            score: Score::new(90),
            rule_ids: vec![],
            message: "test".to_string(),
            resolved: false,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn test_preferences_pick_channels() {
        let prefs = NotificationPreferences::default();
        let notification = AlertNotification::for_alert(&alert(RiskLevel::Critical), &prefs).unwrap();
        assert_eq!(
            notification.channels,
            vec![NotificationChannel::Email, NotificationChannel::Push]
        );

        assert!(AlertNotification::for_alert(&alert(RiskLevel::Medium), &prefs).is_none());
    }

    #[tokio::test]
    async fn test_channel_notifier_drops_when_full() {
        let (notifier, mut rx) = ChannelNotifier::new(1);
        let prefs = NotificationPreferences::default();
        let first = AlertNotification::for_alert(&alert(RiskLevel::High), &prefs).unwrap();
        let second = AlertNotification::for_alert(&alert(RiskLevel::High), &prefs).unwrap();

        assert!(notifier.notify(first.clone()));
        assert!(!notifier.notify(second));

        assert_eq!(rx.recv().await, Some(first));
    }

    #[test]
    fn test_closed_channel_drops() {
        let (notifier, rx) = ChannelNotifier::new(4);
        drop(rx);
        let prefs = NotificationPreferences::default();
        let n = AlertNotification::for_alert(&alert(RiskLevel::High), &prefs).unwrap();
        assert!(!notifier.notify(n));
    }
}
