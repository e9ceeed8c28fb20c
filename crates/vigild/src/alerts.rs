//! User-facing alerts.
//!
//! The capture loop emits alerts without blocking; a separate async task
//! presents them as desktop notifications over D-Bus.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use tokio::sync::mpsc;
use zbus::zvariant::Value;

/// A blacklist match that started a recording.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub name: String,
    pub at: DateTime<Local>,
}

impl Alert {
    pub fn message(&self) -> String {
        format!("Blacklisted person detected: {}", self.name)
    }
}

/// Fire-and-forget alert emission.
pub trait AlertNotifier {
    fn notify(&mut self, alert: Alert);
}

/// Forwards alerts onto a bounded channel. A full channel drops the alert
/// rather than stalling capture.
pub struct ChannelNotifier {
    tx: mpsc::Sender<Alert>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<Alert>) -> Self {
        Self { tx }
    }
}

impl AlertNotifier for ChannelNotifier {
    fn notify(&mut self, alert: Alert) {
        match self.tx.try_send(alert) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(alert)) => {
                tracing::warn!(name = %alert.name, "alert channel full; alert dropped");
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                tracing::warn!(name = %alert.name, "alert presenter gone; alert dropped");
            }
        }
    }
}

#[zbus::proxy(
    interface = "org.freedesktop.Notifications",
    default_service = "org.freedesktop.Notifications",
    default_path = "/org/freedesktop/Notifications"
)]
trait Notifications {
    fn notify(
        &self,
        app_name: &str,
        replaces_id: u32,
        app_icon: &str,
        summary: &str,
        body: &str,
        actions: &[&str],
        hints: &HashMap<&str, &Value<'_>>,
        expire_timeout: i32,
    ) -> zbus::Result<u32>;
}

/// Freedesktop "critical" urgency level.
const URGENCY_CRITICAL: u8 = 2;

/// Present alerts until the channel closes.
///
/// Uses the session bus when `desktop` is set and reachable; otherwise each
/// alert is written as a warning log line.
pub async fn present(mut rx: mpsc::Receiver<Alert>, desktop: bool) {
    let proxy = if desktop { connect().await } else { None };

    while let Some(alert) = rx.recv().await {
        let message = alert.message();
        tracing::warn!(name = %alert.name, at = %alert.at, "ALERT: {message}");

        let Some(proxy) = &proxy else {
            continue;
        };
        let urgency = Value::from(URGENCY_CRITICAL);
        let hints = HashMap::from([("urgency", &urgency)]);
        // Timeout 0: stay until dismissed.
        if let Err(e) = proxy
            .notify("vigil", 0, "dialog-warning", "Alert", &message, &[], &hints, 0)
            .await
        {
            tracing::warn!(error = %e, "desktop notification failed");
        }
    }

    tracing::debug!("alert presenter exiting");
}

async fn connect() -> Option<NotificationsProxy<'static>> {
    let connection = match zbus::Connection::session().await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "no session bus; alerts will only be logged");
            return None;
        }
    };
    match NotificationsProxy::new(&connection).await {
        Ok(proxy) => Some(proxy),
        Err(e) => {
            tracing::warn!(error = %e, "notification service unavailable; alerts will only be logged");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(name: &str) -> Alert {
        Alert {
            name: name.into(),
            at: Local::now(),
        }
    }

    #[test]
    fn test_message_carries_name() {
        assert_eq!(alert("Alice").message(), "Blacklisted person detected: Alice");
    }

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut notifier = ChannelNotifier::new(tx);
        notifier.notify(alert("Alice"));
        assert_eq!(rx.recv().await.map(|a| a.name), Some("Alice".to_string()));
    }

    #[test]
    fn test_channel_notifier_never_blocks_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut notifier = ChannelNotifier::new(tx);
        notifier.notify(alert("first"));
        notifier.notify(alert("second"));

        assert_eq!(rx.try_recv().map(|a| a.name), Ok("first".to_string()));
        assert_eq!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_present_drains_until_closed() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(alert("Alice")).await.unwrap();
        drop(tx);
        present(rx, false).await;
    }
}
