//! Push payloads and notifications.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::NotificationDefaults;

/// Action id that opens the target URL.
pub const ACTION_OPEN: &str = "open";
/// Action id that only closes the notification.
pub const ACTION_DISMISS: &str = "dismiss";

/// Decoded push message body. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub url: Option<String>,
}

impl PushPayload {
    /// Decode push data. Absent data yields the empty payload; so does a
    /// malformed one, which is logged and otherwise treated as absent.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(bytes) = data.filter(|b| !b.is_empty()) else {
            return Self::default();
        };
        match serde_json::from_slice(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "Malformed push payload, using defaults");
                Self::default()
            }
        }
    }

    /// Build the notification to display, filling gaps from `defaults`.
    pub fn into_notification(self, defaults: &NotificationDefaults) -> Notification {
        Notification {
            id: NotificationId::new(),
            title: non_empty(self.title).unwrap_or_else(|| defaults.title.clone()),
            options: NotificationOptions {
                body: non_empty(self.body).unwrap_or_else(|| defaults.body.clone()),
                icon: defaults.icon.clone(),
                badge: defaults.badge.clone(),
                vibrate: defaults.vibrate.clone(),
                data: non_empty(self.url).unwrap_or_else(|| "/".to_string()),
                actions: vec![
                    NotificationAction::new(ACTION_OPEN, "View"),
                    NotificationAction::new(ACTION_DISMISS, "Dismiss"),
                ],
            },
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Unique identifier for a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

impl NotificationAction {
    pub fn new(action: &str, title: &str) -> Self {
        Self {
            action: action.to_string(),
            title: title.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    /// Target URL opened on click.
    pub data: String,
    pub actions: Vec<NotificationAction>,
}

/// A system notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub options: NotificationOptions,
}

impl Notification {
    /// URL to open for a click with `action`, if the click means "open".
    ///
    /// A click on the body (no action) counts as "open".
    pub fn click_target(&self, action: Option<&str>) -> Option<&str> {
        match action.unwrap_or_default() {
            "" | ACTION_OPEN => Some(self.options.data.as_str()),
            _ => None,
        }
    }
}
