//! Worker configuration

use std::path::Path;
use std::time::Duration;

use expenseflow_common::{ExpenseFlowError, RetryConfig};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::manifest::AssetManifest;
use crate::Result;

/// Offline worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix of every cache name
    pub app_name: String,

    /// Version suffix; bumping it retires all older caches on activation
    pub version: String,

    /// Origin the worker serves; relative paths resolve against it
    pub origin: Url,

    /// Asset manifest
    pub static_assets: AssetManifest,

    /// Document served when the network fails
    pub offline_page: String,

    /// Background sync tag that drains the submission queue
    pub sync_tag: String,

    /// Notification defaults
    pub notifications: NotificationDefaults,

    /// Host-side sync rescheduling
    pub sync_retry: SyncRetrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    /// Vibration pattern in milliseconds
    pub vibrate: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound for a single drain attempt
    pub attempt_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_name: "expenseflow".to_string(),
            version: "v1".to_string(),
            origin: default_origin(),
            static_assets: AssetManifest::default(),
            offline_page: "/offline.html".to_string(),
            sync_tag: "sync-expenses".to_string(),
            notifications: NotificationDefaults::default(),
            sync_retry: SyncRetrySettings::default(),
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "ExpenseFlow".to_string(),
            body: "You have a new notification".to_string(),
            icon: "/icon-192.png".to_string(),
            badge: "/icon-72.png".to_string(),
            vibrate: vec![200, 100, 200],
        }
    }
}

impl Default for SyncRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            attempt_timeout_ms: 30_000,
        }
    }
}

impl SyncRetrySettings {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..RetryConfig::default()
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl WorkerConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            ExpenseFlowError::config_with_source("invalid worker config", e).into()
        })
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(ExpenseFlowError::from)?;
        Self::from_json_str(&json)
    }

    /// Store populated at install.
    pub fn static_cache_name(&self) -> String {
        format!("{}-static-{}", self.app_name, self.version)
    }

    /// Store populated from successful network fetches.
    pub fn dynamic_cache_name(&self) -> String {
        format!("{}-dynamic-{}", self.app_name, self.version)
    }

    /// Single-store name used by earlier releases; never kept on activation.
    pub fn legacy_cache_name(&self) -> String {
        format!("{}-{}", self.app_name, self.version)
    }

    /// Names preserved across activation.
    pub fn current_cache_names(&self) -> [String; 2] {
        [self.static_cache_name(), self.dynamic_cache_name()]
    }

    /// Resolve a manifest entry or app path against the origin.
    pub fn resolve(&self, url: &str) -> Result<Url> {
        Ok(self.origin.join(url)?)
    }
}

const DEFAULT_ORIGIN: &str = "http://localhost:8080/";

fn default_origin() -> Url {
    Url::parse(DEFAULT_ORIGIN).expect("default origin literal is a valid URL")
}
