//! # ExpenseFlow Service Worker
//!
//! Offline support for the ExpenseFlow progressive web app.
//!
//! ## Features
//!
//! - **Install**: eager caching of the local part of the asset manifest
//! - **Activate**: purge of every cache outside the current version's set
//! - **Fetch**: cache-first, network fallback, offline page, synthesized 503
//! - **Sync**: queue-drain contract for offline submissions
//! - **Push**: notification display and click routing
//! - **Messages**: `SKIP_WAITING`, `CACHE_URLS`, `CLEAR_CACHE`
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     ├── Registration: installing / waiting / active
//!     ├── HostRuntime (implements ServiceWorkerHost)
//!     │       ├── Clients
//!     │       └── displayed notifications
//!     │
//!     └── OfflineWorker (one per version)
//!             ├── WorkerConfig + AssetManifest
//!             ├── CacheStorage (shared)
//!             │       └── Cache: RequestKey → CacheEntry
//!             ├── Fetcher (network)
//!             └── SyncQueue
//! ```

use expenseflow_common::ExpenseFlowError;
use expenseflow_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod event;
pub mod host;
pub mod lifecycle;
pub mod manifest;
pub mod message;
pub mod push;
pub mod sync;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, RequestKey, SharedCaches};
pub use clients::{Client, ClientType, Clients};
pub use config::{NotificationDefaults, SyncRetrySettings, WorkerConfig};
pub use container::{RuntimeEvent, ServiceWorkerContainer};
pub use event::ExtendableEvent;
pub use host::{HostRuntime, ServiceWorkerHost};
pub use lifecycle::{Registration, ServiceWorker, ServiceWorkerId, ServiceWorkerState};
pub use manifest::AssetManifest;
pub use message::ClientMessage;
pub use push::{Notification, NotificationAction, NotificationId, NotificationOptions, PushPayload};
pub use sync::{StubSyncQueue, SyncQueue};
pub use worker::{ActivateReport, FetchOutcome, InstallOutcome, OfflineWorker, ResponseSource};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Sync error: {0}")]
    SyncError(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error(transparent)]
    Common(#[from] ExpenseFlowError),
}

impl ServiceWorkerError {
    /// Whether the host should reschedule the work that failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceWorkerError::Network(_) | ServiceWorkerError::SyncError(_) => true,
            ServiceWorkerError::Common(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
