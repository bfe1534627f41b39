//! Event handlers of one worker version.

use std::fmt;
use std::sync::Arc;

use expenseflow_net::{Fetcher, Request, Response, ResponseType};
use http::{Method, StatusCode};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::cache::{self, SharedCaches};
use crate::config::WorkerConfig;
use crate::event::ExtendableEvent;
use crate::host::ServiceWorkerHost;
use crate::message::ClientMessage;
use crate::push::{Notification, PushPayload};
use crate::sync::SyncQueue;
use crate::{Client, Result};

/// Body of the synthesized response when nothing else is available.
pub const OFFLINE_TEXT: &str = "Offline";

/// Result of the install handler. Install never fails from the host's
/// point of view; an incomplete static cache is reported, not raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Every local asset was stored.
    Installed { cached: usize, deferred: usize },
    /// The bulk add failed; the static cache may be empty.
    Incomplete { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateReport {
    /// Cache names removed, in storage order.
    pub deleted: Vec<String>,
    /// Pages newly taken under control.
    pub claimed: usize,
}

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    OfflinePage,
    Synthesized,
}

#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the platform handles the request itself.
    Bypass,
    /// Intercepted and answered.
    Respond {
        response: Response,
        source: ResponseSource,
    },
}

impl FetchOutcome {
    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            FetchOutcome::Bypass => None,
            FetchOutcome::Respond { source, .. } => Some(*source),
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Bypass => None,
            FetchOutcome::Respond { response, .. } => Some(response),
        }
    }
}

/// One deployed version of the offline worker.
pub struct OfflineWorker {
    config: Arc<WorkerConfig>,
    caches: SharedCaches,
    fetcher: Arc<dyn Fetcher>,
    host: Arc<dyn ServiceWorkerHost>,
    sync_queue: Arc<dyn SyncQueue>,
}

impl fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("version", &self.config.version)
            .field("origin", &self.config.origin.as_str())
            .finish_non_exhaustive()
    }
}

impl OfflineWorker {
    pub fn new(
        config: WorkerConfig,
        caches: SharedCaches,
        fetcher: Arc<dyn Fetcher>,
        host: Arc<dyn ServiceWorkerHost>,
        sync_queue: Arc<dyn SyncQueue>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            caches,
            fetcher,
            host,
            sync_queue,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn caches(&self) -> &SharedCaches {
        &self.caches
    }

    // ==================== Install ====================

    /// Cache every local manifest entry, all or nothing. Absolute URLs are
    /// left for the dynamic cache. On success, asks to skip waiting.
    #[instrument(skip(self), fields(version = %self.config.version))]
    pub async fn install(&self) -> InstallOutcome {
        info!("Installing");
        let manifest = &self.config.static_assets;
        let origin = &self.config.origin;
        let deferred = manifest.remote_entries(origin).count();

        let requests: Result<Vec<Request>> = manifest
            .local_entries(origin)
            .map(|entry| self.config.resolve(entry).map(Request::get))
            .collect();

        let stored = match requests {
            Ok(requests) => {
                info!(count = requests.len(), deferred, "Caching static assets");
                cache::add_all(
                    &self.caches,
                    &self.config.static_cache_name(),
                    self.fetcher.as_ref(),
                    &requests,
                )
                .await
            }
            Err(e) => Err(e),
        };

        match stored {
            Ok(cached) => {
                info!(cached, "Installed successfully");
                self.host.skip_waiting().await;
                InstallOutcome::Installed { cached, deferred }
            }
            Err(e) => {
                error!(error = %e, "Installation failed");
                InstallOutcome::Incomplete {
                    error: e.to_string(),
                }
            }
        }
    }

    // ==================== Activate ====================

    /// Delete every cache outside the current static/dynamic pair, then
    /// claim open pages.
    #[instrument(skip(self), fields(version = %self.config.version))]
    pub async fn activate(&self) -> Result<ActivateReport> {
        info!("Activating");
        let keep = self.config.current_cache_names();

        let deleted = {
            let mut storage = self.caches.write().await;
            let stale: Vec<String> = storage
                .keys()
                .into_iter()
                .filter(|name| !keep.iter().any(|k| k.as_str() == *name))
                .map(str::to_string)
                .collect();
            for name in &stale {
                info!(cache = %name, "Deleting old cache");
                storage.delete(name);
            }
            stale
        };

        let claimed = self.host.claim_clients().await?;
        info!(deleted = deleted.len(), claimed, "Activated successfully");
        Ok(ActivateReport { deleted, claimed })
    }

    // ==================== Fetch ====================

    /// Answer a request: cache, then network (populating the dynamic
    /// cache), then the offline page, then a synthesized 503.
    ///
    /// The dynamic-cache write runs after the response is returned and is
    /// registered on `event`.
    pub async fn fetch(&self, request: Request, event: &ExtendableEvent) -> FetchOutcome {
        if request.method != Method::GET || !request.is_network_scheme() {
            debug!(url = %request.url, method = %request.method, "Not intercepting");
            return FetchOutcome::Bypass;
        }

        let cached = self
            .caches
            .read()
            .await
            .match_request(&request)
            .map(|entry| entry.to_response());
        if let Some(response) = cached {
            debug!(url = %request.url, "Serving from cache");
            return FetchOutcome::Respond {
                response,
                source: ResponseSource::Cache,
            };
        }

        debug!(url = %request.url, "Fetching from network");
        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                if response.status == StatusCode::OK && response.response_type != ResponseType::Error
                {
                    self.store_dynamic(request, response.clone(), event);
                }
                FetchOutcome::Respond {
                    response,
                    source: ResponseSource::Network,
                }
            }
            Err(e) => {
                error!(url = %request.url, error = %e, "Fetch failed");
                self.offline_fallback().await
            }
        }
    }

    fn store_dynamic(&self, request: Request, response: Response, event: &ExtendableEvent) {
        let caches = self.caches.clone();
        let name = self.config.dynamic_cache_name();
        event.wait_until(async move {
            caches.write().await.open(&name).put(&request, &response)?;
            debug!(url = %request.url, cache = %name, "Cached network response");
            Ok(())
        });
    }

    async fn offline_fallback(&self) -> FetchOutcome {
        let page = match self.config.resolve(&self.config.offline_page) {
            Ok(url) => self
                .caches
                .read()
                .await
                .match_request(&Request::get(url))
                .map(|entry| entry.to_response()),
            Err(e) => {
                warn!(error = %e, page = %self.config.offline_page, "Bad offline page path");
                None
            }
        };

        match page {
            Some(response) => FetchOutcome::Respond {
                response,
                source: ResponseSource::OfflinePage,
            },
            None => FetchOutcome::Respond {
                response: Response::service_unavailable(OFFLINE_TEXT),
                source: ResponseSource::Synthesized,
            },
        }
    }

    // ==================== Sync ====================

    /// Run the sync task for `tag`. Unknown tags are ignored.
    pub async fn sync(&self, tag: &str) -> Result<usize> {
        info!(tag, "Background sync triggered");
        if tag != self.config.sync_tag {
            debug!(tag, "No handler for sync tag");
            return Ok(0);
        }
        self.sync_queue.drain().await.map_err(|e| {
            error!(error = %e, "Sync failed");
            e
        })
    }

    // ==================== Push ====================

    /// Display a notification for a push message.
    pub async fn push(&self, data: Option<&[u8]>) -> Result<Notification> {
        info!("Push notification received");
        let notification = PushPayload::parse(data).into_notification(&self.config.notifications);
        self.host.show_notification(notification.clone()).await?;
        Ok(notification)
    }

    /// Close the notification; open its target unless the action was
    /// something other than "open".
    pub async fn notification_click(
        &self,
        notification: &Notification,
        action: Option<&str>,
    ) -> Result<Option<Client>> {
        info!(action = ?action, "Notification clicked");
        self.host.close_notification(notification.id).await;

        match notification.click_target(action) {
            Some(target) => {
                let url = self.config.resolve(target)?;
                Ok(Some(self.host.open_window(url).await?))
            }
            None => Ok(None),
        }
    }

    // ==================== Message ====================

    /// Dispatch a page message. Work is registered on `event`; nothing is
    /// sent back to the page.
    pub fn message(&self, data: &JsonValue, event: &ExtendableEvent) -> Option<ClientMessage> {
        info!(data = %data, "Message received");
        let message = ClientMessage::parse(data)?;

        match message {
            ClientMessage::SkipWaiting => {
                let host = self.host.clone();
                event.wait_until(async move {
                    host.skip_waiting().await;
                    Ok(())
                });
            }
            ClientMessage::CacheUrls { ref urls } => {
                let requests: Vec<Result<Url>> =
                    urls.iter().map(|u| self.config.resolve(u)).collect();
                let caches = self.caches.clone();
                let fetcher = self.fetcher.clone();
                let name = self.config.dynamic_cache_name();
                event.wait_until(async move {
                    let requests = requests
                        .into_iter()
                        .map(|url| url.map(Request::get))
                        .collect::<Result<Vec<_>>>()?;
                    cache::add_all(&caches, &name, fetcher.as_ref(), &requests).await?;
                    Ok(())
                });
            }
            ClientMessage::ClearCache => {
                let caches = self.caches.clone();
                event.wait_until(async move {
                    let mut storage = caches.write().await;
                    let names: Vec<String> = storage.keys().into_iter().map(str::to_string).collect();
                    for name in &names {
                        storage.delete(name);
                    }
                    info!(count = names.len(), "All caches cleared");
                    Ok(())
                });
            }
        }

        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStorage;
    use crate::container::RuntimeEvent;
    use crate::host::HostRuntime;
    use crate::manifest::AssetManifest;
    use crate::sync::StubSyncQueue;
    use async_trait::async_trait;
    use expenseflow_net::NetError;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Serves `<path>` as body; fails everything while offline.
    #[derive(Default)]
    struct FakeNetwork {
        offline: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeNetwork {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for FakeNetwork {
        async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(NetError::Offline("no route to host".to_string()));
            }
            match request.url.path() {
                "/missing" => Ok(Response::new(StatusCode::NOT_FOUND, "nope")),
                path => Ok(Response::new(StatusCode::OK, path.to_string())
                    .with_type(ResponseType::Basic)),
            }
        }
    }

    struct Fixture {
        worker: OfflineWorker,
        network: Arc<FakeNetwork>,
        host: Arc<HostRuntime>,
        _events: mpsc::UnboundedReceiver<RuntimeEvent>,
    }

    fn fixture(config: WorkerConfig) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Arc::new(HostRuntime::new(tx));
        let network = Arc::new(FakeNetwork::default());
        let worker = OfflineWorker::new(
            config,
            CacheStorage::new().shared(),
            network.clone(),
            host.clone(),
            Arc::new(StubSyncQueue),
        );
        Fixture {
            worker,
            network,
            host,
            _events: rx,
        }
    }

    fn get(url: &str) -> Request {
        Request::parse_get(url).unwrap()
    }

    #[tokio::test]
    async fn test_install_caches_only_local_assets() {
        let f = fixture(WorkerConfig::default());

        let outcome = f.worker.install().await;

        assert_eq!(
            outcome,
            InstallOutcome::Installed {
                cached: 6,
                deferred: 5
            }
        );
        assert_eq!(f.network.calls(), 6);
        assert!(f.host.skip_waiting_requested());

        let storage = f.worker.caches().read().await;
        let config = f.worker.config();
        for entry in config.static_assets.local_entries(&config.origin) {
            let url = config.resolve(entry).unwrap();
            assert!(storage.match_request(&Request::get(url)).is_some(), "{entry}");
        }
        assert!(storage
            .match_request(&get("https://cdn.jsdelivr.net/npm/chart.js"))
            .is_none());
    }

    #[tokio::test]
    async fn test_install_skips_protocol_relative_assets() {
        let config = WorkerConfig {
            static_assets: AssetManifest::new(["/", "//cdn.example.com/lib.js"]),
            ..Default::default()
        };
        let f = fixture(config);

        let outcome = f.worker.install().await;

        assert_eq!(
            outcome,
            InstallOutcome::Installed {
                cached: 1,
                deferred: 1
            }
        );
        assert_eq!(f.network.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_is_swallowed() {
        let f = fixture(WorkerConfig::default());
        f.network.offline.store(true, Ordering::SeqCst);

        let outcome = f.worker.install().await;

        assert!(matches!(outcome, InstallOutcome::Incomplete { .. }));
        assert!(!f.host.skip_waiting_requested());
        let storage = f.worker.caches().read().await;
        assert!(storage.get("expenseflow-static-v1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_fails_on_error_status() {
        let config = WorkerConfig {
            static_assets: crate::AssetManifest::new(["/", "/missing"]),
            ..Default::default()
        };
        let f = fixture(config);
        assert!(matches!(
            f.worker.install().await,
            InstallOutcome::Incomplete { .. }
        ));
    }

    #[tokio::test]
    async fn test_activate_keeps_only_current_caches() {
        let f = fixture(WorkerConfig::default());
        {
            let mut storage = f.worker.caches().write().await;
            for name in [
                "old-v1-static",
                "old-v1-dynamic",
                "expenseflow-static-v1",
                "expenseflow-dynamic-v1",
                "expenseflow-v1",
            ] {
                storage.open(name);
            }
        }

        let report = f.worker.activate().await.unwrap();

        assert_eq!(
            report.deleted,
            vec!["old-v1-static", "old-v1-dynamic", "expenseflow-v1"]
        );
        let storage = f.worker.caches().read().await;
        assert_eq!(
            storage.keys(),
            vec!["expenseflow-static-v1", "expenseflow-dynamic-v1"]
        );
        drop(storage);

        // Running again changes nothing.
        assert!(f.worker.activate().await.unwrap().deleted.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_bypasses_non_get_and_non_network() {
        let f = fixture(WorkerConfig::default());
        let event = ExtendableEvent::new("fetch");

        let post = Request::post(
            Url::parse("http://localhost:8080/api/expenses").unwrap(),
            bytes::Bytes::from_static(b"{}"),
        );
        assert!(matches!(f.worker.fetch(post, &event).await, FetchOutcome::Bypass));

        let extension = get("chrome-extension://abcdef/content.js");
        assert!(matches!(
            f.worker.fetch(extension, &event).await,
            FetchOutcome::Bypass
        ));

        assert_eq!(event.pending(), 0);
        assert_eq!(f.network.calls(), 0);
        assert!(f.worker.caches().read().await.keys().is_empty());
    }

    #[tokio::test]
    async fn test_network_response_is_cached_for_next_request() {
        let f = fixture(WorkerConfig::default());

        let event = ExtendableEvent::new("fetch");
        let first = f.worker.fetch(get("http://localhost:8080/api/summary"), &event).await;
        assert_eq!(first.source(), Some(ResponseSource::Network));
        event.settled().await.unwrap();

        let event = ExtendableEvent::new("fetch");
        let second = f.worker.fetch(get("http://localhost:8080/api/summary"), &event).await;
        assert_eq!(second.source(), Some(ResponseSource::Cache));
        assert_eq!(second.response().unwrap().text().unwrap(), "/api/summary");
        assert_eq!(f.network.calls(), 1);

        let storage = f.worker.caches().read().await;
        assert_eq!(storage.get("expenseflow-dynamic-v1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_status_is_returned_but_not_cached() {
        let f = fixture(WorkerConfig::default());
        let event = ExtendableEvent::new("fetch");

        let outcome = f.worker.fetch(get("http://localhost:8080/missing"), &event).await;

        assert_eq!(outcome.response().unwrap().status, StatusCode::NOT_FOUND);
        assert_eq!(event.pending(), 0);
        assert!(!f.worker.caches().read().await.has("expenseflow-dynamic-v1"));
    }

    #[tokio::test]
    async fn test_offline_without_fallback_page_is_503() {
        let f = fixture(WorkerConfig::default());
        f.network.offline.store(true, Ordering::SeqCst);
        let event = ExtendableEvent::new("fetch");

        let outcome = f.worker.fetch(get("http://localhost:8080/reports"), &event).await;

        assert_eq!(outcome.source(), Some(ResponseSource::Synthesized));
        let response = outcome.response().unwrap();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.text().unwrap(), "Offline");
        assert_eq!(response.content_type().unwrap().essence_str(), "text/plain");
    }

    #[tokio::test]
    async fn test_offline_serves_cached_offline_page() {
        let f = fixture(WorkerConfig::default());
        f.worker
            .caches()
            .write()
            .await
            .open("expenseflow-static-v1")
            .put(
                &get("http://localhost:8080/offline.html"),
                &Response::new(StatusCode::OK, "<p>You are offline</p>"),
            )
            .unwrap();
        f.network.offline.store(true, Ordering::SeqCst);
        let event = ExtendableEvent::new("fetch");

        let outcome = f.worker.fetch(get("http://localhost:8080/reports"), &event).await;

        assert_eq!(outcome.source(), Some(ResponseSource::OfflinePage));
        assert_eq!(
            outcome.response().unwrap().text().unwrap(),
            "<p>You are offline</p>"
        );
    }

    #[tokio::test]
    async fn test_sync_only_handles_configured_tag() {
        let f = fixture(WorkerConfig::default());
        assert_eq!(f.worker.sync("sync-expenses").await.unwrap(), 0);
        assert_eq!(f.worker.sync("sync-other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_push_then_open_click() {
        let f = fixture(WorkerConfig::default());

        let notification = f
            .worker
            .push(Some(br#"{"title":"T","body":"B","url":"/x"}"#))
            .await
            .unwrap();
        assert_eq!(notification.title, "T");
        assert_eq!(notification.options.body, "B");
        assert_eq!(f.host.notifications().await.len(), 1);

        let client = f
            .worker
            .notification_click(&notification, Some("open"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.url.as_str(), "http://localhost:8080/x");
        assert!(f.host.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn test_dismiss_click_only_closes() {
        let f = fixture(WorkerConfig::default());
        let notification = f.worker.push(None).await.unwrap();

        let opened = f
            .worker
            .notification_click(&notification, Some("dismiss"))
            .await
            .unwrap();

        assert!(opened.is_none());
        assert!(f.host.notifications().await.is_empty());
        assert_eq!(f.host.clients().read().await.match_all(true).len(), 0);
    }

    #[tokio::test]
    async fn test_malformed_push_still_notifies() {
        let f = fixture(WorkerConfig::default());
        let notification = f.worker.push(Some(b"not json")).await.unwrap();
        assert_eq!(notification.title, "ExpenseFlow");
    }

    #[tokio::test]
    async fn test_message_cache_urls_and_clear() {
        let f = fixture(WorkerConfig::default());

        let event = ExtendableEvent::new("message");
        let message = f
            .worker
            .message(&json!({ "type": "CACHE_URLS", "urls": ["/a.css", "/b.js"] }), &event);
        assert!(matches!(message, Some(ClientMessage::CacheUrls { .. })));
        event.settled().await.unwrap();
        assert!(f
            .worker
            .caches()
            .read()
            .await
            .match_request(&get("http://localhost:8080/b.js"))
            .is_some());

        let event = ExtendableEvent::new("message");
        f.worker.message(&json!({ "type": "CLEAR_CACHE" }), &event);
        event.settled().await.unwrap();
        let storage = f.worker.caches().read().await;
        assert!(storage.keys().is_empty());
        assert!(storage
            .match_request(&get("http://localhost:8080/a.css"))
            .is_none());
    }

    #[tokio::test]
    async fn test_message_skip_waiting_and_unknown() {
        let f = fixture(WorkerConfig::default());
        let event = ExtendableEvent::new("message");

        assert_eq!(f.worker.message(&json!({ "type": "PING" }), &event), None);
        assert_eq!(
            f.worker.message(&json!({ "type": "SKIP_WAITING" }), &event),
            Some(ClientMessage::SkipWaiting)
        );
        event.settled().await.unwrap();
        assert!(f.host.skip_waiting_requested());
    }
}
