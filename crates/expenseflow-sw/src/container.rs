//! Registration-side runtime: drives workers through their lifecycle and
//! dispatches events to the right version.

use std::sync::Arc;

use expenseflow_common::{retry_with_backoff, with_timeout};
use expenseflow_net::{Fetcher, Request};
use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, SharedCaches};
use crate::clients::Client;
use crate::config::WorkerConfig;
use crate::event::ExtendableEvent;
use crate::host::{HostRuntime, ServiceWorkerHost};
use crate::lifecycle::{Registration, ServiceWorkerId, ServiceWorkerState};
use crate::message::ClientMessage;
use crate::push::{Notification, NotificationId};
use crate::sync::{StubSyncQueue, SyncQueue};
use crate::worker::{ActivateReport, FetchOutcome, InstallOutcome, OfflineWorker};
use crate::{Result, ServiceWorkerError};

/// Observable runtime events.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A new version started installing.
    UpdateFound {
        worker_id: ServiceWorkerId,
        version: String,
    },
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A worker asked to skip the waiting phase.
    SkipWaitingRequested,
    /// Open pages were taken under control.
    ControllerChange { claimed: usize },
    WindowOpened { url: Url },
    NotificationShown { id: NotificationId, title: String },
    NotificationClosed { id: NotificationId },
}

/// One registration scope and the worker versions under it.
pub struct ServiceWorkerContainer {
    /// Installing / waiting / active bookkeeping.
    registration: RwLock<Registration>,

    /// Live worker versions by ID.
    workers: RwLock<HashMap<ServiceWorkerId, Arc<OfflineWorker>>>,

    /// Cache storage shared by every version.
    caches: SharedCaches,

    host: Arc<HostRuntime>,

    /// Fetch events whose extensions have not been awaited yet.
    in_flight: Mutex<InFlight>,
}

/// Fetch events with outstanding work, plus the first failure among
/// events already released.
#[derive(Default)]
struct InFlight {
    events: Vec<Arc<ExtendableEvent>>,
    failure: Option<ServiceWorkerError>,
}

impl InFlight {
    /// Release events whose work has finished.
    fn prune(&mut self) {
        let failure = &mut self.failure;
        self.events.retain(|event| match event.try_settled() {
            None => true,
            Some(Ok(())) => false,
            Some(Err(e)) => {
                failure.get_or_insert(e);
                false
            }
        });
    }
}

impl ServiceWorkerContainer {
    /// Create a container for `scope` with empty cache storage.
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<RuntimeEvent>) {
        Self::with_storage(scope, CacheStorage::new())
    }

    /// Create a container over previously persisted cache storage.
    pub fn with_storage(
        scope: Url,
        storage: CacheStorage,
    ) -> (Self, mpsc::UnboundedReceiver<RuntimeEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(Registration::new(scope)),
                workers: RwLock::new(HashMap::new()),
                caches: storage.shared(),
                host: Arc::new(HostRuntime::new(event_tx)),
                in_flight: Mutex::new(InFlight::default()),
            },
            event_rx,
        )
    }

    pub fn caches(&self) -> &SharedCaches {
        &self.caches
    }

    pub fn host(&self) -> &Arc<HostRuntime> {
        &self.host
    }

    pub fn registration(&self) -> &RwLock<Registration> {
        &self.registration
    }

    /// Build a worker bound to this container, with no sync backend.
    pub fn worker(&self, config: WorkerConfig, fetcher: Arc<dyn Fetcher>) -> OfflineWorker {
        self.worker_with_queue(config, fetcher, Arc::new(StubSyncQueue))
    }

    pub fn worker_with_queue(
        &self,
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        sync_queue: Arc<dyn SyncQueue>,
    ) -> OfflineWorker {
        let host: Arc<dyn ServiceWorkerHost> = self.host.clone();
        OfflineWorker::new(config, self.caches.clone(), fetcher, host, sync_queue)
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        debug!(worker = worker_id.raw(), state = ?new_state, "State change");
        self.host.emit(RuntimeEvent::StateChange {
            worker_id,
            new_state,
        });
    }

    // ==================== Lifecycle ====================

    /// Install a new version. It activates right away if it asked to skip
    /// waiting, if nothing is active, or if no page is controlled.
    pub async fn install(&self, worker: OfflineWorker) -> Result<(ServiceWorkerId, InstallOutcome)> {
        let version = worker.config().version.clone();
        let worker_id = {
            let mut registration = self.registration.write().await;
            let script_url = registration.scope.join("sw.js")?;
            registration.update(script_url, &version)
        };
        info!(worker = worker_id.raw(), %version, "Update found");
        self.host.emit(RuntimeEvent::UpdateFound {
            worker_id,
            version,
        });
        self.emit_state(worker_id, ServiceWorkerState::Installing);

        let worker = Arc::new(worker);
        self.host.reset_skip_waiting();
        let outcome = worker.install().await;

        {
            let mut registration = self.registration.write().await;
            if registration.installing.as_ref().map(|w| w.id) != Some(worker_id) {
                return Err(ServiceWorkerError::StateError(format!(
                    "worker {} superseded during install",
                    worker_id.raw()
                )));
            }
            registration.install_complete();
        }
        self.workers.write().await.insert(worker_id, worker);
        self.emit_state(worker_id, ServiceWorkerState::Installed);

        self.activate_if_ready().await?;
        Ok((worker_id, outcome))
    }

    /// Bring back the version that was active before a restart. Caches are
    /// expected to be loaded already.
    pub async fn resume(&self, worker: OfflineWorker) -> Result<ServiceWorkerId> {
        let version = worker.config().version.clone();
        let worker_id = {
            let mut registration = self.registration.write().await;
            let script_url = registration.scope.join("sw.js")?;
            registration.restore_active(script_url, &version)
        };
        let mut workers = self.workers.write().await;
        workers.clear();
        workers.insert(worker_id, Arc::new(worker));
        info!(worker = worker_id.raw(), %version, "Resumed active worker");
        Ok(worker_id)
    }

    /// Activate the waiting worker when nothing holds it back.
    pub async fn activate_if_ready(&self) -> Result<Option<ActivateReport>> {
        let ready = {
            let registration = self.registration.read().await;
            if registration.waiting.is_none() {
                return Ok(None);
            }
            registration.active.is_none()
                || self.host.skip_waiting_requested()
                || self.host.clients().read().await.controlled_count() == 0
        };

        if ready {
            self.activate_waiting().await
        } else {
            debug!("Waiting worker held back by controlled clients");
            Ok(None)
        }
    }

    /// Promote the waiting worker and run its activate handler.
    ///
    /// The worker ends up active even when its handler fails; the error is
    /// still returned.
    pub async fn activate_waiting(&self) -> Result<Option<ActivateReport>> {
        let worker_id = {
            let mut registration = self.registration.write().await;
            let Some(worker_id) = registration.begin_activation() else {
                return Ok(None);
            };
            worker_id
        };
        self.host.reset_skip_waiting();
        self.emit_state(worker_id, ServiceWorkerState::Activating);

        let worker = {
            let mut workers = self.workers.write().await;
            workers.retain(|id, _| *id == worker_id);
            workers.get(&worker_id).cloned()
        }
        .ok_or_else(|| ServiceWorkerError::NotFound(format!("worker {}", worker_id.raw())))?;

        let report = worker.activate().await;

        self.registration.write().await.activation_complete();
        self.emit_state(worker_id, ServiceWorkerState::Activated);

        match report {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                warn!(worker = worker_id.raw(), error = %e, "Activate handler failed");
                Err(e)
            }
        }
    }

    /// Drop every version. Caches are left alone.
    pub async fn unregister(&self) {
        let mut registration = self.registration.write().await;
        for worker in [&registration.active, &registration.waiting, &registration.installing]
            .into_iter()
            .flatten()
        {
            self.emit_state(worker.id, ServiceWorkerState::Redundant);
        }
        registration.unregister();
        self.workers.write().await.clear();
        info!(scope = %registration.scope, "Unregistered");
    }

    async fn worker_in(&self, slot: Slot) -> Option<Arc<OfflineWorker>> {
        let id = {
            let registration = self.registration.read().await;
            let worker = match slot {
                Slot::Active => registration.active.as_ref(),
                Slot::WaitingOrActive => registration
                    .waiting
                    .as_ref()
                    .or(registration.active.as_ref()),
            };
            worker?.id
        };
        self.workers.read().await.get(&id).cloned()
    }

    pub async fn active_worker(&self) -> Option<Arc<OfflineWorker>> {
        self.worker_in(Slot::Active).await
    }

    async fn require_active(&self) -> Result<Arc<OfflineWorker>> {
        self.active_worker()
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound("no active worker".to_string()))
    }

    // ==================== Clients ====================

    /// A page in scope was loaded. It is controlled only if a worker is
    /// already active.
    pub async fn connect_client(&self, url: Url) -> Client {
        let controlled = self.registration.read().await.active.is_some();
        let mut clients = self.host.clients().write().await;
        if controlled {
            clients.connect_controlled(url)
        } else {
            clients.connect(url)
        }
    }

    /// A page closed. May unblock a waiting worker.
    pub async fn disconnect_client(&self, id: &str) -> Result<Option<ActivateReport>> {
        self.host.clients().write().await.remove(id);
        self.activate_if_ready().await
    }

    // ==================== Functional events ====================

    /// Fetch events still holding unfinished or unreported work.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.events.len()
    }

    /// Route a request through the active worker. Without one, the request
    /// is not intercepted.
    pub async fn dispatch_fetch(&self, request: Request) -> FetchOutcome {
        let Some(worker) = self.active_worker().await else {
            return FetchOutcome::Bypass;
        };

        let event = Arc::new(ExtendableEvent::new("fetch"));
        let outcome = worker.fetch(request, &event).await;
        let mut in_flight = self.in_flight.lock().await;
        in_flight.prune();
        if event.pending() > 0 {
            in_flight.events.push(event);
        }
        outcome
    }

    /// Wait for work extended by earlier fetch events.
    pub async fn idle(&self) -> Result<()> {
        let (events, mut first_error) = {
            let mut in_flight = self.in_flight.lock().await;
            (std::mem::take(&mut in_flight.events), in_flight.failure.take())
        };
        for event in events {
            if let Err(e) = event.settled().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Deliver a page message to the waiting worker, else the active one.
    pub async fn dispatch_message(&self, data: &JsonValue) -> Result<Option<ClientMessage>> {
        let Some(worker) = self.worker_in(Slot::WaitingOrActive).await else {
            warn!("Message dropped: no worker");
            return Ok(None);
        };

        let event = ExtendableEvent::new("message");
        let message = worker.message(data, &event);
        event.settled().await?;

        if message == Some(ClientMessage::SkipWaiting) {
            self.activate_if_ready().await?;
        }
        Ok(message)
    }

    /// Fire a sync event, retrying retryable failures with backoff. Each
    /// attempt is bounded by the configured timeout.
    pub async fn dispatch_sync(&self, tag: &str) -> Result<usize> {
        let worker = self.require_active().await?;
        let settings = &worker.config().sync_retry;
        let retry = settings.retry_config();
        let timeout = settings.attempt_timeout();

        retry_with_backoff(
            &retry,
            || {
                let worker = worker.clone();
                async move {
                    match with_timeout(timeout, || worker.sync(tag)).await {
                        Ok(result) => result,
                        Err(e) => Err(e.into()),
                    }
                }
            },
            ServiceWorkerError::is_retryable,
        )
        .await
    }

    pub async fn dispatch_push(&self, data: Option<&[u8]>) -> Result<Notification> {
        self.require_active().await?.push(data).await
    }

    /// Deliver a click on a displayed notification.
    pub async fn dispatch_notification_click(
        &self,
        id: NotificationId,
        action: Option<&str>,
    ) -> Result<Option<Client>> {
        let notification = self
            .host
            .notification(id)
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("notification {}", id.raw())))?;
        self.require_active()
            .await?
            .notification_click(&notification, action)
            .await
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Active,
    WaitingOrActive,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use expenseflow_net::{NetError, Response};
    use http::StatusCode;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct EchoNetwork {
        offline: AtomicBool,
    }

    #[async_trait]
    impl Fetcher for EchoNetwork {
        async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(NetError::Offline("down".to_string()));
            }
            Ok(Response::new(StatusCode::OK, request.url.path().to_string()))
        }
    }

    /// Fails the first `failures` drains.
    struct FlakyQueue {
        failures: usize,
        drains: AtomicUsize,
    }

    #[async_trait]
    impl SyncQueue for FlakyQueue {
        async fn pending(&self) -> Result<Vec<JsonValue>> {
            let attempt = self.drains.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(ServiceWorkerError::SyncError("backend down".to_string()));
            }
            Ok(vec![json!({ "amount": 12 })])
        }

        async fn submit(&self, _records: &[JsonValue]) -> Result<()> {
            Ok(())
        }

        async fn clear(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Queue whose store is unreadable; retrying cannot help.
    #[derive(Default)]
    struct CorruptQueue {
        drains: AtomicUsize,
    }

    #[async_trait]
    impl SyncQueue for CorruptQueue {
        async fn pending(&self) -> Result<Vec<JsonValue>> {
            self.drains.fetch_add(1, Ordering::SeqCst);
            Err(ServiceWorkerError::CacheError("queue store unreadable".to_string()))
        }

        async fn submit(&self, _records: &[JsonValue]) -> Result<()> {
            Ok(())
        }

        async fn clear(&self) -> Result<()> {
            Ok(())
        }
    }

    fn scope() -> Url {
        Url::parse("http://localhost:8080/").unwrap()
    }

    fn config(version: &str) -> WorkerConfig {
        WorkerConfig {
            version: version.to_string(),
            ..Default::default()
        }
    }

    fn fast_retry(mut config: WorkerConfig) -> WorkerConfig {
        config.sync_retry.initial_delay_ms = 1;
        config.sync_retry.max_delay_ms = 2;
        config
    }

    #[tokio::test]
    async fn test_first_install_activates_and_emits_lifecycle() {
        let (container, mut rx) = ServiceWorkerContainer::new(scope());
        let network = Arc::new(EchoNetwork::default());

        let (id, outcome) = container
            .install(container.worker(config("v1"), network))
            .await
            .unwrap();

        assert!(matches!(outcome, InstallOutcome::Installed { .. }));
        let registration = container.registration().read().await;
        let active = registration.active.as_ref().unwrap();
        assert_eq!(active.id, id);
        assert_eq!(active.state, ServiceWorkerState::Activated);
        drop(registration);

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RuntimeEvent::StateChange { new_state, .. } = event {
                states.push(new_state);
            }
        }
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_install_still_activates() {
        let (container, _rx) = ServiceWorkerContainer::new(scope());
        let network = Arc::new(EchoNetwork::default());
        network.offline.store(true, Ordering::SeqCst);

        let (_, outcome) = container
            .install(container.worker(config("v1"), network))
            .await
            .unwrap();

        assert!(matches!(outcome, InstallOutcome::Incomplete { .. }));
        assert!(container.active_worker().await.is_some());
    }

    #[tokio::test]
    async fn test_update_replaces_version_and_purges_old_caches() {
        let (container, _rx) = ServiceWorkerContainer::new(scope());
        let network: Arc<dyn Fetcher> = Arc::new(EchoNetwork::default());

        container
            .install(container.worker(config("v1"), network.clone()))
            .await
            .unwrap();
        container.connect_client(scope()).await;
        container
            .dispatch_fetch(Request::parse_get("http://localhost:8080/api/x").unwrap())
            .await;
        container.idle().await.unwrap();

        container
            .install(container.worker(config("v2"), network))
            .await
            .unwrap();

        let active = container.active_worker().await.unwrap();
        assert_eq!(active.config().version, "v2");
        assert_eq!(
            container.caches().read().await.keys(),
            vec!["expenseflow-static-v2"]
        );
    }

    #[tokio::test]
    async fn test_message_goes_to_waiting_worker() {
        let (container, _rx) = ServiceWorkerContainer::new(scope());
        let network: Arc<dyn Fetcher> = Arc::new(EchoNetwork::default());
        container
            .install(container.worker(config("v1"), network.clone()))
            .await
            .unwrap();
        container.connect_client(scope()).await;

        // Installing v2 with an offline network leaves it waiting: it never
        // asks to skip waiting and a page is controlled.
        let offline = Arc::new(EchoNetwork::default());
        offline.offline.store(true, Ordering::SeqCst);
        let (v2, _) = container
            .install(container.worker(config("v2"), offline))
            .await
            .unwrap();
        assert_eq!(
            container.registration().read().await.waiting.as_ref().map(|w| w.id),
            Some(v2)
        );

        let message = container
            .dispatch_message(&json!({ "type": "SKIP_WAITING" }))
            .await
            .unwrap();

        assert_eq!(message, Some(ClientMessage::SkipWaiting));
        assert_eq!(container.active_worker().await.unwrap().config().version, "v2");
    }

    #[tokio::test]
    async fn test_closing_last_page_unblocks_waiting_worker() {
        let (container, _rx) = ServiceWorkerContainer::new(scope());
        let network: Arc<dyn Fetcher> = Arc::new(EchoNetwork::default());
        container
            .install(container.worker(config("v1"), network))
            .await
            .unwrap();
        let page = container.connect_client(scope()).await;
        assert!(page.controlled);

        let offline = Arc::new(EchoNetwork::default());
        offline.offline.store(true, Ordering::SeqCst);
        container
            .install(container.worker(config("v2"), offline))
            .await
            .unwrap();
        assert_eq!(container.active_worker().await.unwrap().config().version, "v1");

        let report = container.disconnect_client(&page.id).await.unwrap();
        assert!(report.is_some());
        assert_eq!(container.active_worker().await.unwrap().config().version, "v2");
    }

    #[tokio::test]
    async fn test_fetch_without_active_worker_bypasses() {
        let (container, _rx) = ServiceWorkerContainer::new(scope());
        let outcome = container
            .dispatch_fetch(Request::parse_get("http://localhost:8080/").unwrap())
            .await;
        assert!(matches!(outcome, FetchOutcome::Bypass));
    }

    #[tokio::test]
    async fn test_finished_fetch_work_is_released() {
        let (container, _rx) = ServiceWorkerContainer::new(scope());
        container
            .install(container.worker(config("v1"), Arc::new(EchoNetwork::default())))
            .await
            .unwrap();

        for i in 0..50 {
            let url = scope().join(&format!("/api/expenses/{i}")).unwrap();
            container.dispatch_fetch(Request::get(url)).await;
            tokio::task::yield_now().await;
        }

        assert!(container.in_flight().await <= 1);
        container.idle().await.unwrap();
        assert_eq!(container.in_flight().await, 0);

        let storage = container.caches().read().await;
        assert_eq!(storage.get("expenseflow-dynamic-v1").unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_sync_retries_until_queue_drains() {
        let (container, _rx) = ServiceWorkerContainer::new(scope());
        let queue = Arc::new(FlakyQueue {
            failures: 2,
            drains: AtomicUsize::new(0),
        });
        let worker = container.worker_with_queue(
            fast_retry(config("v1")),
            Arc::new(EchoNetwork::default()),
            queue.clone(),
        );
        container.install(worker).await.unwrap();

        assert_eq!(container.dispatch_sync("sync-expenses").await.unwrap(), 1);
        assert_eq!(queue.drains.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_sync_gives_up_after_max_attempts() {
        let (container, _rx) = ServiceWorkerContainer::new(scope());
        let queue = Arc::new(FlakyQueue {
            failures: usize::MAX,
            drains: AtomicUsize::new(0),
        });
        let worker = container.worker_with_queue(
            fast_retry(config("v1")),
            Arc::new(EchoNetwork::default()),
            queue.clone(),
        );
        container.install(worker).await.unwrap();

        let result = container.dispatch_sync("sync-expenses").await;
        assert!(matches!(result, Err(ServiceWorkerError::SyncError(_))));
        assert_eq!(queue.drains.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_sync_does_not_retry_permanent_failure() {
        let (container, _rx) = ServiceWorkerContainer::new(scope());
        let queue = Arc::new(CorruptQueue::default());
        let worker = container.worker_with_queue(
            fast_retry(config("v1")),
            Arc::new(EchoNetwork::default()),
            queue.clone(),
        );
        container.install(worker).await.unwrap();

        let result = container.dispatch_sync("sync-expenses").await;
        assert!(matches!(result, Err(ServiceWorkerError::CacheError(_))));
        assert_eq!(queue.drains.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_push_and_click_through_container() {
        let (container, _rx) = ServiceWorkerContainer::new(scope());
        container
            .install(container.worker(config("v1"), Arc::new(EchoNetwork::default())))
            .await
            .unwrap();

        let notification = container
            .dispatch_push(Some(br#"{"url":"/reports"}"#))
            .await
            .unwrap();
        let client = container
            .dispatch_notification_click(notification.id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.url.path(), "/reports");

        let again = container
            .dispatch_notification_click(notification.id, None)
            .await;
        assert!(matches!(again, Err(ServiceWorkerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_resume_serves_from_existing_caches() {
        let mut storage = CacheStorage::new();
        storage
            .open("expenseflow-static-v1")
            .put(
                &Request::parse_get("http://localhost:8080/").unwrap(),
                &Response::new(StatusCode::OK, "home"),
            )
            .unwrap();
        let (container, _rx) = ServiceWorkerContainer::with_storage(scope(), storage);
        let network = Arc::new(EchoNetwork::default());
        network.offline.store(true, Ordering::SeqCst);

        container
            .resume(container.worker(config("v1"), network))
            .await
            .unwrap();

        let outcome = container
            .dispatch_fetch(Request::parse_get("http://localhost:8080/").unwrap())
            .await;
        assert_eq!(outcome.response().unwrap().text().unwrap(), "home");
    }

    #[tokio::test]
    async fn test_unregister_drops_workers() {
        let (container, _rx) = ServiceWorkerContainer::new(scope());
        container
            .install(container.worker(config("v1"), Arc::new(EchoNetwork::default())))
            .await
            .unwrap();

        container.unregister().await;
        assert!(container.active_worker().await.is_none());
        assert!(matches!(
            container.dispatch_push(None).await,
            Err(ServiceWorkerError::NotFound(_))
        ));
    }
}
