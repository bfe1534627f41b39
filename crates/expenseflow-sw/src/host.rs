//! Host environment seen from inside the worker.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::clients::{Client, Clients};
use crate::container::RuntimeEvent;
use crate::push::{Notification, NotificationId};
use crate::Result;

/// Platform services the worker calls into.
#[async_trait]
pub trait ServiceWorkerHost: Send + Sync {
    /// Ask to activate without waiting for old pages to close.
    async fn skip_waiting(&self);

    /// Take control of already-open pages. Returns how many were claimed.
    async fn claim_clients(&self) -> Result<usize>;

    /// Open a new window at `url`.
    async fn open_window(&self, url: Url) -> Result<Client>;

    async fn show_notification(&self, notification: Notification) -> Result<()>;

    async fn close_notification(&self, id: NotificationId);
}

/// In-process host: clients, displayed notifications and the skip-waiting
/// flag. Emits a [`RuntimeEvent`] for every observable action.
#[derive(Debug)]
pub struct HostRuntime {
    clients: RwLock<Clients>,
    notifications: RwLock<Vec<Notification>>,
    skip_waiting: AtomicBool,
    event_tx: mpsc::UnboundedSender<RuntimeEvent>,
}

impl HostRuntime {
    pub fn new(event_tx: mpsc::UnboundedSender<RuntimeEvent>) -> Self {
        Self {
            clients: RwLock::new(Clients::new()),
            notifications: RwLock::new(Vec::new()),
            skip_waiting: AtomicBool::new(false),
            event_tx,
        }
    }

    pub(crate) fn emit(&self, event: RuntimeEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_skip_waiting(&self) {
        self.skip_waiting.store(false, Ordering::SeqCst);
    }

    pub fn clients(&self) -> &RwLock<Clients> {
        &self.clients
    }

    /// Notifications currently displayed.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().await.clone()
    }

    pub async fn notification(&self, id: NotificationId) -> Option<Notification> {
        self.notifications
            .read()
            .await
            .iter()
            .find(|n| n.id == id)
            .cloned()
    }
}

#[async_trait]
impl ServiceWorkerHost for HostRuntime {
    async fn skip_waiting(&self) {
        debug!("Skip waiting requested");
        self.skip_waiting.store(true, Ordering::SeqCst);
        self.emit(RuntimeEvent::SkipWaitingRequested);
    }

    async fn claim_clients(&self) -> Result<usize> {
        let claimed = self.clients.write().await.claim();
        info!(claimed, "Clients claimed");
        self.emit(RuntimeEvent::ControllerChange { claimed });
        Ok(claimed)
    }

    async fn open_window(&self, url: Url) -> Result<Client> {
        let client = self.clients.write().await.open_window(url);
        info!(url = %client.url, client = %client.id, "Window opened");
        self.emit(RuntimeEvent::WindowOpened {
            url: client.url.clone(),
        });
        Ok(client)
    }

    async fn show_notification(&self, notification: Notification) -> Result<()> {
        info!(title = %notification.title, "Showing notification");
        self.emit(RuntimeEvent::NotificationShown {
            id: notification.id,
            title: notification.title.clone(),
        });
        self.notifications.write().await.push(notification);
        Ok(())
    }

    async fn close_notification(&self, id: NotificationId) {
        self.notifications.write().await.retain(|n| n.id != id);
        self.emit(RuntimeEvent::NotificationClosed { id });
    }
}
