//! Clients API: pages the worker can see and control.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
}

/// A client (open page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Whether the active worker controls this client.
    pub controlled: bool,
}

/// Clients known to the host.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Match all clients.
    pub fn match_all(&self, include_uncontrolled: bool) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| include_uncontrolled || c.controlled)
            .collect()
    }

    pub fn controlled_count(&self) -> usize {
        self.clients.values().filter(|c| c.controlled).count()
    }

    /// Open a focused window; it is controlled from its first request.
    pub fn open_window(&mut self, url: Url) -> Client {
        let client = Client {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            focused: true,
            controlled: true,
        };

        for other in self.clients.values_mut() {
            other.focused = false;
        }
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Track a page that was opened before any worker controlled it.
    pub fn connect(&mut self, url: Url) -> Client {
        self.attach(url, false)
    }

    /// Track a page loaded while an active worker exists.
    pub fn connect_controlled(&mut self, url: Url) -> Client {
        self.attach(url, true)
    }

    fn attach(&mut self, url: Url, controlled: bool) -> Client {
        let client = Client {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controlled,
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Take control of every client. Returns how many were newly claimed.
    pub fn claim(&mut self) -> usize {
        self.clients
            .values_mut()
            .filter(|c| !c.controlled)
            .map(|c| c.controlled = true)
            .count()
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
