//! Static asset manifest.

use serde::{Deserialize, Serialize};
use url::Url;

/// Assets required for offline bootstrap of ExpenseFlow.
pub const DEFAULT_STATIC_ASSETS: &[&str] = &[
    "/",
    "/index.html",
    "/expense-management-pwa.html",
    "/manifest.json",
    "/icon-192.png",
    "/icon-512.png",
    "https://fonts.googleapis.com/css2?family=DM+Sans:wght@400;500;600;700&family=Space+Mono:wght@400;700&display=swap",
    "https://unpkg.com/react@18/umd/react.production.min.js",
    "https://unpkg.com/react-dom@18/umd/react-dom.production.min.js",
    "https://unpkg.com/@babel/standalone/babel.min.js",
    "https://cdn.jsdelivr.net/npm/chart.js",
];

/// Where a manifest entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetLocation {
    /// Relative path on the worker's origin, fetched eagerly at install.
    Local,
    /// Absolute URL, or a relative one that leaves the origin; left to the
    /// dynamic cache.
    Remote,
}

impl AssetLocation {
    /// Classify a manifest entry relative to `origin`.
    ///
    /// Entries that fail to resolve stay `Local` so install reports them.
    pub fn of(entry: &str, origin: &Url) -> Self {
        let lower = entry.trim_start().to_ascii_lowercase();
        if lower.starts_with("http:") || lower.starts_with("https:") {
            return Self::Remote;
        }
        match origin.join(entry) {
            Ok(url) if url.origin() != origin.origin() => Self::Remote,
            _ => Self::Local,
        }
    }
}

/// Fixed, ordered list of URLs needed offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetManifest {
    entries: Vec<String>,
}

impl AssetManifest {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Entries fetched at install time, in manifest order.
    pub fn local_entries<'a>(&'a self, origin: &'a Url) -> impl Iterator<Item = &'a str> {
        self.by_location(origin, AssetLocation::Local)
    }

    /// Entries skipped at install time.
    pub fn remote_entries<'a>(&'a self, origin: &'a Url) -> impl Iterator<Item = &'a str> {
        self.by_location(origin, AssetLocation::Remote)
    }

    fn by_location<'a>(
        &'a self,
        origin: &'a Url,
        location: AssetLocation,
    ) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .map(String::as_str)
            .filter(move |e| AssetLocation::of(e, origin) == location)
    }
}

impl Default for AssetManifest {
    fn default() -> Self {
        Self::new(DEFAULT_STATIC_ASSETS.iter().copied())
    }
}
