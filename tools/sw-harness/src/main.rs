//! Command-line harness for the ExpenseFlow offline worker.
//!
//! Each run loads the persisted cache snapshot, brings up a worker for the
//! configured origin, dispatches one event and writes the caches back.
//!
//! ## Usage
//!
//! ```bash
//! # Install the configured version and precache its assets
//! sw-harness --config worker.json install
//!
//! # Route a request through the active worker, with the network cut
//! sw-harness fetch /api/expenses --offline
//!
//! # Deliver a push, then click "open" on the notification
//! sw-harness click --data '{"title":"Budget","url":"/reports"}' --action open
//!
//! # Post a page message
//! sw-harness message '{"type":"CLEAR_CACHE"}'
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use expenseflow_common::{init_logging, LogConfig, LogFormat};
use expenseflow_net::{Fetcher, HttpFetcher, LoaderConfig, NetError, Request, Response};
use expenseflow_sw::{
    CacheStorage, FetchOutcome, InstallOutcome, RuntimeEvent, ServiceWorkerContainer,
    ServiceWorkerError, WorkerConfig,
};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Parser)]
#[command(name = "sw-harness")]
#[command(about = "Drive the ExpenseFlow offline worker from the command line")]
struct Cli {
    /// Worker configuration (JSON); built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Cache snapshot file
    #[arg(short, long, global = true, default_value = ".expenseflow/caches.json")]
    store: PathBuf,
    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the configured version
    Install,

    /// Route a GET request through the active worker
    Fetch {
        /// Absolute URL or path relative to the origin
        url: String,
        /// Fail every network request
        #[arg(long)]
        offline: bool,
        /// Print the response body
        #[arg(long)]
        body: bool,
    },

    /// Deliver a push message
    Push {
        /// Push payload (JSON)
        #[arg(long)]
        data: Option<String>,
    },

    /// Deliver a push message, then click its notification
    Click {
        /// Push payload (JSON)
        #[arg(long)]
        data: Option<String>,
        /// Action id; omit for a click on the notification body
        #[arg(long)]
        action: Option<String>,
    },

    /// Post a message from a page
    Message {
        /// Message (JSON), e.g. {"type":"SKIP_WAITING"}
        json: String,
    },

    /// Fire a background sync event
    Sync {
        /// Sync tag; the configured tag when omitted
        #[arg(long)]
        tag: Option<String>,
    },

    /// List stored caches
    Caches,
}

#[derive(Debug, Error)]
enum HarnessError {
    #[error(transparent)]
    Worker(#[from] ServiceWorkerError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, HarnessError>;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(cli.log_format));

    let output = run(cli).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<JsonValue> {
    let config = match cli.config {
        Some(ref path) => WorkerConfig::from_json_file(path)?,
        None => WorkerConfig::default(),
    };
    let storage = CacheStorage::load(&cli.store).await?;
    let (container, events) = ServiceWorkerContainer::with_storage(config.origin.clone(), storage);
    let session = Session {
        config,
        container,
        events,
    };

    let output = match cli.command {
        Commands::Install => session.install().await?,
        Commands::Fetch { url, offline, body } => session.fetch(&url, offline, body).await?,
        Commands::Push { data } => {
            session.resume(false).await?;
            let notification = session.container.dispatch_push(payload(&data)).await?;
            serde_json::to_value(notification)?
        }
        Commands::Click { data, action } => {
            session.resume(false).await?;
            let notification = session.container.dispatch_push(payload(&data)).await?;
            let opened = session
                .container
                .dispatch_notification_click(notification.id, action.as_deref())
                .await?;
            json!({
                "notification": notification,
                "opened": opened.map(|client| client.url.to_string()),
            })
        }
        Commands::Message { json } => {
            let data: JsonValue = serde_json::from_str(&json)?;
            session.resume(false).await?;
            let message = session.container.dispatch_message(&data).await?;
            json!({ "handled": message })
        }
        Commands::Sync { tag } => {
            session.resume(false).await?;
            let tag = tag.unwrap_or_else(|| session.config.sync_tag.clone());
            let synced = session.container.dispatch_sync(&tag).await?;
            json!({ "tag": tag, "synced": synced })
        }
        Commands::Caches => session.caches().await,
    };

    session.save(&cli.store).await?;
    session.drain_events();
    Ok(output)
}

fn payload(data: &Option<String>) -> Option<&[u8]> {
    data.as_deref().map(str::as_bytes)
}

struct Session {
    config: WorkerConfig,
    container: ServiceWorkerContainer,
    events: mpsc::UnboundedReceiver<RuntimeEvent>,
}

impl Session {
    fn fetcher(&self, offline: bool) -> Result<Arc<dyn Fetcher>> {
        if offline {
            return Ok(Arc::new(Disconnected));
        }
        let fetcher = HttpFetcher::new(LoaderConfig {
            origin: Some(self.config.origin.clone()),
            ..Default::default()
        })?;
        Ok(Arc::new(fetcher))
    }

    /// Reinstate the configured version as the active worker.
    async fn resume(&self, offline: bool) -> Result<()> {
        let worker = self.container.worker(self.config.clone(), self.fetcher(offline)?);
        self.container.resume(worker).await?;
        Ok(())
    }

    async fn install(&self) -> Result<JsonValue> {
        let worker = self.container.worker(self.config.clone(), self.fetcher(false)?);
        let (_, outcome) = self.container.install(worker).await?;
        let mut output = match outcome {
            InstallOutcome::Installed { cached, deferred } => {
                json!({ "installed": true, "cached": cached, "deferred": deferred })
            }
            InstallOutcome::Incomplete { error } => json!({ "installed": false, "error": error }),
        };
        output["caches"] = self.caches().await;
        Ok(output)
    }

    async fn fetch(&self, url: &str, offline: bool, with_body: bool) -> Result<JsonValue> {
        self.resume(offline).await?;
        let request = Request::get(self.config.resolve(url)?);
        let outcome = self.container.dispatch_fetch(request).await;
        self.container.idle().await?;

        let output = match outcome {
            FetchOutcome::Bypass => json!({ "intercepted": false }),
            FetchOutcome::Respond { response, source } => {
                let mut output = json!({
                    "intercepted": true,
                    "source": format!("{source:?}"),
                    "status": response.status.as_u16(),
                    "content_type": response.content_type().map(|m| m.to_string()),
                    "bytes": response.body().len(),
                });
                if with_body {
                    output["body"] = JsonValue::String(String::from_utf8_lossy(response.body()).into_owned());
                }
                output
            }
        };
        Ok(output)
    }

    async fn caches(&self) -> JsonValue {
        let snapshot = self.container.caches().read().await.snapshot();
        snapshot
            .caches
            .iter()
            .map(|cache| {
                let mut entries: Vec<_> = cache
                    .entries
                    .iter()
                    .map(|entry| {
                        json!({
                            "method": entry.method,
                            "url": entry.url,
                            "status": entry.status,
                            "bytes": entry.body.len(),
                            "cached_at": entry.cached_at,
                        })
                    })
                    .collect();
                entries.sort_by(|a, b| a["url"].as_str().cmp(&b["url"].as_str()));
                json!({ "name": cache.name, "entries": entries })
            })
            .collect()
    }

    async fn save(&self, store: &Path) -> Result<()> {
        if let Some(dir) = store.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        self.container.caches().read().await.save(store).await?;
        Ok(())
    }

    fn drain_events(mut self) {
        while let Ok(event) = self.events.try_recv() {
            debug!(?event, "Runtime event");
        }
    }
}

/// Fetcher for `--offline`: every request fails as if the host had no
/// connectivity.
struct Disconnected;

#[async_trait]
impl Fetcher for Disconnected {
    async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetError> {
        Err(NetError::Offline(request.url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_fetch() {
        let cli = Cli::try_parse_from([
            "sw-harness",
            "--log-format",
            "json",
            "fetch",
            "/api/expenses",
            "--offline",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Fetch { ref url, offline: true, body: false } if url == "/api/expenses"
        ));
    }

    #[test]
    fn test_cli_rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["sw-harness", "--log-format", "xml", "caches"]).is_err());
    }

    #[tokio::test]
    async fn test_offline_fetch_with_empty_store_is_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "sw-harness",
            "--store",
            dir.path().join("caches.json").to_str().unwrap(),
            "fetch",
            "/reports",
            "--offline",
        ])
        .unwrap();

        let output = run(cli).await.unwrap();

        assert_eq!(output["source"], "Synthesized");
        assert_eq!(output["status"], 503);
        assert!(dir.path().join("caches.json").exists());
    }

    #[tokio::test]
    async fn test_message_then_caches() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("nested").join("caches.json");
        let store = store.to_str().unwrap();

        let cli = Cli::try_parse_from([
            "sw-harness",
            "--store",
            store,
            "message",
            r#"{"type":"CLEAR_CACHE"}"#,
        ])
        .unwrap();
        let output = run(cli).await.unwrap();
        assert_eq!(output["handled"]["type"], "CLEAR_CACHE");

        let cli = Cli::try_parse_from(["sw-harness", "--store", store, "caches"]).unwrap();
        assert_eq!(run(cli).await.unwrap(), json!([]));
    }
}
