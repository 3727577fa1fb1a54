//! Config hot-reload. Grounded in the teacher's `config/watcher.rs`
//! (watch the parent directory so editor write-then-rename survives,
//! debounce, reparse, broadcast) adapted to this crate's TOML format and
//! wired to the event bus instead of a bare `watch::Receiver`.

use super::Config;
use crate::bus::{Event, EventBus, EventPayload};
use crate::observability::EventKind;
use anyhow::{Context, Result};
use notify::{Event as NotifyEvent, EventKind as NotifyEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DEBOUNCE: Duration = Duration::from_millis(400);

/// Watches `config_path`'s parent directory for changes to that file,
/// reparsing and broadcasting on every settled write. Returns a
/// `watch::Receiver` carrying the latest successfully-parsed config and a
/// handle to the background task; a reload that fails to parse keeps the
/// previous config and is logged rather than propagated.
pub fn watch_config(
    config_path: &Path,
    initial: Config,
    bus: Arc<EventBus>,
) -> Result<(watch::Receiver<Config>, JoinHandle<()>)> {
    let config_path = config_path
        .canonicalize()
        .with_context(|| format!("cannot canonicalize config path: {}", config_path.display()))?;
    let parent = config_path
        .parent()
        .context("config path has no parent directory")?
        .to_path_buf();
    let filename = config_path
        .file_name()
        .context("config path has no filename")?
        .to_os_string();

    let (tx, rx) = watch::channel(initial);
    let (bridge_tx, mut bridge_rx) = tokio::sync::mpsc::channel(64);

    let mut watcher: RecommendedWatcher = Watcher::new(
        move |res| {
            let _ = bridge_tx.blocking_send(res);
        },
        notify::Config::default(),
    )
    .context("failed to create config file watcher")?;
    watcher
        .watch(&parent, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch directory: {}", parent.display()))?;

    let handle = tokio::spawn(async move {
        let _watcher = watcher;
        loop {
            let event: NotifyEvent = match bridge_rx.recv().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!(error = %e, "config watcher error");
                    continue;
                }
                None => break,
            };

            if !matches!(event.kind, NotifyEventKind::Modify(_) | NotifyEventKind::Create(_)) {
                continue;
            }
            let is_our_file = event
                .paths
                .iter()
                .any(|p| p.file_name().is_some_and(|f| f == filename));
            if !is_our_file {
                continue;
            }

            tokio::time::sleep(DEBOUNCE).await;
            while bridge_rx.try_recv().is_ok() {}

            match reload(&config_path) {
                Ok(config) => {
                    info!("config reloaded from disk");
                    let _ = tx.send(config);
                    bus.emit(Event::new(EventKind::ConfigChanged, EventPayload::Empty));
                }
                Err(e) => warn!(error = %e, "config reload failed, keeping previous config"),
            }
        }
    });

    Ok((rx, handle))
}

fn reload(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config from {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse config from {}", path.display()))
}
