//! Configuration file watching with debounced reload
//!
//! The watcher observes the directory containing the configuration file
//! and filters events down to the target basename, so atomic rename-based
//! editors are caught. Events are debounced; reads are retried briefly
//! because the file may still be mid-write when the event fires. A parse
//! failure keeps the current configuration in place.

use crate::config::{discover_format, parse_config, Config};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(300);
const READ_RETRIES: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(80);

/// Start watching the configuration file; `on_reload` runs with each
/// successfully parsed new configuration.
///
/// The returned watcher must be kept alive for events to keep flowing.
pub fn watch_config<F>(path: &Path, on_reload: F) -> anyhow::Result<RecommendedWatcher>
where
    F: Fn(Config) + Send + Sync + 'static,
{
    let path = path.to_path_buf();
    let file_name = path
        .file_name()
        .map(OsString::from)
        .ok_or_else(|| anyhow::anyhow!("config path has no file name: {}", path.display()))?;
    let dir: PathBuf = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (tx, rx) = mpsc::channel::<Event>(100);
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) => {
                let _ = tx.blocking_send(event);
            }
            Err(e) => error!(error = %e, "config watch error"),
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "watching configuration file");

    tokio::spawn(watch_loop(rx, path, file_name, on_reload));

    Ok(watcher)
}

async fn watch_loop<F>(
    mut rx: mpsc::Receiver<Event>,
    path: PathBuf,
    file_name: OsString,
    on_reload: F,
) where
    F: Fn(Config) + Send + Sync + 'static,
{
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let wake = deadline
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(event) => {
                    if is_relevant(&event, &file_name) {
                        debug!(kind = ?event.kind, "config change detected");
                        deadline = Some(tokio::time::Instant::now() + DEBOUNCE);
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                deadline = None;
                match reload(&path).await {
                    Ok(config) => {
                        info!(path = %path.display(), "configuration reloaded");
                        on_reload(config);
                    }
                    Err(e) => warn!(
                        path = %path.display(),
                        error = %e,
                        "config reload failed, keeping current configuration"
                    ),
                }
            }
        }
    }
}

/// Writes, creates and renames targeting the watched basename count.
fn is_relevant(event: &Event, file_name: &OsString) -> bool {
    let kind_matches = matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Any
    );
    kind_matches
        && event
            .paths
            .iter()
            .any(|p| p.file_name().map(|n| n == file_name.as_os_str()).unwrap_or(false))
}

/// Read and parse the config, retrying briefly around atomic swaps.
async fn reload(path: &Path) -> anyhow::Result<Config> {
    let format = discover_format(path)?;
    let mut last_err = None;
    for attempt in 0..READ_RETRIES {
        match tokio::fs::read(path).await {
            Ok(content) => match parse_config(&content, format) {
                Ok(config) => return Ok(config),
                Err(e) => last_err = Some(e),
            },
            Err(e) => last_err = Some(e.into()),
        }
        if attempt + 1 < READ_RETRIES {
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("config reload failed")))
}
