//! Config hot-reload.
//!
//! Watches the config file and re-runs the full load pipeline (parse,
//! validate, migrate when legacy, normalize) on every change. A bad edit
//! never takes down a running gateway: the active snapshot stays in place
//! and the diagnostics land in the log, one hint line per problem.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config;
use crate::config_ref::ConfigRef;
use crate::{Error, Result};

/// File watcher that reloads the gateway config on changes.
///
/// Holds the underlying `notify` watcher alive for the lifetime of the
/// struct.
pub struct ConfigWatcher {
    /// Kept alive to prevent the OS watcher from being dropped.
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigWatcher {
    /// Start watching `config_path` for changes.
    ///
    /// Spawns a debounced background task that re-runs the load pipeline and
    /// installs the result into `config_ref` on each detected change.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `notify` watcher cannot be created.
    pub fn start(
        config_path: PathBuf,
        config_ref: ConfigRef,
        shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(32);

        let watcher = Self::create_notify_watcher(event_tx, &config_path)?;

        Self::spawn_reload_task(config_path, config_ref, event_rx, shutdown_rx);

        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Create the low-level `notify` watcher.
    ///
    /// Watches the parent directory rather than the file itself: editors
    /// that save by rename-and-replace would otherwise detach the watch
    /// after the first edit.
    fn create_notify_watcher(
        event_tx: tokio::sync::mpsc::Sender<()>,
        config_path: &Path,
    ) -> Result<RecommendedWatcher> {
        let watch_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        // Clone into an owned PathBuf for the move closure.
        let path_for_closure = config_path.to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let is_relevant = result
                    .as_ref()
                    .is_ok_and(|e| is_config_event(e, &path_for_closure));
                if is_relevant {
                    let _ = event_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::internal(format!("Failed to create config watcher: {e}")))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::internal(format!("Failed to watch config path: {e}")))?;

        Ok(watcher)
    }

    /// Spawn the debounced reload task.
    fn spawn_reload_task(
        config_path: PathBuf,
        config_ref: ConfigRef,
        mut event_rx: tokio::sync::mpsc::Receiver<()>,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            const DEBOUNCE: Duration = Duration::from_millis(500);
            let mut last_event: Option<Instant> = None;
            let mut pending = false;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        last_event = Some(Instant::now());
                        pending = true;
                    }
                    _ = ticker.tick() => {
                        if pending && last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                            pending = false;
                            last_event = None;
                            reload_once(&config_path, &config_ref).await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Config watcher shutting down");
                        break;
                    }
                }
            }
        });
    }
}

/// Returns `true` for create/modify events on the watched config file.
fn is_config_event(event: &Event, config_path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| p == config_path)
}

/// Run the load pipeline once and install the result.
///
/// Used for the initial load at startup and for every watched change. On
/// failure the currently-installed snapshot (possibly none) stays active.
pub async fn reload_once(config_path: &Path, config_ref: &ConfigRef) {
    info!(path = %config_path.display(), "Loading config");
    match config::load_file(config_path).await {
        Ok(new_config) => {
            config_ref.set(Some(Arc::new(new_config)));
            info!("Config loaded");
        }
        Err(e) => log_config_error(&e),
    }
}

/// One warning line per schema leaf, so an operator can fix every problem
/// in a single edit. Policy violations are not shape problems and log at
/// error instead.
fn log_config_error(e: &Error) {
    match e {
        Error::ConfigShape(errors) => {
            warn!("Invalid config");
            for leaf in errors.leaves() {
                warn!("config error hint: {}", leaf.to_hint());
            }
        }
        Error::ConfigPolicy(message) => error!("Config rejected: {message}"),
        _ => warn!(error = %e, "Failed to load config"),
    }
}
