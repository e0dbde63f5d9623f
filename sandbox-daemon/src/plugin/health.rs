//! Filesystem-driven device health.
//!
//! A device is healthy while its VFIO node exists. The watcher follows the
//! device node directory and the kubelet socket directory: node creation and
//! removal become health events for the ListAndWatch session, and removal of
//! the plugin's own socket (kubelet restarted and wiped the directory)
//! triggers a plugin restart.

use super::{signalled, DeviceHealth, HealthEvent, SandboxDevicePlugin};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sandbox_core::{PluginError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Buffered filesystem events between the notify thread and the watcher task.
const EVENT_BUFFER: usize = 64;

/// What a filesystem event means for the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WatchAction {
    Health(HealthEvent),
    Restart,
}

/// Maps device node paths back to unit keys.
#[derive(Debug, Clone, Default)]
pub(crate) struct WatchTargets {
    devices: HashMap<PathBuf, String>,
    socket_path: PathBuf,
}

impl WatchTargets {
    pub(crate) fn new<'a>(
        device_root: &Path,
        units: impl IntoIterator<Item = &'a str>,
        socket_path: &Path,
    ) -> Self {
        let devices = units.into_iter().map(|key| (device_root.join(key), key.to_string())).collect();
        Self { devices, socket_path: socket_path.to_path_buf() }
    }

    fn health(&self, path: &Path, health: DeviceHealth) -> Option<WatchAction> {
        self.devices
            .get(path)
            .map(|unit| WatchAction::Health(HealthEvent { unit: unit.clone(), health }))
    }

    /// Translate one filesystem event into plugin actions, in path order.
    pub(crate) fn classify(&self, event: &Event) -> Vec<WatchAction> {
        match &event.kind {
            EventKind::Create(_) => {
                event.paths.iter().filter_map(|p| self.health(p, DeviceHealth::Healthy)).collect()
            }
            EventKind::Remove(_) => {
                if event.paths.iter().any(|p| *p == self.socket_path) {
                    return vec![WatchAction::Restart];
                }
                event.paths.iter().filter_map(|p| self.health(p, DeviceHealth::Unhealthy)).collect()
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => event
                    .paths
                    .iter()
                    .filter_map(|p| self.health(p, DeviceHealth::Unhealthy))
                    .collect(),
                RenameMode::To => {
                    event.paths.iter().filter_map(|p| self.health(p, DeviceHealth::Healthy)).collect()
                }
                RenameMode::Both => {
                    let from = event.paths.first().and_then(|p| self.health(p, DeviceHealth::Unhealthy));
                    let to = event.paths.get(1).and_then(|p| self.health(p, DeviceHealth::Healthy));
                    from.into_iter().chain(to).collect()
                }
                // Backend could not tell the direction: look at the filesystem
                _ => event
                    .paths
                    .iter()
                    .filter_map(|p| {
                        let health =
                            if p.exists() { DeviceHealth::Healthy } else { DeviceHealth::Unhealthy };
                        self.health(p, health)
                    })
                    .collect(),
            },
            _ => Vec::new(),
        }
    }
}

/// Set up filesystem watches and spawn the watcher task.
///
/// A missing device directory is not an error: events for it simply never
/// arrive. Failing to watch the socket directory aborts plugin start.
pub(crate) fn spawn_watcher(
    plugin: SandboxDevicePlugin,
    term: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let class = plugin.class_name().to_string();
    let device_root = plugin.device_root().to_path_buf();
    let socket_path = plugin.socket_path().to_path_buf();
    let socket_dir = socket_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

    let units: Vec<String> = plugin.devices().into_iter().map(|d| d.id).collect();
    let targets = WatchTargets::new(&device_root, units.iter().map(String::as_str), &socket_path);

    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            // Runs on the notify thread; a closed channel means the task is gone
            let _ = event_tx.blocking_send(res);
        },
        notify::Config::default(),
    )
    .map_err(|e| PluginError::WatchFailed { path: socket_dir.clone(), reason: e.to_string() })?;

    match watcher.watch(&device_root, RecursiveMode::NonRecursive) {
        Ok(()) => debug!(class = %class, path = %device_root.display(), "Watching device nodes"),
        Err(e) if !device_root.exists() => {
            info!(class = %class, path = %device_root.display(), error = %e, "Device path does not exist yet, not watching it");
        }
        Err(e) => {
            return Err(PluginError::WatchFailed { path: device_root, reason: e.to_string() });
        }
    }

    watcher
        .watch(&socket_dir, RecursiveMode::NonRecursive)
        .map_err(|e| PluginError::WatchFailed { path: socket_dir.clone(), reason: e.to_string() })?;

    Ok(tokio::spawn(run_watcher(plugin, watcher, targets, event_rx, term)))
}

async fn run_watcher(
    plugin: SandboxDevicePlugin,
    watcher: RecommendedWatcher,
    targets: WatchTargets,
    mut events: mpsc::Receiver<notify::Result<Event>>,
    mut term: watch::Receiver<bool>,
) {
    // Dropping the watcher stops the notify thread
    let _watcher = watcher;
    let mut stop = plugin.stop_signal();
    let health_tx = plugin.health_sender();
    let class = plugin.class_name().to_string();

    loop {
        let event = tokio::select! {
            biased;
            _ = signalled(&mut term) => break,
            _ = signalled(&mut stop) => break,
            event = events.recv() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(class = %class, error = %e, "Filesystem watch error");
                continue;
            }
            None => break,
        };

        for action in targets.classify(&event) {
            match action {
                WatchAction::Restart => {
                    info!(class = %class, "Device plugin socket removed, restarting");
                    if let Err(e) = plugin.restart().await {
                        error!(
                            class = %class,
                            attempts = super::RESTART_ATTEMPTS,
                            error = %e,
                            "Failed to restart device plugin, giving up"
                        );
                    }
                    return;
                }
                WatchAction::Health(health) => {
                    debug!(class = %class, unit = %health.unit, health = health.health.as_str(), "Device health event");
                    // Blocks until a ListAndWatch session takes the event
                    tokio::select! {
                        biased;
                        _ = signalled(&mut term) => return,
                        sent = health_tx.send(health) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    debug!(class = %class, "Health watcher stopped");
}
