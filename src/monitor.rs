/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{bail, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::error;

/// Watches a single directory and reports creation or modification of
/// entries inside it. notify delivers events from its own thread, so they
/// are bridged into an mpsc channel consumable from the event loop.
pub(crate) struct PathWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<Event>,
}

impl PathWatcher {
    pub(crate) fn new(directory: &Path) -> Result<PathWatcher> {
        let (tx, rx) = mpsc::channel(16);
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.try_send(event);
                }
                Err(err) => error!("File watcher error: {err}"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(directory, RecursiveMode::NonRecursive)?;
        Ok(PathWatcher {
            _watcher: watcher,
            rx,
        })
    }

    /// Completes once `path` is created or modified inside the watched
    /// directory.
    pub(crate) async fn wait_for(&mut self, path: &Path) -> Result<()> {
        let file_name = path.file_name();
        while let Some(event) = self.rx.recv().await {
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            // Compare by name; the watcher may hand back canonicalized
            // parent paths.
            if event.paths.iter().any(|p| p.file_name() == file_name) {
                return Ok(());
            }
        }
        bail!("file watcher channel closed");
    }
}
