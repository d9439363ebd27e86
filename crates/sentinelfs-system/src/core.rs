//! Embeddable entry point.
//!
//! `Core` is the single value an embedder constructs: it owns the
//! watched root, the aggregator (and therefore `LocalState`), and the
//! release gate, all behind one lock, matching the coarse concurrency
//! contract of SPEC_FULL.md §5. No process-wide singletons.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sentinelfs_core::hash::HashFn;
use sentinelfs_core::state::LocalState;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::aggregator::Aggregator;
use crate::release_gate::{ReleaseGate, ReleasedEvent};
use crate::source::{NotifyEventSource, RawEventSource};

/// The three tunable constants the core exposes (§6).
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    pub quiet_period: Duration,
    pub copy_group_expiry: Duration,
    pub empty_file_grace: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            quiet_period: Duration::from_secs(2),
            copy_group_expiry: Duration::from_secs(20 * 60),
            empty_file_grace: Duration::from_secs(2),
        }
    }
}

struct Shared {
    aggregator: Aggregator,
}

/// Constructor inputs: watched absolute directory, optional hash
/// function, optional seed map. Methods: `start`, `stop`, `poll`.
pub struct Core {
    root: PathBuf,
    config: CoreConfig,
    shared: Arc<Mutex<Shared>>,
    gate: ReleaseGate,
    source: Box<dyn RawEventSource>,
    drain_handle: Option<JoinHandle<()>>,
    running: Arc<tokio::sync::Notify>,
}

impl Core {
    /// Cold start: walks the watched tree and populates `LocalState`
    /// eagerly (§4.2 constructor option (b)), so a `Created` arriving
    /// moments later can already be matched against pre-existing files.
    pub fn new(root: impl Into<PathBuf>, config: CoreConfig) -> Self {
        let root = root.into();
        let mut local_state = LocalState::new(root.clone());
        local_state.populate_by_walking();
        Self::with_local_state(root, config, local_state)
    }

    pub fn with_hash_fn(
        root: impl Into<PathBuf>,
        config: CoreConfig,
        hash_fn: Arc<dyn HashFn>,
    ) -> Self {
        let root = root.into();
        let local_state = LocalState::with_hash_fn(root.clone(), hash_fn);
        Self::with_local_state(root, config, local_state)
    }

    /// Seeds `LocalState` from a caller-provided map instead of a cold
    /// filesystem walk (§4.2 constructor option (a)).
    pub fn with_seed(
        root: impl Into<PathBuf>,
        config: CoreConfig,
        seed: Vec<(sentinelfs_core::path::RelativePath, String, sentinelfs_core::state::SizeTime)>,
    ) -> Self {
        let root = root.into();
        let mut local_state = LocalState::new(root.clone());
        for (rel, hash, sizetime) in seed {
            if local_state.to_absolute(&rel).exists() {
                local_state.save(rel, hash, sizetime);
            }
        }
        Self::with_local_state(root, config, local_state)
    }

    fn with_local_state(root: PathBuf, config: CoreConfig, local_state: LocalState) -> Self {
        let aggregator =
            Aggregator::new(local_state).with_copy_group_expiry(config.copy_group_expiry);
        let gate = ReleaseGate::new(config.quiet_period, config.empty_file_grace);
        Core {
            source: Box::new(NotifyEventSource::new(root.clone())),
            root,
            config,
            shared: Arc::new(Mutex::new(Shared { aggregator })),
            gate,
            drain_handle: None,
            running: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn config(&self) -> CoreConfig {
        self.config
    }

    /// Starts the notify driver and the aggregator's drain loop
    /// (§5: "loops sleep(200ms); while raw queue non-empty { dequeue; fold }").
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.source.start(tx)?;

        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        self.drain_handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(200));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let mut guard = shared.lock().await;
                        while let Ok(raw) = rx.try_recv() {
                            guard.aggregator.ingest(raw);
                        }
                    }
                    _ = running.notified() => {
                        return;
                    }
                }
            }
        }));
        info!(root = %self.root.display(), "core started");
        Ok(())
    }

    /// Stops the notify driver and the drain loop. Pending events are
    /// dropped (§5 cancellation semantics); the gate is not resumed.
    pub fn stop(&mut self) {
        self.source.stop();
        self.running.notify_one();
        if let Some(handle) = self.drain_handle.take() {
            handle.abort();
        }
        info!("core stopped");
    }

    /// Returns the currently quiescent, scrubbed events.
    pub async fn poll(&self) -> Vec<ReleasedEvent> {
        let mut guard = self.shared.lock().await;
        self.gate.poll(&mut guard.aggregator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventKind;
    use crate::source::{RawEvent, RawEventKind};

    fn fast_config() -> CoreConfig {
        CoreConfig {
            quiet_period: Duration::from_millis(30),
            copy_group_expiry: Duration::from_secs(60),
            empty_file_grace: Duration::from_millis(30),
        }
    }

    #[tokio::test]
    async fn mkdir_then_poll_yields_single_created_event() {
        let dir = tempfile::tempdir().unwrap();
        let core = Core::new(dir.path(), fast_config());
        let sub = dir.path().join("dir1");
        std::fs::create_dir(&sub).unwrap();
        {
            let mut guard = core.shared.lock().await;
            guard.aggregator.ingest(RawEvent {
                kind: RawEventKind::Created,
                is_directory: true,
                src_path: sub,
                dest_path: None,
            });
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let events = core.poll().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Created);
        assert_eq!(events[0].path, "/dir1");
        assert!(events[0].is_directory);
    }

    #[tokio::test]
    async fn create_then_delete_burst_yields_no_events() {
        let dir = tempfile::tempdir().unwrap();
        let core = Core::new(dir.path(), fast_config());
        let file = dir.path().join("tmp.txt");
        std::fs::write(&file, b"x").unwrap();
        {
            let mut guard = core.shared.lock().await;
            guard.aggregator.ingest(RawEvent {
                kind: RawEventKind::Created,
                is_directory: false,
                src_path: file.clone(),
                dest_path: None,
            });
        }
        std::fs::remove_file(&file).unwrap();
        {
            let mut guard = core.shared.lock().await;
            guard.aggregator.ingest(RawEvent {
                kind: RawEventKind::Deleted,
                is_directory: false,
                src_path: file,
                dest_path: None,
            });
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let events = core.poll().await;
        assert!(events.is_empty());
    }
}
