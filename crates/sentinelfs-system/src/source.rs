//! Raw notification adapter.
//!
//! Defines the contract any file-watching backend must satisfy
//! (§6 of SPEC_FULL.md) and supplies one concrete implementation,
//! [`NotifyEventSource`], built on the `notify` crate so the workspace
//! is runnable end to end without requiring an embedder to bring their
//! own watcher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The raw notification kinds a `RawEventSource` may report. `Moved`
/// always carries a destination; everything else only a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Created,
    Deleted,
    Moved,
    ModifiedContent,
    ModifiedMetadata,
}

/// One raw, unaggregated filesystem notification.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub is_directory: bool,
    pub src_path: PathBuf,
    pub dest_path: Option<PathBuf>,
}

/// External adapter producing a stream of [`RawEvent`]s. The core
/// treats the platform notification primitive as out of scope
/// (SPEC_FULL.md §1); this trait is the seam an embedder plugs into.
pub trait RawEventSource: Send {
    /// Starts watching; notifications begin flowing to `sender`.
    fn start(&mut self, sender: mpsc::UnboundedSender<RawEvent>) -> anyhow::Result<()>;
    fn stop(&mut self);
}

const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(500);

type PendingRenames = HashMap<usize, (PathBuf, Instant)>;

/// Classifies one `notify::Event` into zero or more [`RawEvent`]s,
/// pairing `RenameMode::From`/`To` halves via `pending_renames` and
/// downgrading an unpaired moved-to into a `Created` per §7.
fn classify_event(event: Event, pending_renames: &mut PendingRenames) -> Vec<RawEvent> {
    let is_directory = event.paths.first().map(|p| p.is_dir()).unwrap_or(false);

    match event.kind {
        NotifyKind::Create(CreateKind::Any)
        | NotifyKind::Create(CreateKind::File)
        | NotifyKind::Create(CreateKind::Folder) => event
            .paths
            .into_iter()
            .map(|p| RawEvent {
                kind: RawEventKind::Created,
                is_directory,
                src_path: p,
                dest_path: None,
            })
            .collect(),
        NotifyKind::Remove(RemoveKind::Any)
        | NotifyKind::Remove(RemoveKind::File)
        | NotifyKind::Remove(RemoveKind::Folder) => event
            .paths
            .into_iter()
            .map(|p| RawEvent {
                kind: RawEventKind::Deleted,
                is_directory,
                src_path: p,
                dest_path: None,
            })
            .collect(),
        NotifyKind::Modify(ModifyKind::Data(_)) => event
            .paths
            .into_iter()
            .map(|p| RawEvent {
                kind: RawEventKind::ModifiedContent,
                is_directory,
                src_path: p,
                dest_path: None,
            })
            .collect(),
        NotifyKind::Modify(ModifyKind::Metadata(_)) => event
            .paths
            .into_iter()
            .map(|p| RawEvent {
                kind: RawEventKind::ModifiedMetadata,
                is_directory,
                src_path: p,
                dest_path: None,
            })
            .collect(),
        NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![RawEvent {
                kind: RawEventKind::Moved,
                is_directory,
                src_path: event.paths[0].clone(),
                dest_path: Some(event.paths[1].clone()),
            }]
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            if let Some(tracker) = event.attrs.tracker() {
                if let Some(path) = event.paths.into_iter().next() {
                    pending_renames.insert(tracker, (path, Instant::now()));
                }
            }
            Vec::new()
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            if let Some(tracker) = event.attrs.tracker() {
                if let Some((from, seen_at)) = pending_renames.remove(&tracker) {
                    if seen_at.elapsed() <= RENAME_PAIR_WINDOW {
                        if let Some(to) = event.paths.into_iter().next() {
                            return vec![RawEvent {
                                kind: RawEventKind::Moved,
                                is_directory,
                                src_path: from,
                                dest_path: Some(to),
                            }];
                        }
                    }
                }
            }
            // Unpaired moved-to: per §7, downgrade to Created.
            event
                .paths
                .into_iter()
                .map(|p| RawEvent {
                    kind: RawEventKind::Created,
                    is_directory,
                    src_path: p,
                    dest_path: None,
                })
                .collect()
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::Any))
        | NotifyKind::Modify(ModifyKind::Name(RenameMode::Other)) => event
            .paths
            .into_iter()
            .map(|p| RawEvent {
                kind: RawEventKind::ModifiedMetadata,
                is_directory,
                src_path: p,
                dest_path: None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Drops pending move-from halves that never got their matching
/// move-to within the pairing window, downgrading them to `Deleted`
/// per §7 ("unpaired moved-from downgrades to Deleted").
fn sweep_stale_renames(pending_renames: &mut PendingRenames) -> Vec<RawEvent> {
    let stale: Vec<usize> = pending_renames
        .iter()
        .filter(|(_, (_, seen_at))| seen_at.elapsed() > RENAME_PAIR_WINDOW)
        .map(|(tracker, _)| *tracker)
        .collect();
    stale
        .into_iter()
        .filter_map(|tracker| pending_renames.remove(&tracker))
        .map(|(path, _)| RawEvent {
            kind: RawEventKind::Deleted,
            is_directory: false,
            src_path: path,
            dest_path: None,
        })
        .collect()
}

/// `notify`-crate-backed adapter. Responsible for pairing
/// `RenameMode::From`/`RenameMode::To` into a single `Moved` record,
/// recursively registering new subdirectories, splitting generic
/// "modified" into content vs metadata, and downgrading unpaired
/// halves of a move per §7 of SPEC_FULL.md.
pub struct NotifyEventSource {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
}

impl NotifyEventSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        NotifyEventSource {
            root: root.into(),
            watcher: None,
        }
    }
}

impl RawEventSource for NotifyEventSource {
    fn start(&mut self, sender: mpsc::UnboundedSender<RawEvent>) -> anyhow::Result<()> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        self.watcher = Some(watcher);

        // notify's callback runs on its own thread; we forward into an
        // async task that owns the rename-pairing state so classification
        // stays single-threaded and lock-free.
        tokio::spawn(async move {
            let mut pending_renames: PendingRenames = HashMap::new();
            loop {
                match tokio::time::timeout(Duration::from_millis(250), raw_rx.recv()).await {
                    Ok(Some(Ok(event))) => {
                        for raw in classify_event(event, &mut pending_renames) {
                            debug!(?raw.kind, path = %raw.src_path.display(), "raw event");
                            if sender.send(raw).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Some(Err(e))) => warn!(error = %e, "watch error"),
                    Ok(None) => return,
                    Err(_elapsed) => {
                        for raw in sweep_stale_renames(&mut pending_renames) {
                            if sender.send(raw).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn stop(&mut self) {
        self.watcher = None;
    }
}

/// Registers `dir` and every subdirectory under it with `watcher`. The
/// `notify` crate already recurses for us via `RecursiveMode::Recursive`
/// at the root; this helper exists for adapters (or tests) that need
/// to extend coverage to a directory created after the initial watch.
pub fn register_subtree(watcher: &mut RecommendedWatcher, dir: &Path) -> anyhow::Result<()> {
    watcher.watch(dir, RecursiveMode::Recursive)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpaired_rename_to_downgrades_to_created() {
        let mut pending = PendingRenames::new();
        let event = Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(PathBuf::from("/watched/new_name.txt"));
        let raws = classify_event(event, &mut pending);
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].kind, RawEventKind::Created);
    }

    #[test]
    fn sweep_downgrades_stale_rename_from_to_deleted() {
        let mut pending = PendingRenames::new();
        pending.insert(
            1,
            (
                PathBuf::from("/watched/old_name.txt"),
                Instant::now() - Duration::from_secs(1),
            ),
        );
        let raws = sweep_stale_renames(&mut pending);
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].kind, RawEventKind::Deleted);
        assert!(pending.is_empty());
    }
}
