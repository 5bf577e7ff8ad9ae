use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use super::ChangeSet;
use crate::path::normalize_path;

pub(super) const DEBOUNCE_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ChangeKind {
    Created,
    Modified,
    Removed,
}

impl ChangeKind {
    pub(super) fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Removed => "removed",
        }
    }
}

/// Pure debouncer: only handles timing and event deduplication.
pub(super) struct Debouncer {
    /// Path → ChangeKind (dedup is free via HashMap key uniqueness)
    changes: FxHashMap<PathBuf, ChangeKind>,
    last_event: Option<Instant>,
    delay: Duration,
}

impl Debouncer {
    pub(super) fn new(delay: Duration) -> Self {
        Self {
            changes: FxHashMap::default(),
            last_event: None,
            delay,
        }
    }

    /// Add a notify event, applying dedup rules:
    /// - Remove + Create/Modify → Create/Modify (file was restored)
    /// - Create/Modify + Remove → Remove (file was deleted)
    /// - Same type events: first event wins
    pub(super) fn add_event(&mut self, event: &notify::Event) {
        use notify::EventKind;
        use notify::event::{MetadataKind, ModifyKind};

        let renamed = matches!(event.kind, EventKind::Modify(ModifyKind::Name(_)));
        let kind = match event.kind {
            EventKind::Create(_) => ChangeKind::Created,
            EventKind::Remove(_) => ChangeKind::Removed,
            // Pollers report content changes as a new write time
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)) => ChangeKind::Modified,
            EventKind::Modify(ModifyKind::Metadata(_)) => return,
            EventKind::Modify(_) => ChangeKind::Modified,
            _ => return,
        };

        crate::debug!("watch"; "raw notify: {:?} {:?}", event.kind, event.paths);

        for path in &event.paths {
            if is_temp_file(path) {
                continue;
            }

            let kind = match (renamed, path.exists()) {
                (true, true) => ChangeKind::Created,
                (true, false) => ChangeKind::Removed,
                _ => kind,
            };
            self.record(normalize_path(path), kind);
        }
    }

    fn record(&mut self, path: PathBuf, kind: ChangeKind) {
        self.last_event = Some(Instant::now());

        let Some(&existing) = self.changes.get(&path) else {
            crate::debug!("watch"; "event {}: {}", kind.label(), path.display());
            self.changes.insert(path, kind);
            return;
        };

        match (existing, kind) {
            (ChangeKind::Removed, ChangeKind::Created | ChangeKind::Modified) => {
                crate::debug!("watch"; "restore {}->created: {}", existing.label(), path.display());
                self.changes.insert(path, ChangeKind::Created);
            }
            (ChangeKind::Modified, ChangeKind::Removed) => {
                crate::debug!("watch"; "upgrade modified->removed: {}", path.display());
                self.changes.insert(path, ChangeKind::Removed);
            }
            (ChangeKind::Created, ChangeKind::Removed) => {
                // Appeared then vanished within the window
                crate::debug!("watch"; "discard created+removed: {}", path.display());
                self.changes.remove(&path);
            }
            _ => {}
        }
    }

    /// Take the pending changes once the debounce window has elapsed.
    pub(super) fn take_if_ready(&mut self) -> Option<ChangeSet> {
        if !self.is_ready() {
            return None;
        }

        let changes = std::mem::take(&mut self.changes);
        self.last_event = None;

        let mut set = ChangeSet::default();
        for (path, kind) in changes {
            match kind {
                ChangeKind::Created => set.added.push(path),
                ChangeKind::Modified => set.modified.push(path),
                ChangeKind::Removed => set.removed.push(path),
            }
        }
        set.added.sort();
        set.modified.sort();
        set.removed.sort();

        (!set.is_empty()).then_some(set)
    }

    pub(super) fn is_ready(&self) -> bool {
        let Some(last_event) = self.last_event else {
            return false;
        };
        last_event.elapsed() >= self.delay && !self.changes.is_empty()
    }

    /// Precise sleep duration until next possible ready time.
    pub(super) fn sleep_duration(&self) -> Duration {
        let Some(last_event) = self.last_event else {
            return Duration::from_secs(86400);
        };

        self.delay
            .saturating_sub(last_event.elapsed())
            .max(Duration::from_millis(1))
    }
}

/// Check if path is a temp/backup file (editor artifacts).
fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "tmp")
        || name.ends_with('~')
        || name.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, EventKind, ModifyKind, RemoveKind};
    use notify::Event;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    fn ready(debouncer: &mut Debouncer) -> ChangeSet {
        std::thread::sleep(Duration::from_millis(5));
        debouncer.take_if_ready().unwrap_or_default()
    }

    #[test]
    fn test_created_then_removed_is_dropped() {
        let mut d = Debouncer::new(Duration::ZERO);
        d.add_event(&event(EventKind::Create(CreateKind::File), "/tmp/x/a.js"));
        d.add_event(&event(EventKind::Remove(RemoveKind::File), "/tmp/x/a.js"));
        assert!(d.take_if_ready().is_none());
    }

    #[test]
    fn test_modified_then_removed_is_removed() {
        let mut d = Debouncer::new(Duration::ZERO);
        let modify = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        d.add_event(&event(modify, "/tmp/x/a.js"));
        d.add_event(&event(EventKind::Remove(RemoveKind::File), "/tmp/x/a.js"));
        let set = ready(&mut d);
        assert_eq!(set.removed, [PathBuf::from("/tmp/x/a.js")]);
        assert!(set.modified.is_empty());
    }

    #[test]
    fn test_removed_then_created_is_created() {
        let mut d = Debouncer::new(Duration::ZERO);
        d.add_event(&event(EventKind::Remove(RemoveKind::File), "/tmp/x/a.js"));
        d.add_event(&event(EventKind::Create(CreateKind::File), "/tmp/x/a.js"));
        let set = ready(&mut d);
        assert_eq!(set.added, [PathBuf::from("/tmp/x/a.js")]);
    }

    #[test]
    fn test_temp_files_and_metadata_ignored() {
        let mut d = Debouncer::new(Duration::ZERO);
        d.add_event(&event(EventKind::Create(CreateKind::File), "/tmp/x/.a.js.swp"));
        d.add_event(&event(EventKind::Create(CreateKind::File), "/tmp/x/a.js~"));
        d.add_event(&event(
            EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Permissions)),
            "/tmp/x/a.js",
        ));
        assert!(d.take_if_ready().is_none());
    }

    #[test]
    fn test_waits_for_quiet_period() {
        let mut d = Debouncer::new(Duration::from_secs(60));
        d.add_event(&event(EventKind::Create(CreateKind::File), "/tmp/x/a.js"));
        assert!(!d.is_ready());
        assert!(d.take_if_ready().is_none());
        assert!(d.sleep_duration() > Duration::from_secs(1));
    }
}
