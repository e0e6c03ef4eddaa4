use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::WatchError;
use crate::ports::{EventCallback, FileWatchService, FsEventKind, Subscription};

/// Watch service backed by the platform's recommended `notify` watcher.
#[derive(Debug, Default)]
pub struct NotifyWatchService;

struct NotifySubscription {
    watcher: RecommendedWatcher,
}

impl Subscription for NotifySubscription {
    fn cancel(self: Box<Self>) {
        // dropping the watcher releases the OS watch
        drop(self.watcher);
    }
}

impl FileWatchService for NotifyWatchService {
    fn watch(
        &self,
        path: &Path,
        recursive: bool,
        on_event: EventCallback,
    ) -> Result<Box<dyn Subscription>, WatchError> {
        let unwatchable = |e: notify::Error| WatchError::Unwatchable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                debug!("changed: {:?}", event);
                on_event(classify(&event));
            }
            Err(e) => {
                warn!("watch error: {:?}", e);
                on_event(FsEventKind::Error);
            }
        })
        .map_err(unwatchable)?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(path, mode).map_err(unwatchable)?;

        Ok(Box::new(NotifySubscription { watcher }))
    }
}

pub(crate) fn classify(event: &Event) -> FsEventKind {
    if event.need_rescan() {
        return FsEventKind::Rescan;
    }
    match event.kind {
        EventKind::Create(_) => FsEventKind::Create,
        EventKind::Modify(ModifyKind::Metadata(_)) => FsEventKind::Chmod,
        EventKind::Modify(ModifyKind::Name(_)) => FsEventKind::Rename,
        EventKind::Modify(_) => FsEventKind::Write,
        EventKind::Remove(_) => FsEventKind::Remove,
        EventKind::Access(_) => FsEventKind::Access,
        EventKind::Any | EventKind::Other => FsEventKind::Other,
    }
}
