use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::WatchError;
use crate::models::{Scraper, ScraperId};
use crate::ports::{FileWatchService, FsEventKind, Notifier, Subscription};
use crate::registry::SharedRegistry;

/// A change notification tagged with the subscription that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchEvent {
    pub scraper_id: ScraperId,
    pub generation: u64,
    pub kind: FsEventKind,
}

/// Result of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    AlreadyActive,
    /// Unknown or disabled scraper, nothing to watch.
    Skipped,
    /// The path could not be watched and the scraper was disabled.
    Failed,
}

struct ActiveWatch {
    generation: u64,
    subscription: Box<dyn Subscription>,
}

#[derive(Default)]
struct Handles {
    next_generation: u64,
    active: HashMap<ScraperId, ActiveWatch>,
}

/// Maps each enabled scraper to exactly one live subscription.
///
/// Every operation holds the handle table lock for its whole duration, so concurrent
/// register/unregister/renew calls for one id are serialized. Lock order is handles, then
/// registry.
pub struct WatchSupervisor {
    watcher: Arc<dyn FileWatchService>,
    notifier: Arc<dyn Notifier>,
    registry: SharedRegistry,
    events: mpsc::UnboundedSender<WatchEvent>,
    handles: Mutex<Handles>,
}

impl WatchSupervisor {
    pub fn new(
        watcher: Arc<dyn FileWatchService>,
        notifier: Arc<dyn Notifier>,
        registry: SharedRegistry,
        events: mpsc::UnboundedSender<WatchEvent>,
    ) -> Self {
        Self {
            watcher,
            notifier,
            registry,
            events,
            handles: Mutex::new(Handles::default()),
        }
    }

    pub async fn register(&self, id: ScraperId) -> Registration {
        let mut handles = self.handles.lock().await;
        self.register_locked(&mut handles, id).await
    }

    /// Cancels the live subscription, if any.
    pub async fn unregister(&self, id: ScraperId) -> bool {
        let mut handles = self.handles.lock().await;
        Self::unregister_locked(&mut handles, id)
    }

    /// Cancel-then-recreate, used after watch-relevant edits and re-enabling.
    pub async fn renew(&self, id: ScraperId) -> Registration {
        let mut handles = self.handles.lock().await;
        self.renew_locked(&mut handles, id).await
    }

    /// Brings the subscription in line with the scraper's current `enabled` flag: unregister
    /// when disabled, renew or register when enabled. Safe to call in any order for the same
    /// id: each call acts on the registry state at the time it runs.
    pub async fn reconcile(&self, id: ScraperId, renew: bool) -> Registration {
        let mut handles = self.handles.lock().await;
        let wanted = self
            .registry
            .lock()
            .await
            .find(id)
            .is_some_and(|scraper| scraper.enabled);

        match (wanted, renew) {
            (false, _) => {
                Self::unregister_locked(&mut handles, id);
                Registration::Skipped
            }
            (true, true) => self.renew_locked(&mut handles, id).await,
            (true, false) => self.register_locked(&mut handles, id).await,
        }
    }

    /// Cancels the subscription, then removes the scraper from the registry. Both happen while
    /// the handle table is held, so a concurrent registration cannot re-arm the watch.
    pub async fn retire(&self, id: ScraperId) -> Option<Scraper> {
        let mut handles = self.handles.lock().await;
        Self::unregister_locked(&mut handles, id);
        self.registry.lock().await.remove(id)
    }

    pub async fn unregister_all(&self) {
        let mut handles = self.handles.lock().await;
        let ids: Vec<_> = handles.active.keys().copied().collect();
        for id in ids {
            Self::unregister_locked(&mut handles, id);
        }
    }

    /// Whether `generation` is the subscription currently armed for `id`.
    pub async fn is_current(&self, id: ScraperId, generation: u64) -> bool {
        let handles = self.handles.lock().await;
        handles
            .active
            .get(&id)
            .is_some_and(|watch| watch.generation == generation)
    }

    pub async fn is_watching(&self, id: ScraperId) -> bool {
        self.handles.lock().await.active.contains_key(&id)
    }

    pub async fn active_count(&self) -> usize {
        self.handles.lock().await.active.len()
    }

    async fn renew_locked(&self, handles: &mut Handles, id: ScraperId) -> Registration {
        Self::unregister_locked(handles, id);
        self.register_locked(handles, id).await
    }

    async fn register_locked(&self, handles: &mut Handles, id: ScraperId) -> Registration {
        if handles.active.contains_key(&id) {
            return Registration::AlreadyActive;
        }

        let scraper = {
            let registry = self.registry.lock().await;
            match registry.find(id) {
                Some(scraper) if scraper.enabled => scraper.clone(),
                _ => return Registration::Skipped,
            }
        };

        let generation = handles.next_generation;
        handles.next_generation += 1;

        match self.subscribe(&scraper, generation) {
            Ok(subscription) => {
                info!(
                    "Watching '{}' for scraper '{}' ({}).",
                    scraper.path.display(),
                    scraper.name,
                    id
                );
                handles.active.insert(
                    id,
                    ActiveWatch {
                        generation,
                        subscription,
                    },
                );
                Registration::Registered
            }
            Err(e) => {
                warn!("Watch registration failed for scraper {}: {}", id, e);
                self.registry.lock().await.set_enabled(id, false);
                self.notifier.warn(&format!(
                    "Scraper '{}' was disabled. {}",
                    scraper.name, e
                ));
                Registration::Failed
            }
        }
    }

    fn subscribe(
        &self,
        scraper: &Scraper,
        generation: u64,
    ) -> Result<Box<dyn Subscription>, WatchError> {
        let events = self.events.clone();
        let scraper_id = scraper.id;
        self.watcher.watch(
            &scraper.path,
            true,
            Box::new(move |kind| {
                if !kind.triggers_execution() {
                    return;
                }
                let event = WatchEvent {
                    scraper_id,
                    generation,
                    kind,
                };
                if events.send(event).is_err() {
                    debug!("Watch event for {} dropped, dispatcher is gone.", scraper_id);
                }
            }),
        )
    }

    fn unregister_locked(handles: &mut Handles, id: ScraperId) -> bool {
        match handles.active.remove(&id) {
            Some(watch) => {
                debug!("Cancelling watch for scraper {}.", id);
                watch.subscription.cancel();
                true
            }
            None => false,
        }
    }
}
