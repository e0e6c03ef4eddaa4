use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{Scraper, ScraperEdit, ScraperId, ScraperProps};

pub type SharedRegistry = Arc<Mutex<ScraperRegistry>>;

/// What an edit changed, so callers can decide whether the watch needs renewing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EditOutcome {
    pub changed: bool,
    pub watch_relevant: bool,
    pub enabled: bool,
}

/// In-memory source of truth for scraper definitions, kept in insertion order.
#[derive(Debug, Default)]
pub struct ScraperRegistry {
    scrapers: Vec<Scraper>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_scrapers(scrapers: Vec<Scraper>) -> Self {
        Self { scrapers }
    }

    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    pub fn add(&mut self, props: ScraperProps) -> ScraperId {
        // v4 collisions are not a practical concern, but ids are never reused
        let id = loop {
            let candidate = Uuid::new_v4();
            if self.find(candidate).is_none() {
                break candidate;
            }
        };
        self.scrapers.push(Scraper::new(id, props));
        id
    }

    /// Removes the scraper, returning it. Unknown ids are a no-op.
    pub fn remove(&mut self, id: ScraperId) -> Option<Scraper> {
        let index = self.scrapers.iter().position(|s| s.id == id)?;
        Some(self.scrapers.remove(index))
    }

    /// Flips `enabled` and returns the new value.
    pub fn toggle_enabled(&mut self, id: ScraperId) -> Option<bool> {
        let scraper = self.find_mut(id)?;
        scraper.enabled = !scraper.enabled;
        Some(scraper.enabled)
    }

    pub fn set_enabled(&mut self, id: ScraperId, enabled: bool) -> bool {
        match self.find_mut(id) {
            Some(scraper) => {
                scraper.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Applies a partial edit. A path change clears runtime status.
    pub fn edit(&mut self, id: ScraperId, edit: ScraperEdit) -> Option<EditOutcome> {
        let scraper = self.find_mut(id)?;
        let mut outcome = EditOutcome {
            enabled: scraper.enabled,
            ..EditOutcome::default()
        };

        if let Some(name) = edit.name {
            if name != scraper.name {
                scraper.name = name;
                outcome.changed = true;
                outcome.watch_relevant = true;
            }
        }
        if let Some(path) = edit.path {
            if path != scraper.path {
                scraper.path = path;
                scraper.clear_status();
                outcome.changed = true;
                outcome.watch_relevant = true;
            }
        }
        if let Some(topic) = edit.mqtt_topic {
            if topic != scraper.mqtt_topic {
                scraper.mqtt_topic = topic;
                outcome.changed = true;
            }
        }

        Some(outcome)
    }

    pub fn list(&self) -> &[Scraper] {
        &self.scrapers
    }

    pub fn find(&self, id: ScraperId) -> Option<&Scraper> {
        self.scrapers.iter().find(|s| s.id == id)
    }

    pub fn find_mut(&mut self, id: ScraperId) -> Option<&mut Scraper> {
        self.scrapers.iter_mut().find(|s| s.id == id)
    }
}
