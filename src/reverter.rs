//! Revert eligibility tracking
//!
//! Keeps two reference points for an editor session: the version the
//! session started from ("previous") and the last published version. Both
//! drift as edits and publishes interleave. A publish always consumes
//! exactly one version bump, hence the `+ 1` offsets below.

use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use crate::entity::{Entity, Versioned};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
struct Tracked {
    published: Option<u64>,
    previous: u64,
    original_data: Value,
}

type EntryAccessor = Box<dyn Fn() -> Entity + Send + Sync>;

pub struct EntryReverter {
    get_entry: EntryAccessor,
    tracked: Mutex<Option<Tracked>>,
}

impl EntryReverter {
    /// `get_entry` is read on every call, so it should return live state.
    pub fn new<F>(get_entry: F) -> Self
    where
        F: Fn() -> Entity + Send + Sync + 'static,
    {
        Self {
            get_entry: Box::new(get_entry),
            tracked: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Tracked>> {
        match self.tracked.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_tracked<T>(&self, f: impl FnOnce(&mut Tracked, &Entity) -> T) -> Result<T> {
        let entry = (self.get_entry)();
        let mut tracked = self.lock();
        let tracked = tracked
            .as_mut()
            .ok_or_else(|| SyncError::InvalidState("reverter not initialised".into()))?;
        Ok(f(tracked, &entry))
    }

    /// Snapshot the starting point. Call once, after the entity loaded.
    pub fn init(&self) -> Result<()> {
        let entry = (self.get_entry)();
        let mut tracked = self.lock();
        if tracked.is_some() {
            return Err(SyncError::InvalidState("reverter already initialised".into()));
        }
        *tracked = Some(Tracked {
            published: entry.published_version(),
            previous: entry.version(),
            original_data: entry.data(),
        });
        Ok(())
    }

    /// Field data as of `init()`.
    pub fn previous_data(&self) -> Option<Value> {
        self.lock().as_ref().map(|t| t.original_data.clone())
    }

    pub fn tracked_previous_version(&self) -> Option<u64> {
        self.lock().as_ref().map(|t| t.previous)
    }

    pub fn tracked_published_version(&self) -> Option<u64> {
        self.lock().as_ref().and_then(|t| t.published)
    }

    pub fn can_revert_to_previous(&self) -> bool {
        self.with_tracked(|tracked, entry| entry.version() > tracked.previous)
            .unwrap_or(false)
    }

    pub fn can_revert_to_published(&self) -> bool {
        self.with_tracked(|tracked, entry| {
            entry.is_published()
                && tracked
                    .published
                    .map_or(false, |published| entry.version() > published + 1)
        })
        .unwrap_or(false)
    }

    /// After a successful revert-to-previous write.
    pub fn reverted_to_previous(&self) -> Result<()> {
        self.with_tracked(|tracked, entry| {
            if let Some(published) = tracked.published {
                if tracked.previous == published + 1 {
                    // The reverted edit was the only thing newer than the publish.
                    tracked.published = Some(published.saturating_sub(1));
                }
            }
            tracked.previous = entry.version();
        })
    }

    /// After a successful revert-to-published write.
    pub fn reverted_to_published(&self) -> Result<()> {
        self.with_tracked(|tracked, entry| {
            let version = entry.version();
            if let Some(published) = tracked.published {
                if tracked.previous == published + 1 {
                    tracked.previous = version;
                }
            }
            tracked.published = Some(version.saturating_sub(1));
        })
    }

    /// After a successful publish.
    pub fn published_new_version(&self) -> Result<()> {
        self.with_tracked(|tracked, entry| {
            tracked.published = entry.published_version();
            if Some(tracked.previous) == tracked.published {
                tracked.previous += 1;
            }
        })
    }
}
