//! Collaborator presence
//!
//! `PresenceTracker` folds presence broadcasts into "who is here and which
//! field are they in". `LocalActivity` is the local side: whether this
//! page is visible, and therefore whether focus should be announced.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::entity::UserRef;
use crate::observable::Property;
use crate::ot::transport::FocusTarget;

/// Present users and the field each one is focused on, if any.
pub type Collaborators = BTreeMap<UserRef, Option<FocusTarget>>;

#[derive(Debug, Clone)]
struct PresenceEntry {
    focus: Option<FocusTarget>,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct PresenceTracker {
    timeout: Duration,
    entries: HashMap<UserRef, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: HashMap::new(),
        }
    }

    pub fn record(&mut self, user: UserRef, focus: Option<FocusTarget>, now: Instant) {
        self.entries.insert(user, PresenceEntry { focus, last_seen: now });
    }

    /// Returns whether the user was present.
    pub fn remove(&mut self, user: &UserRef) -> bool {
        self.entries.remove(user).is_some()
    }

    /// Drop users silent for longer than the timeout. Returns whether
    /// anything was dropped.
    pub fn prune(&mut self, now: Instant) -> bool {
        let before = self.entries.len();
        let timeout = self.timeout;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= timeout);
        self.entries.len() != before
    }

    pub fn snapshot(&self) -> Collaborators {
        self.entries
            .iter()
            .map(|(user, entry)| (user.clone(), entry.focus.clone()))
            .collect()
    }

    pub fn users_at(&self, field_id: &str, locale: &str) -> BTreeSet<UserRef> {
        users_at(&self.snapshot(), field_id, locale)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub fn users_at(collaborators: &Collaborators, field_id: &str, locale: &str) -> BTreeSet<UserRef> {
    collaborators
        .iter()
        .filter(|(_, focus)| {
            focus
                .as_ref()
                .map_or(false, |f| f.field_id == field_id && f.locale == locale)
        })
        .map(|(user, _)| user.clone())
        .collect()
}

/// Local page activity, created once per editor session and shared with
/// every document it opens.
pub struct LocalActivity {
    visible: watch::Sender<bool>,
    destroyed: AtomicBool,
}

impl LocalActivity {
    pub fn create() -> Arc<Self> {
        let (visible, _) = watch::channel(true);
        Arc::new(Self {
            visible,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn set_visible(&self, visible: bool) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.visible.send_replace(visible);
    }

    /// Whether focus events should be announced.
    pub fn is_active(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && *self.visible.borrow()
    }

    pub fn visible_property(&self) -> Property<bool> {
        Property::from_watch(self.visible.subscribe())
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.visible.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_users_at_focus() {
        let now = Instant::now();
        let mut tracker = PresenceTracker::new(Duration::from_secs(60));
        tracker.record(UserRef::new("alice"), Some(FocusTarget::new("title", "en-US")), now);
        tracker.record(UserRef::new("bob"), Some(FocusTarget::new("body", "en-US")), now);
        tracker.record(UserRef::new("carol"), None, now);

        let at_title = tracker.users_at("title", "en-US");
        assert_eq!(at_title.len(), 1);
        assert!(at_title.contains(&UserRef::new("alice")));
        assert!(tracker.users_at("title", "de-DE").is_empty());
        assert_eq!(tracker.snapshot().len(), 3);
    }

    #[test]
    fn test_refocus_moves_user() {
        let now = Instant::now();
        let mut tracker = PresenceTracker::new(Duration::from_secs(60));
        tracker.record(UserRef::new("alice"), Some(FocusTarget::new("title", "en-US")), now);
        tracker.record(UserRef::new("alice"), Some(FocusTarget::new("body", "en-US")), now);
        assert!(tracker.users_at("title", "en-US").is_empty());
        assert_eq!(tracker.users_at("body", "en-US").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_stale_users() {
        let mut tracker = PresenceTracker::new(Duration::from_secs(10));
        tracker.record(UserRef::new("alice"), None, Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;
        tracker.record(UserRef::new("bob"), None, Instant::now());
        assert!(!tracker.prune(Instant::now()));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(tracker.prune(Instant::now()));
        let remaining = tracker.snapshot();
        assert!(remaining.contains_key(&UserRef::new("bob")));
        assert!(!remaining.contains_key(&UserRef::new("alice")));
    }

    #[test]
    fn test_local_activity_lifecycle() {
        let activity = LocalActivity::create();
        assert!(activity.is_active());
        activity.set_visible(false);
        assert!(!activity.is_active());
        activity.set_visible(true);
        assert!(activity.visible_property().get());

        activity.destroy();
        activity.set_visible(true);
        assert!(!activity.is_active());
    }
}
