//! Live entity documents
//!
//! A `Document` binds one entity to a transport session. Every committed
//! change, local or remote, reaches the document through the session's
//! event stream and is applied there in version order; mutation methods
//! only submit ops and wait until their acknowledged version has been
//! applied. Submissions are serialized so a new op is never based on a
//! version older than the previous op's acknowledgement.

mod field_locale;
mod mutation;
pub mod normalizer;
pub mod presence;

pub use field_locale::FieldLocaleView;
pub use normalizer::{fields_malformed, normalize, Normalization};
pub use presence::{Collaborators, LocalActivity, PresenceTracker};

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::entity::{Asset, Entity, EntityRef, EntityType, Entry, SysMetadata, UserRef, Versioned};
use crate::error::{Result, SyncError};
use crate::observable::Property;
use crate::ot::op::{apply_all, key_path, value_at, Op, Path, PathSegment};
use crate::ot::transport::{FocusTarget, Transport, TransportDoc, TransportEvent};
use crate::schema::{ContentType, Locale};

/// Connection state of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentStatus {
    Connected,
    /// Connection lost. Without `reload_required` the transport is retrying
    /// and edits are still accepted.
    Disconnected { reload_required: bool },
    Closed,
}

impl DocumentStatus {
    /// No further mutations will be accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Disconnected { reload_required: true } | DocumentStatus::Closed
        )
    }
}

/// Replayed document state.
#[derive(Debug, Clone, PartialEq)]
pub struct DocState {
    /// Snapshot as acknowledged by the transport.
    pub raw: Value,
    /// `raw` normalized against the current schema. Never submitted.
    pub data: Value,
    pub sys: SysMetadata,
}

#[derive(Clone, Default)]
pub struct DocumentOptions {
    pub config: SyncConfig,
    /// Focus is only announced while this reports the page as active.
    pub activity: Option<Arc<LocalActivity>>,
}

#[derive(Debug, Clone)]
struct SchemaInputs {
    content_type: Option<ContentType>,
    locales: Vec<Locale>,
}

/// Senders of the observable state. Dropped on close, which ends every
/// subscriber stream.
struct Channels {
    state: watch::Sender<Arc<DocState>>,
    saving: watch::Sender<bool>,
    collaborators: watch::Sender<Collaborators>,
}

struct DocumentInner {
    entity_ref: EntityRef,
    session: Arc<dyn TransportDoc>,
    channels: Mutex<Option<Channels>>,
    state_rx: watch::Receiver<Arc<DocState>>,
    saving_rx: watch::Receiver<bool>,
    collaborators_rx: watch::Receiver<Collaborators>,
    status: watch::Sender<DocumentStatus>,
    schema: Mutex<Option<SchemaInputs>>,
    /// Held from submit until the acknowledged version is applied.
    submit_lock: tokio::sync::Mutex<()>,
    activity: Option<Arc<LocalActivity>>,
    /// Last focus announced by this document, repeated as a heartbeat.
    local_focus: Mutex<Option<FocusTarget>>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl DocumentInner {
    fn key(&self) -> String {
        self.entity_ref.key()
    }

    fn state(&self) -> Arc<DocState> {
        Arc::clone(&self.state_rx.borrow())
    }

    fn view_of(&self, raw: &Value) -> (Value, Normalization) {
        let mut data = raw.clone();
        let report = match lock(&self.schema).as_ref() {
            Some(inputs) => normalize(&mut data, inputs.content_type.as_ref(), &inputs.locales),
            None => Normalization::default(),
        };
        (data, report)
    }

    /// Update the replayed state. `update` returns whether it changed
    /// anything; the normalized view is recomputed when `raw` moved.
    fn update_state<F>(&self, update: F)
    where
        F: FnOnce(&mut DocState) -> bool,
    {
        let channels = lock(&self.channels);
        let Some(channels) = channels.as_ref() else {
            return;
        };
        channels.state.send_if_modified(|state| {
            let mut next = DocState::clone(state);
            if !update(&mut next) {
                return false;
            }
            if next.raw != state.raw {
                next.data = self.view_of(&next.raw).0;
            }
            *state = Arc::new(next);
            true
        });
    }

    fn renormalize(&self) -> Normalization {
        let mut report = Normalization::default();
        let channels = lock(&self.channels);
        if let Some(channels) = channels.as_ref() {
            channels.state.send_if_modified(|state| {
                let (data, normalization) = self.view_of(&state.raw);
                report = normalization;
                if data == state.data {
                    return false;
                }
                let mut next = DocState::clone(state);
                next.data = data;
                *state = Arc::new(next);
                true
            });
        }
        report
    }

    fn set_saving(&self, saving: bool) {
        if let Some(channels) = lock(&self.channels).as_ref() {
            channels.saving.send_if_modified(|current| {
                let changed = *current != saving;
                *current = saving;
                changed
            });
        }
    }

    fn publish_collaborators(&self, collaborators: Collaborators) {
        if let Some(channels) = lock(&self.channels).as_ref() {
            channels.collaborators.send_if_modified(|current| {
                let changed = *current != collaborators;
                *current = collaborators;
                changed
            });
        }
    }

    fn handle_event(&self, event: TransportEvent, tracker: &mut PresenceTracker) {
        match event {
            TransportEvent::Change { version, ops, .. } => self.apply_change(version, &ops),
            TransportEvent::Sys(sys) => self.apply_sys(sys),
            TransportEvent::Presence { user, focus } => {
                tracker.record(user, focus, Instant::now());
                self.publish_collaborators(tracker.snapshot());
            }
            TransportEvent::PresenceLeft { user } => {
                if tracker.remove(&user) {
                    self.publish_collaborators(tracker.snapshot());
                }
            }
            TransportEvent::Disconnected { recoverable: true } => {
                log::warn!("{}: connection lost, transport retrying", self.key());
                self.status.send_if_modified(|status| {
                    if *status != DocumentStatus::Connected {
                        return false;
                    }
                    *status = DocumentStatus::Disconnected { reload_required: false };
                    true
                });
            }
            TransportEvent::Disconnected { recoverable: false } => {
                tracker.clear();
                self.publish_collaborators(Collaborators::new());
                self.lost("connection lost");
            }
            TransportEvent::Reconnected => {
                let resumed = self.status.send_if_modified(|status| {
                    if *status != (DocumentStatus::Disconnected { reload_required: false }) {
                        return false;
                    }
                    *status = DocumentStatus::Connected;
                    true
                });
                if resumed {
                    log::debug!("{}: reconnected", self.key());
                    self.resync();
                }
            }
        }
    }

    fn apply_change(&self, version: u64, ops: &[Op]) {
        let mut outcome = Ok(());
        let mut gap = false;
        self.update_state(|state| {
            let current = state.sys.version;
            if version <= current {
                // Already part of the snapshot.
                return false;
            }
            if version != current + 1 {
                gap = true;
                return false;
            }
            let mut raw = state.raw.clone();
            if let Err(e) = apply_all(&mut raw, ops) {
                outcome = Err(e);
                return false;
            }
            state.raw = raw;
            state.sys.version = version;
            state.sys.updated_at = Some(Utc::now());
            true
        });

        if gap {
            log::warn!("{}: missed changes before version {version}, resyncing", self.key());
            self.resync();
        } else if let Err(e) = outcome {
            log::error!("{}: change {version} does not apply: {e}", self.key());
            self.lost("malformed change from transport");
        }
    }

    fn apply_sys(&self, sys: SysMetadata) {
        self.update_state(|state| {
            if sys.version < state.sys.version || sys == state.sys {
                return false;
            }
            state.sys = sys;
            true
        });
    }

    /// Replace local state with the session's authoritative snapshot.
    fn resync(&self) {
        let raw = self.session.snapshot();
        let sys = self.session.sys();
        self.update_state(|state| {
            if sys.version < state.sys.version {
                return false;
            }
            state.raw = raw;
            state.sys = sys;
            true
        });
    }

    /// Re-announce our presence so collaborators do not time us out.
    fn heartbeat(&self) {
        if self.status.borrow().is_terminal() {
            return;
        }
        let focus = lock(&self.local_focus).clone();
        self.session.send_presence(focus);
    }

    fn lost(&self, reason: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        log::warn!("{}: {reason}, reload required", self.key());
        self.status
            .send_replace(DocumentStatus::Disconnected { reload_required: true });
    }
}

impl Drop for DocumentInner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn run_events(
    inner: Weak<DocumentInner>,
    mut events: broadcast::Receiver<TransportEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
    presence_timeout: Duration,
) {
    let mut tracker = PresenceTracker::new(presence_timeout);
    let mut prune = tokio::time::interval(presence_timeout.max(Duration::from_millis(1)));
    prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let beat = (presence_timeout / 2).max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + beat, beat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                break;
            }
            received = events.recv() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                match received {
                    Ok(event) => inner.handle_event(event, &mut tracker),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("{}: skipped {skipped} events, resyncing", inner.key());
                        inner.resync();
                    }
                    Err(RecvError::Closed) => {
                        inner.lost("event stream closed");
                        break;
                    }
                }
            }
            _ = prune.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if tracker.prune(Instant::now()) {
                    inner.publish_collaborators(tracker.snapshot());
                }
            }
            _ = heartbeat.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.heartbeat();
            }
        }
    }
}

async fn version_reached(rx: &mut watch::Receiver<Arc<DocState>>, version: u64) -> bool {
    rx.wait_for(|state| state.sys.version >= version).await.is_ok()
}

async fn became_terminal(rx: &mut watch::Receiver<DocumentStatus>) -> Option<DocumentStatus> {
    rx.wait_for(DocumentStatus::is_terminal)
        .await
        .ok()
        .map(|status| DocumentStatus::clone(&status))
}

/// Handle to an open entity document. Clones share the same session.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocumentInner>,
}

impl Document {
    /// Open a live session for `entity_ref`.
    pub async fn open(
        transport: &dyn Transport,
        entity_ref: EntityRef,
        options: DocumentOptions,
    ) -> Result<Document> {
        let key = entity_ref.key();
        let session = transport.open(&key, entity_ref.entity_type).await?;
        let events = session.subscribe();
        let raw = session.snapshot();
        let sys = session.sys();
        log::debug!("opened {key} at version {}", sys.version);

        let (state, state_rx) = watch::channel(Arc::new(DocState {
            data: raw.clone(),
            raw,
            sys,
        }));
        let (saving, saving_rx) = watch::channel(false);
        let (collaborators, collaborators_rx) = watch::channel(Collaborators::new());
        let (status, _) = watch::channel(DocumentStatus::Connected);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let inner = Arc::new(DocumentInner {
            entity_ref,
            session,
            channels: Mutex::new(Some(Channels {
                state,
                saving,
                collaborators,
            })),
            state_rx,
            saving_rx,
            collaborators_rx,
            status,
            schema: Mutex::new(None),
            submit_lock: tokio::sync::Mutex::new(()),
            activity: options.activity,
            local_focus: Mutex::new(None),
            shutdown_tx,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(run_events(
            Arc::downgrade(&inner),
            events,
            shutdown_rx,
            options.config.presence.timeout(),
        ));

        Ok(Document { inner })
    }

    /// Release the transport session. Subscriber streams end; ops already
    /// submitted still complete. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.inner.shutdown_tx.send(());
        lock(&self.inner.channels).take();
        self.inner.status.send_replace(DocumentStatus::Closed);
        log::debug!("closed {}", self.inner.key());
        self.inner.session.close().await
    }

    pub fn entity_ref(&self) -> &EntityRef {
        &self.inner.entity_ref
    }

    pub fn status(&self) -> DocumentStatus {
        self.inner.status.borrow().clone()
    }

    pub fn status_property(&self) -> Property<DocumentStatus> {
        Property::from_watch(self.inner.status.subscribe())
    }

    pub fn state(&self) -> Arc<DocState> {
        self.inner.state()
    }

    pub fn sys(&self) -> SysMetadata {
        self.inner.state().sys.clone()
    }

    /// Emits whenever any sys attribute changes.
    pub fn sys_property(&self) -> Property<SysMetadata> {
        Property::from_watch(self.inner.state_rx.clone())
            .map(|state| state.sys.clone())
            .skip_duplicates()
    }

    pub fn is_saving(&self) -> bool {
        *self.inner.saving_rx.borrow()
    }

    /// True between a local submit and its acknowledgement or rejection.
    pub fn is_saving_property(&self) -> Property<bool> {
        Property::from_watch(self.inner.saving_rx.clone())
    }

    /// Path-scoped accessor.
    pub fn at(&self, path: Path) -> SubPath {
        SubPath {
            doc: self.clone(),
            path,
        }
    }

    pub fn field_locale(
        &self,
        field_id: impl Into<String>,
        locale: impl Into<String>,
    ) -> FieldLocaleView {
        FieldLocaleView::new(self.clone(), field_id.into(), locale.into())
    }

    /// Value in the normalized view.
    pub fn get_value_at(&self, path: &[PathSegment]) -> Option<Value> {
        value_at(&self.inner.state().data, path).cloned()
    }

    pub fn value_property_at(&self, path: &[PathSegment]) -> Property<Option<Value>> {
        let path = path.to_vec();
        Property::from_watch(self.inner.state_rx.clone())
            .map(move |state| value_at(&state.data, &path).cloned())
            .skip_duplicates()
    }

    pub async fn set_value_at(&self, path: &[PathSegment], value: Value) -> Result<()> {
        self.submit(|raw| mutation::set_ops(raw, path, value)).await
    }

    pub async fn remove_value_at(&self, path: &[PathSegment]) -> Result<()> {
        self.submit(|raw| mutation::remove_ops(raw, path)).await
    }

    pub async fn push_value_at(&self, path: &[PathSegment], value: Value) -> Result<()> {
        self.submit(|raw| mutation::push_ops(raw, path, value)).await
    }

    pub async fn insert_value_at(
        &self,
        path: &[PathSegment],
        index: usize,
        value: Value,
    ) -> Result<()> {
        self.submit(|raw| mutation::insert_ops(raw, path, index, value)).await
    }

    pub async fn move_value_at(&self, path: &[PathSegment], from: usize, to: usize) -> Result<()> {
        self.submit(|raw| mutation::move_ops(raw, path, from, to)).await
    }

    /// Everyone else with the document open, and where they are.
    pub fn collaborators(&self) -> Property<Collaborators> {
        Property::from_watch(self.inner.collaborators_rx.clone())
    }

    pub fn collaborators_for(&self, field_id: &str, locale: &str) -> Property<BTreeSet<UserRef>> {
        let field_id = field_id.to_string();
        let locale = locale.to_string();
        self.collaborators()
            .map(move |all| presence::users_at(all, &field_id, &locale))
            .skip_duplicates()
    }

    /// Announce local focus. Never blocks; dropped while the page is
    /// inactive or the document is no longer live.
    pub fn notify_focus(&self, field_id: &str, locale: &str) {
        if self.inner.status.borrow().is_terminal() {
            return;
        }
        if let Some(activity) = &self.inner.activity {
            if !activity.is_active() {
                return;
            }
        }
        let focus = FocusTarget::new(field_id, locale);
        *lock(&self.inner.local_focus) = Some(focus.clone());
        self.inner.session.send_presence(Some(focus));
    }

    /// Apply sys metadata returned by a REST write. Older metadata is
    /// ignored.
    pub fn apply_sys(&self, sys: SysMetadata) {
        self.inner.apply_sys(sys);
    }

    /// Set the normalization inputs. A malformed `fields` is repaired with
    /// a submitted op; everything else only changes the local view.
    pub async fn set_schema(
        &self,
        content_type: Option<ContentType>,
        locales: Vec<Locale>,
    ) -> Result<Normalization> {
        if fields_malformed(&self.inner.state().raw) {
            log::warn!("{}: resetting malformed fields", self.inner.key());
            self.set_value_at(&key_path(&["fields"]), Value::Object(Map::new()))
                .await?;
        }
        *lock(&self.inner.schema) = Some(SchemaInputs {
            content_type,
            locales,
        });
        let report = self.inner.renormalize();
        if !report.is_noop() {
            log::debug!(
                "{}: view drops fields {:?} and locales {:?}",
                self.inner.key(),
                report.removed_fields,
                report.removed_locales
            );
        }
        Ok(report)
    }

    /// Whether there is anything newer than the last publish.
    pub fn has_unpublished_changes(&self) -> bool {
        let sys = self.sys();
        match sys.published_version {
            None => true,
            Some(published) => sys.version > published + 1,
        }
    }

    /// Snapshot of the authoritative state as a REST entity.
    pub fn entity(&self) -> Entity {
        let state = self.inner.state();
        let fields = state
            .raw
            .get("fields")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let sys = state.sys.clone();
        match sys.entity_type {
            EntityType::Entry => {
                let content_type_id = lock(&self.inner.schema)
                    .as_ref()
                    .and_then(|inputs| inputs.content_type.as_ref())
                    .map(|ct| ct.id.clone())
                    .unwrap_or_default();
                Entity::Entry(Entry {
                    sys,
                    content_type_id,
                    fields,
                })
            }
            EntityType::Asset => Entity::Asset(Asset { sys, fields }),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        match *self.inner.status.borrow() {
            DocumentStatus::Closed => Err(SyncError::InvalidState(format!(
                "{} is closed",
                self.inner.key()
            ))),
            DocumentStatus::Disconnected { reload_required: true } => Err(SyncError::Disconnected),
            _ => Ok(()),
        }
    }

    /// Build ops against the acknowledged snapshot and submit them. Resolves
    /// once the committed version has been applied locally.
    async fn submit<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(&Value) -> Result<Vec<Op>>,
    {
        self.ensure_writable()?;
        let _turn = self.inner.submit_lock.lock().await;
        self.ensure_writable()?;

        let state = self.inner.state();
        let ops = build(&state.raw)?;
        if ops.is_empty() {
            return Ok(());
        }

        self.inner.set_saving(true);
        let result = match self.inner.session.submit_op(ops, state.sys.version).await {
            Ok(version) => self.wait_for_version(version).await,
            Err(e) => Err(e),
        };
        self.inner.set_saving(false);

        if let Err(e) = &result {
            log::debug!("{}: submit failed: {e}", self.inner.key());
            if *e == SyncError::Disconnected {
                self.inner.lost("transport refused submit");
            }
        }
        result
    }

    async fn wait_for_version(&self, version: u64) -> Result<()> {
        let mut state_rx = self.inner.state_rx.clone();
        let mut status_rx = self.inner.status.subscribe();
        tokio::select! {
            // Closing after the ack also ends the wait; the op is committed.
            _ = version_reached(&mut state_rx, version) => Ok(()),
            status = became_terminal(&mut status_rx) => match status {
                Some(DocumentStatus::Closed) => Ok(()),
                _ => Err(SyncError::Disconnected),
            },
        }
    }
}

impl Versioned for Document {
    fn version(&self) -> u64 {
        self.inner.state().sys.version
    }

    fn published_version(&self) -> Option<u64> {
        self.inner.state().sys.published_version
    }

    fn archived_version(&self) -> Option<u64> {
        self.inner.state().sys.archived_version
    }

    fn data(&self) -> Value {
        self.inner
            .state()
            .raw
            .get("fields")
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// A path into a document.
#[derive(Clone)]
pub struct SubPath {
    doc: Document,
    path: Path,
}

impl SubPath {
    pub fn path(&self) -> &[PathSegment] {
        &self.path
    }

    pub fn at(&self, segment: impl Into<PathSegment>) -> SubPath {
        let mut path = self.path.clone();
        path.push(segment.into());
        self.doc.at(path)
    }

    pub fn get(&self) -> Option<Value> {
        self.doc.get_value_at(&self.path)
    }

    pub fn value_property(&self) -> Property<Option<Value>> {
        self.doc.value_property_at(&self.path)
    }

    pub async fn set(&self, value: Value) -> Result<()> {
        self.doc.set_value_at(&self.path, value).await
    }

    pub async fn remove(&self) -> Result<()> {
        self.doc.remove_value_at(&self.path).await
    }

    pub async fn push(&self, value: Value) -> Result<()> {
        self.doc.push_value_at(&self.path, value).await
    }

    pub async fn insert(&self, index: usize, value: Value) -> Result<()> {
        self.doc.insert_value_at(&self.path, index, value).await
    }

    pub async fn move_item(&self, from: usize, to: usize) -> Result<()> {
        self.doc.move_value_at(&self.path, from, to).await
    }
}
