//! In-process backend
//!
//! Hosts authoritative entity documents entirely in memory. It plays both
//! external collaborators: the OT transport (sessions, versioning,
//! broadcast) and the REST persistence client. Used by integration tests
//! and the demo binary; failure injection hooks cover the disconnect,
//! conflict and rate-limit paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::op::{apply_all, Op};
use super::transport::{ChangeOrigin, FocusTarget, Transport, TransportDoc, TransportEvent};
use crate::client::EntityClient;
use crate::entity::{Asset, Entity, EntityRef, EntityType, Entry, SysMetadata, UserRef};
use crate::error::{Result, SyncError};

struct SessionHandle {
    user: UserRef,
    /// Last announced focus, replayed to sessions that join later.
    focus: Option<FocusTarget>,
    tx: broadcast::Sender<TransportEvent>,
    alive: Arc<AtomicBool>,
}

struct HostedDoc {
    snapshot: Value,
    sys: SysMetadata,
    content_type_id: Option<String>,
    published_fields: Option<Value>,
    /// Committed ops keyed by the version they produced.
    history: Vec<(u64, Vec<Op>)>,
    sessions: HashMap<Uuid, SessionHandle>,
}

impl HostedDoc {
    fn from_entity(entity: Entity) -> Self {
        let (sys, content_type_id, fields) = match entity {
            Entity::Entry(e) => (e.sys, Some(e.content_type_id), e.fields),
            Entity::Asset(a) => (a.sys, None, a.fields),
        };
        let published_fields = sys.published_version.map(|_| fields.clone());
        Self {
            snapshot: json!({ "fields": fields }),
            sys,
            content_type_id,
            published_fields,
            history: Vec::new(),
            sessions: HashMap::new(),
        }
    }

    fn fields(&self) -> Value {
        self.snapshot.get("fields").cloned().unwrap_or(Value::Null)
    }

    fn to_entity(&self, fields: Value) -> Entity {
        match &self.content_type_id {
            Some(ct) => Entity::Entry(Entry {
                sys: self.sys.clone(),
                content_type_id: ct.clone(),
                fields,
            }),
            None => Entity::Asset(Asset {
                sys: self.sys.clone(),
                fields,
            }),
        }
    }

    /// Commit a batch, rebasing over intervening ops that touch other paths.
    fn commit(&mut self, ops: &[Op], base_version: u64) -> Result<u64> {
        let current = self.sys.version;
        if base_version > current {
            return Err(SyncError::InvalidState(format!(
                "op based on future version {base_version} (server at {current})"
            )));
        }
        let conflicting = self
            .history
            .iter()
            .filter(|(version, _)| *version > base_version)
            .flat_map(|(_, committed)| committed.iter())
            .any(|committed| ops.iter().any(|op| op.conflicts_with(committed)));
        if conflicting {
            return Err(SyncError::VersionConflict(format!(
                "op based on {base_version} overlaps changes up to {current}"
            )));
        }

        apply_all(&mut self.snapshot, ops)?;
        self.bump(ops.to_vec());
        Ok(self.sys.version)
    }

    fn bump(&mut self, ops: Vec<Op>) {
        self.sys.version += 1;
        self.sys.updated_at = Some(Utc::now());
        self.history.push((self.sys.version, ops));
    }

    fn broadcast_change(&self, author: Option<Uuid>, ops: &[Op]) {
        for (id, session) in &self.sessions {
            let origin = if Some(*id) == author {
                ChangeOrigin::Local
            } else {
                ChangeOrigin::Remote
            };
            let _ = session.tx.send(TransportEvent::Change {
                version: self.sys.version,
                ops: ops.to_vec(),
                origin,
            });
        }
    }

    fn broadcast_except(&self, except: Uuid, event: TransportEvent) {
        for (id, session) in &self.sessions {
            if *id != except {
                let _ = session.tx.send(event.clone());
            }
        }
    }

    fn broadcast_all(&self, event: TransportEvent) {
        for session in self.sessions.values() {
            let _ = session.tx.send(event.clone());
        }
    }
}

#[derive(Default)]
struct BackendState {
    docs: HashMap<String, HostedDoc>,
    offline: bool,
    reject_next_op: Option<SyncError>,
    failing_requests: Vec<SyncError>,
    request_count: usize,
    latency: Duration,
}

/// The simulated server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBackend {
    space_id: String,
    state: Arc<Mutex<BackendState>>,
    event_buffer: usize,
}

impl MemoryBackend {
    pub fn new(space_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            state: Arc::new(Mutex::new(BackendState::default())),
            event_buffer: 256,
        }
    }

    /// Capacity of each session's event channel (at least 1).
    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Host an entity. Returns its reference.
    pub fn seed(&self, entity: Entity) -> EntityRef {
        let entity_ref = entity.entity_ref(self.space_id.clone());
        self.lock()
            .docs
            .insert(entity_ref.key(), HostedDoc::from_entity(entity));
        entity_ref
    }

    /// A transport connection acting as `user`.
    pub fn connect(&self, user: UserRef) -> MemoryTransport {
        MemoryTransport {
            backend: self.clone(),
            user,
        }
    }

    /// A REST client against this backend.
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            backend: self.clone(),
        }
    }

    /// While offline, opens, submits and REST calls fail with `Connection`.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// The next submitted op is rejected with `error`.
    pub fn reject_next_op(&self, error: SyncError) {
        self.lock().reject_next_op = Some(error);
    }

    /// The next REST calls fail with these errors, in order.
    pub fn fail_next_requests(&self, errors: Vec<SyncError>) {
        self.lock().failing_requests.extend(errors);
    }

    pub fn request_count(&self) -> usize {
        self.lock().request_count
    }

    /// Tell every session it lost its connection. Non-recoverable sessions
    /// refuse all further submissions.
    pub fn disconnect_all(&self, recoverable: bool) {
        let state = self.lock();
        for doc in state.docs.values() {
            for session in doc.sessions.values() {
                if !recoverable {
                    session.alive.store(false, Ordering::SeqCst);
                }
                let _ = session.tx.send(TransportEvent::Disconnected { recoverable });
            }
        }
    }

    pub fn reconnect_all(&self) {
        let state = self.lock();
        for doc in state.docs.values() {
            doc.broadcast_all(TransportEvent::Reconnected);
        }
    }

    /// Commit ops on behalf of a collaborator without an open session.
    pub fn push_remote_change(&self, entity_ref: &EntityRef, ops: Vec<Op>) -> Result<u64> {
        let mut state = self.lock();
        let doc = state
            .docs
            .get_mut(&entity_ref.key())
            .ok_or_else(|| SyncError::NotFound(entity_ref.key()))?;
        let base = doc.sys.version;
        let version = doc.commit(&ops, base)?;
        doc.broadcast_change(None, &ops);
        Ok(version)
    }

    /// Announce a collaborator's focus on every session of the entity.
    pub fn push_presence(&self, entity_ref: &EntityRef, user: UserRef, focus: Option<FocusTarget>) {
        let state = self.lock();
        if let Some(doc) = state.docs.get(&entity_ref.key()) {
            doc.broadcast_all(TransportEvent::Presence { user, focus });
        }
    }

    /// Authoritative fields, bypassing any session.
    pub fn fields(&self, entity_ref: &EntityRef) -> Option<Value> {
        self.lock().docs.get(&entity_ref.key()).map(HostedDoc::fields)
    }

    pub fn sys(&self, entity_ref: &EntityRef) -> Option<SysMetadata> {
        self.lock().docs.get(&entity_ref.key()).map(|d| d.sys.clone())
    }

    pub fn session_count(&self, entity_ref: &EntityRef) -> usize {
        self.lock()
            .docs
            .get(&entity_ref.key())
            .map_or(0, |d| d.sessions.len())
    }

    /// Run a REST mutation: failure injection, version check, sys bump and
    /// broadcast to open sessions.
    fn rest_write<F>(&self, entity: &Entity, mutate: F) -> Result<Entity>
    where
        F: FnOnce(&mut HostedDoc, &Entity) -> Result<()>,
    {
        let mut state = self.lock();
        Self::admit_request(&mut state)?;
        let key = entity.entity_ref(self.space_id.clone()).key();
        let doc = state
            .docs
            .get_mut(&key)
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;
        if entity.sys().version != doc.sys.version {
            return Err(SyncError::VersionConflict(format!(
                "{key}: request at version {}, server at {}",
                entity.sys().version,
                doc.sys.version
            )));
        }
        mutate(doc, entity)?;
        doc.broadcast_all(TransportEvent::Sys(doc.sys.clone()));
        Ok(doc.to_entity(doc.fields()))
    }

    fn admit_request(state: &mut BackendState) -> Result<()> {
        state.request_count += 1;
        if state.offline {
            return Err(SyncError::Connection("backend offline".into()));
        }
        if !state.failing_requests.is_empty() {
            return Err(state.failing_requests.remove(0));
        }
        Ok(())
    }
}

/// A connection to the backend acting as one user.
pub struct MemoryTransport {
    backend: MemoryBackend,
    user: UserRef,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, key: &str, entity_type: EntityType) -> Result<Arc<dyn TransportDoc>> {
        let mut state = self.backend.lock();
        if state.offline {
            return Err(SyncError::Connection(format!("cannot open {key}: backend offline")));
        }
        let doc = state
            .docs
            .get_mut(key)
            .ok_or_else(|| SyncError::NotFound(key.to_string()))?;
        if doc.sys.entity_type != entity_type {
            return Err(SyncError::InvalidState(format!(
                "{key} is an {}, not an {}",
                doc.sys.entity_type.as_str(),
                entity_type.as_str()
            )));
        }

        let session_id = Uuid::new_v4();
        let (tx, rx) = broadcast::channel(self.backend.event_buffer);
        let alive = Arc::new(AtomicBool::new(true));
        doc.broadcast_all(TransportEvent::Presence {
            user: self.user.clone(),
            focus: None,
        });
        // The newcomer learns who is already here.
        for session in doc.sessions.values() {
            let _ = tx.send(TransportEvent::Presence {
                user: session.user.clone(),
                focus: session.focus.clone(),
            });
        }
        doc.sessions.insert(
            session_id,
            SessionHandle {
                user: self.user.clone(),
                focus: None,
                tx: tx.clone(),
                alive: Arc::clone(&alive),
            },
        );
        log::debug!("{} opened {key} as session {session_id}", self.user.id);

        Ok(Arc::new(MemorySession {
            id: session_id,
            key: key.to_string(),
            user: self.user.clone(),
            backend: self.backend.clone(),
            tx,
            initial_rx: Mutex::new(Some(rx)),
            alive,
        }))
    }
}

/// One open document session.
pub struct MemorySession {
    id: Uuid,
    key: String,
    user: UserRef,
    backend: MemoryBackend,
    tx: broadcast::Sender<TransportEvent>,
    /// Receiver created with the session so no commit slips between open
    /// and the first subscribe.
    initial_rx: Mutex<Option<broadcast::Receiver<TransportEvent>>>,
    alive: Arc<AtomicBool>,
}

impl MemorySession {
    fn with_doc<T>(&self, f: impl FnOnce(&HostedDoc) -> T) -> Option<T> {
        self.backend.lock().docs.get(&self.key).map(f)
    }
}

#[async_trait]
impl TransportDoc for MemorySession {
    fn snapshot(&self) -> Value {
        self.with_doc(|d| d.snapshot.clone()).unwrap_or(Value::Null)
    }

    fn version(&self) -> u64 {
        self.with_doc(|d| d.sys.version).unwrap_or(0)
    }

    fn sys(&self) -> SysMetadata {
        self.with_doc(|d| d.sys.clone())
            .unwrap_or_else(|| SysMetadata::new(self.key.clone(), EntityType::Entry, 0))
    }

    async fn submit_op(&self, ops: Vec<Op>, base_version: u64) -> Result<u64> {
        let latency = self.backend.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.backend.lock();
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SyncError::Disconnected);
        }
        if state.offline {
            return Err(SyncError::Connection("backend offline".into()));
        }
        if let Some(error) = state.reject_next_op.take() {
            return Err(error);
        }
        let doc = state
            .docs
            .get_mut(&self.key)
            .ok_or_else(|| SyncError::NotFound(self.key.clone()))?;
        let version = doc.commit(&ops, base_version)?;
        doc.broadcast_change(Some(self.id), &ops);
        Ok(version)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        let initial = match self.initial_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        initial.unwrap_or_else(|| self.tx.subscribe())
    }

    fn send_presence(&self, focus: Option<FocusTarget>) {
        let mut state = self.backend.lock();
        if let Some(doc) = state.docs.get_mut(&self.key) {
            if let Some(session) = doc.sessions.get_mut(&self.id) {
                session.focus = focus.clone();
            }
            doc.broadcast_except(
                self.id,
                TransportEvent::Presence {
                    user: self.user.clone(),
                    focus,
                },
            );
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.backend.lock();
        if let Some(doc) = state.docs.get_mut(&self.key) {
            if let Some(session) = doc.sessions.remove(&self.id) {
                doc.broadcast_all(TransportEvent::PresenceLeft { user: session.user });
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        log::debug!("{} closed {}", self.user.id, self.key);
        Ok(())
    }
}

/// REST surface of the backend.
#[derive(Clone)]
pub struct MemoryClient {
    backend: MemoryBackend,
}

#[async_trait]
impl EntityClient for MemoryClient {
    async fn get(&self, entity_ref: &EntityRef) -> Result<Entity> {
        let mut state = self.backend.lock();
        MemoryBackend::admit_request(&mut state)?;
        state
            .docs
            .get(&entity_ref.key())
            .map(|d| d.to_entity(d.fields()))
            .ok_or_else(|| SyncError::NotFound(entity_ref.key()))
    }

    async fn get_published(&self, entity_ref: &EntityRef) -> Result<Entity> {
        let mut state = self.backend.lock();
        MemoryBackend::admit_request(&mut state)?;
        let doc = state
            .docs
            .get(&entity_ref.key())
            .ok_or_else(|| SyncError::NotFound(entity_ref.key()))?;
        let fields = doc
            .published_fields
            .clone()
            .ok_or_else(|| SyncError::NotFound(format!("{} is not published", entity_ref.key())))?;
        Ok(doc.to_entity(fields))
    }

    async fn save(&self, entity: &Entity) -> Result<Entity> {
        self.backend.rest_write(entity, |doc, entity| {
            let op = Op::ObjectReplace {
                p: vec!["fields".into()],
                od: doc.fields(),
                oi: entity.fields().clone(),
            };
            let base = doc.sys.version;
            doc.commit(std::slice::from_ref(&op), base)?;
            doc.broadcast_change(None, std::slice::from_ref(&op));
            Ok(())
        })
    }

    async fn delete(&self, entity: &Entity) -> Result<()> {
        let mut state = self.backend.lock();
        MemoryBackend::admit_request(&mut state)?;
        let key = entity.entity_ref(self.backend.space_id.clone()).key();
        let doc = state
            .docs
            .get(&key)
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;
        if doc.sys.published_version.is_some() {
            return Err(SyncError::ValidationRejected(
                "published entities cannot be deleted".into(),
            ));
        }
        for session in doc.sessions.values() {
            session.alive.store(false, Ordering::SeqCst);
        }
        doc.broadcast_all(TransportEvent::Disconnected { recoverable: false });
        state.docs.remove(&key);
        Ok(())
    }

    async fn publish(&self, entity: &Entity) -> Result<Entity> {
        self.backend.rest_write(entity, |doc, _| {
            if doc.sys.archived_version.is_some() {
                return Err(SyncError::ValidationRejected(
                    "archived entities cannot be published".into(),
                ));
            }
            doc.sys.published_version = Some(doc.sys.version);
            doc.published_fields = Some(doc.fields());
            doc.bump(Vec::new());
            Ok(())
        })
    }

    async fn unpublish(&self, entity: &Entity) -> Result<Entity> {
        self.backend.rest_write(entity, |doc, _| {
            if doc.sys.published_version.is_none() {
                return Err(SyncError::ValidationRejected("entity is not published".into()));
            }
            doc.sys.published_version = None;
            doc.published_fields = None;
            doc.bump(Vec::new());
            Ok(())
        })
    }

    async fn archive(&self, entity: &Entity) -> Result<Entity> {
        self.backend.rest_write(entity, |doc, _| {
            if doc.sys.published_version.is_some() {
                return Err(SyncError::ValidationRejected(
                    "published entities cannot be archived".into(),
                ));
            }
            doc.sys.archived_version = Some(doc.sys.version);
            doc.bump(Vec::new());
            Ok(())
        })
    }

    async fn unarchive(&self, entity: &Entity) -> Result<Entity> {
        self.backend.rest_write(entity, |doc, _| {
            if doc.sys.archived_version.is_none() {
                return Err(SyncError::ValidationRejected("entity is not archived".into()));
            }
            doc.sys.archived_version = None;
            doc.bump(Vec::new());
            Ok(())
        })
    }
}
