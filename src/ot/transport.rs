//! Transport trait definitions
//!
//! The OT engine is an external collaborator. The document layer only sees
//! this contract: open a session for an entity key, submit ops against a
//! base version, and receive every committed change in version order.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::op::Op;
use crate::entity::{EntityType, SysMetadata, UserRef};
use crate::error::Result;

/// Where a committed change came from, relative to the receiving session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// Submitted through this session; this is the acknowledgement.
    Local,
    /// Submitted by a collaborator.
    Remote,
}

/// A field/locale a collaborator is focused on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FocusTarget {
    pub field_id: String,
    pub locale: String,
}

impl FocusTarget {
    pub fn new(field_id: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            field_id: field_id.into(),
            locale: locale.into(),
        }
    }
}

/// Events delivered by an open transport session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A committed change. `version` is the document version after it.
    Change {
        version: u64,
        ops: Vec<Op>,
        origin: ChangeOrigin,
    },
    /// Server-side sys update (publish, archive, ...).
    Sys(SysMetadata),
    Presence {
        user: UserRef,
        focus: Option<FocusTarget>,
    },
    PresenceLeft {
        user: UserRef,
    },
    /// Session lost. When not recoverable the session will never resume.
    Disconnected {
        recoverable: bool,
    },
    Reconnected,
}

/// Opens live sessions for entities.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session for `key` (`space:type:id`).
    async fn open(&self, key: &str, entity_type: EntityType) -> Result<Arc<dyn TransportDoc>>;
}

/// One live session bound to one entity document.
#[async_trait]
pub trait TransportDoc: Send + Sync {
    /// Snapshot as of `version()`.
    fn snapshot(&self) -> Value;

    fn version(&self) -> u64;

    fn sys(&self) -> SysMetadata;

    /// Submit ops based on `base_version`. Resolves with the committed
    /// version once acknowledged. The commit is also delivered through
    /// `subscribe()` as a `Local` change.
    async fn submit_op(&self, ops: Vec<Op>, base_version: u64) -> Result<u64>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Fire-and-forget presence broadcast.
    fn send_presence(&self, focus: Option<FocusTarget>);

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focus_target_equality() {
        assert_eq!(FocusTarget::new("title", "en-US"), FocusTarget::new("title", "en-US"));
        assert_ne!(FocusTarget::new("title", "en-US"), FocusTarget::new("title", "de-DE"));
    }
}
