//! Editor-level entity actions
//!
//! Publish and revert flows over an open document. Each REST write is
//! followed by the matching reverter callback only once the write has
//! succeeded.

use std::sync::Arc;

use crate::client::EntityClient;
use crate::document::Document;
use crate::entity::Entity;
use crate::error::{Result, SyncError};
use crate::ot::op::key_path;
use crate::reverter::EntryReverter;
use crate::warnings::PublicationWarnings;

pub struct EntityActions {
    document: Document,
    client: Arc<dyn EntityClient>,
    reverter: Arc<EntryReverter>,
    warnings: PublicationWarnings,
}

impl EntityActions {
    /// Wire actions for a loaded document. Initialises a reverter that
    /// reads the document's live state.
    pub fn for_document(
        document: Document,
        client: Arc<dyn EntityClient>,
        warnings: PublicationWarnings,
    ) -> Result<Self> {
        let source = document.clone();
        let reverter = Arc::new(EntryReverter::new(move || source.entity()));
        reverter.init()?;
        Ok(Self {
            document,
            client,
            reverter,
            warnings,
        })
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn reverter(&self) -> &EntryReverter {
        &self.reverter
    }

    pub fn warnings(&self) -> &PublicationWarnings {
        &self.warnings
    }

    /// Run the warning chain, then publish. A declined warning returns
    /// before any request is made.
    pub async fn publish(&self) -> Result<Entity> {
        self.warnings.show().await?;
        let published = self.client.publish(&self.document.entity()).await?;
        self.document.apply_sys(published.sys().clone());
        self.reverter.published_new_version()?;
        log::debug!(
            "published {} at version {:?}",
            self.document.entity_ref().key(),
            published.sys().published_version
        );
        Ok(published)
    }

    pub async fn unpublish(&self) -> Result<Entity> {
        let entity = self.client.unpublish(&self.document.entity()).await?;
        self.document.apply_sys(entity.sys().clone());
        Ok(entity)
    }

    pub async fn archive(&self) -> Result<Entity> {
        let entity = self.client.archive(&self.document.entity()).await?;
        self.document.apply_sys(entity.sys().clone());
        Ok(entity)
    }

    pub async fn unarchive(&self) -> Result<Entity> {
        let entity = self.client.unarchive(&self.document.entity()).await?;
        self.document.apply_sys(entity.sys().clone());
        Ok(entity)
    }

    /// Restore the fields the editor session started with.
    pub async fn revert_to_previous(&self) -> Result<()> {
        if !self.reverter.can_revert_to_previous() {
            return Err(SyncError::InvalidState("no previous version to revert to".into()));
        }
        let data = self
            .reverter
            .previous_data()
            .ok_or_else(|| SyncError::InvalidState("reverter not initialised".into()))?;
        self.document.set_value_at(&key_path(&["fields"]), data).await?;
        self.reverter.reverted_to_previous()
    }

    /// Restore the fields of the last published version.
    pub async fn revert_to_published(&self) -> Result<()> {
        if !self.reverter.can_revert_to_published() {
            return Err(SyncError::InvalidState("no published version to revert to".into()));
        }
        let published = self.client.get_published(self.document.entity_ref()).await?;
        self.document
            .set_value_at(&key_path(&["fields"]), published.fields().clone())
            .await?;
        self.reverter.reverted_to_published()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentOptions;
    use crate::entity::{EntityRef, EntityType, Entry, SysMetadata, UserRef, Versioned};
    use crate::ot::memory::MemoryBackend;
    use crate::warnings::{declined, Warning};
    use serde_json::json;

    async fn setup(
        version: u64,
        published: Option<u64>,
    ) -> (MemoryBackend, EntityRef, EntityActions) {
        let backend = MemoryBackend::new("space");
        let mut sys = SysMetadata::new("e1", EntityType::Entry, version);
        sys.published_version = published;
        let entity_ref = backend.seed(Entity::Entry(Entry {
            sys,
            content_type_id: "post".into(),
            fields: json!({"title": {"en-US": "Original"}}),
        }));
        let document = Document::open(
            &backend.connect(UserRef::new("alice")),
            entity_ref.clone(),
            DocumentOptions::default(),
        )
        .await
        .unwrap();
        let actions = EntityActions::for_document(
            document,
            Arc::new(backend.client()),
            PublicationWarnings::new(),
        )
        .unwrap();
        (backend, entity_ref, actions)
    }

    fn title() -> crate::ot::op::Path {
        key_path(&["fields", "title", "en-US"])
    }

    #[tokio::test]
    async fn test_publish_updates_document_and_reverter() {
        let (backend, entity_ref, actions) = setup(5, None).await;
        let published = actions.publish().await.unwrap();

        assert_eq!(published.sys().published_version, Some(5));
        assert_eq!(actions.document().version(), 6);
        assert_eq!(actions.document().published_version(), Some(5));
        assert_eq!(actions.reverter().tracked_published_version(), Some(5));
        assert_eq!(actions.reverter().tracked_previous_version(), Some(6));
        assert!(!actions.document().has_unpublished_changes());
        assert_eq!(backend.sys(&entity_ref).unwrap().published_version, Some(5));
    }

    #[tokio::test]
    async fn test_declined_warning_blocks_publish() {
        let (backend, _entity_ref, actions) = setup(5, None).await;
        actions
            .warnings()
            .register(Warning::new(|_| async { Err::<(), _>(declined("user cancelled")) }));

        let err = actions.publish().await.unwrap_err();
        assert_eq!(err, SyncError::WarningAborted("user cancelled".into()));
        assert_eq!(backend.request_count(), 0);
        assert_eq!(actions.document().published_version(), None);
    }

    #[tokio::test]
    async fn test_revert_to_previous_restores_session_start() {
        let (backend, entity_ref, actions) = setup(5, Some(3)).await;
        assert!(matches!(
            actions.revert_to_previous().await,
            Err(SyncError::InvalidState(_))
        ));

        actions.document().set_value_at(&title(), json!("Edited")).await.unwrap();
        assert_eq!(actions.document().version(), 6);
        assert!(actions.reverter().can_revert_to_previous());
        assert!(actions.reverter().can_revert_to_published());

        actions.revert_to_previous().await.unwrap();
        assert_eq!(actions.document().version(), 7);
        assert_eq!(actions.reverter().tracked_previous_version(), Some(7));
        assert_eq!(actions.reverter().tracked_published_version(), Some(3));
        assert!(!actions.reverter().can_revert_to_previous());
        assert!(actions.reverter().can_revert_to_published());
        assert_eq!(
            backend.fields(&entity_ref).unwrap(),
            json!({"title": {"en-US": "Original"}})
        );
    }

    #[tokio::test]
    async fn test_revert_to_published_fetches_published_fields() {
        let (backend, entity_ref, actions) = setup(1, None).await;
        actions.publish().await.unwrap(); // published 1, version 2
        actions.document().set_value_at(&title(), json!("Draft")).await.unwrap();
        assert!(actions.reverter().can_revert_to_published());

        actions.revert_to_published().await.unwrap();
        assert_eq!(
            backend.fields(&entity_ref).unwrap(),
            json!({"title": {"en-US": "Original"}})
        );
        assert!(!actions.reverter().can_revert_to_published());
        assert_eq!(actions.reverter().tracked_published_version(), Some(3));
    }

    #[tokio::test]
    async fn test_archive_cycle() {
        let (_backend, _entity_ref, actions) = setup(2, None).await;
        actions.archive().await.unwrap();
        assert!(actions.document().is_archived());
        assert!(matches!(actions.publish().await, Err(SyncError::ValidationRejected(_))));
        actions.unarchive().await.unwrap();
        assert!(!actions.document().is_archived());

        actions.publish().await.unwrap();
        actions.unpublish().await.unwrap();
        assert!(!actions.document().is_published());
    }
}
