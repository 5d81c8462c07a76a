//! Persistence collaborator
//!
//! `EntityClient` is the REST surface the editor needs. `RateLimitedClient`
//! wraps any implementation so every call goes through a `RequestQueue`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::QueueConfig;
use crate::entity::{Entity, EntityRef};
use crate::error::{Result, SyncError};
use crate::request_queue::RequestQueue;

#[async_trait]
pub trait EntityClient: Send + Sync {
    async fn get(&self, entity_ref: &EntityRef) -> Result<Entity>;

    /// The entity as of its last publish.
    async fn get_published(&self, entity_ref: &EntityRef) -> Result<Entity>;

    async fn save(&self, entity: &Entity) -> Result<Entity>;

    async fn delete(&self, entity: &Entity) -> Result<()>;

    async fn publish(&self, entity: &Entity) -> Result<Entity>;

    async fn unpublish(&self, entity: &Entity) -> Result<Entity>;

    async fn archive(&self, entity: &Entity) -> Result<Entity>;

    async fn unarchive(&self, entity: &Entity) -> Result<Entity>;
}

/// A client call captured as data so it can be queued and replayed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Get(EntityRef),
    GetPublished(EntityRef),
    Save(Entity),
    Delete(Entity),
    Publish(Entity),
    Unpublish(Entity),
    Archive(Entity),
    Unarchive(Entity),
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::Get(_) => "get",
            ClientRequest::GetPublished(_) => "get_published",
            ClientRequest::Save(_) => "save",
            ClientRequest::Delete(_) => "delete",
            ClientRequest::Publish(_) => "publish",
            ClientRequest::Unpublish(_) => "unpublish",
            ClientRequest::Archive(_) => "archive",
            ClientRequest::Unarchive(_) => "unarchive",
        }
    }

    /// Run against a client. `Delete` yields `None`.
    pub async fn execute(self, client: &dyn EntityClient) -> Result<Option<Entity>> {
        match self {
            ClientRequest::Get(r) => client.get(&r).await.map(Some),
            ClientRequest::GetPublished(r) => client.get_published(&r).await.map(Some),
            ClientRequest::Save(e) => client.save(&e).await.map(Some),
            ClientRequest::Delete(e) => client.delete(&e).await.map(|_| None),
            ClientRequest::Publish(e) => client.publish(&e).await.map(Some),
            ClientRequest::Unpublish(e) => client.unpublish(&e).await.map(Some),
            ClientRequest::Archive(e) => client.archive(&e).await.map(Some),
            ClientRequest::Unarchive(e) => client.unarchive(&e).await.map(Some),
        }
    }
}

/// Routes every call of the wrapped client through a rate-limited queue.
#[derive(Clone)]
pub struct RateLimitedClient {
    queue: RequestQueue<ClientRequest, Option<Entity>>,
}

impl RateLimitedClient {
    pub fn new(inner: Arc<dyn EntityClient>, config: QueueConfig) -> Self {
        let queue = RequestQueue::create(config, move |request: ClientRequest| {
            let inner = Arc::clone(&inner);
            async move { request.execute(inner.as_ref()).await }
        });
        Self { queue }
    }

    pub fn queue(&self) -> &RequestQueue<ClientRequest, Option<Entity>> {
        &self.queue
    }

    async fn entity(&self, request: ClientRequest) -> Result<Entity> {
        let name = request.name();
        self.queue
            .dispatch(request)
            .await?
            .ok_or_else(|| SyncError::InvalidState(format!("{name} returned no entity")))
    }
}

#[async_trait]
impl EntityClient for RateLimitedClient {
    async fn get(&self, entity_ref: &EntityRef) -> Result<Entity> {
        self.entity(ClientRequest::Get(entity_ref.clone())).await
    }

    async fn get_published(&self, entity_ref: &EntityRef) -> Result<Entity> {
        self.entity(ClientRequest::GetPublished(entity_ref.clone())).await
    }

    async fn save(&self, entity: &Entity) -> Result<Entity> {
        self.entity(ClientRequest::Save(entity.clone())).await
    }

    async fn delete(&self, entity: &Entity) -> Result<()> {
        self.queue.dispatch(ClientRequest::Delete(entity.clone())).await.map(|_| ())
    }

    async fn publish(&self, entity: &Entity) -> Result<Entity> {
        self.entity(ClientRequest::Publish(entity.clone())).await
    }

    async fn unpublish(&self, entity: &Entity) -> Result<Entity> {
        self.entity(ClientRequest::Unpublish(entity.clone())).await
    }

    async fn archive(&self, entity: &Entity) -> Result<Entity> {
        self.entity(ClientRequest::Archive(entity.clone())).await
    }

    async fn unarchive(&self, entity: &Entity) -> Result<Entity> {
        self.entity(ClientRequest::Unarchive(entity.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityType, Entry, SysMetadata};
    use crate::ot::memory::MemoryBackend;
    use serde_json::json;

    fn seeded() -> (MemoryBackend, EntityRef) {
        let backend = MemoryBackend::new("space");
        let entity_ref = backend.seed(Entity::Entry(Entry {
            sys: SysMetadata::new("e1", EntityType::Entry, 3),
            content_type_id: "post".into(),
            fields: json!({"title": {"en-US": "Hi"}}),
        }));
        (backend, entity_ref)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_client_retries_429() {
        let (backend, entity_ref) = seeded();
        backend.fail_next_requests(vec![SyncError::RateLimited, SyncError::RateLimited]);
        let client = RateLimitedClient::new(Arc::new(backend.client()), QueueConfig::default());

        let entity = client.get(&entity_ref).await.unwrap();
        assert_eq!(entity.sys().version, 3);
        assert_eq!(backend.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_client_surfaces_other_errors() {
        let (backend, entity_ref) = seeded();
        let client = RateLimitedClient::new(Arc::new(backend.client()), QueueConfig::default());

        let entity = client.get(&entity_ref).await.unwrap();
        let published = client.publish(&entity).await.unwrap();
        assert_eq!(published.sys().published_version, Some(3));

        // Publishing the stale copy again is a conflict, not retried.
        assert!(client.publish(&entity).await.unwrap_err().is_conflict());
        assert_eq!(backend.request_count(), 3);

        assert!(matches!(
            client.delete(&published).await,
            Err(SyncError::ValidationRejected(_))
        ));
    }
}
