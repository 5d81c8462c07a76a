//! Field/locale scoped view into a document.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::{lock, Document};
use crate::entity::UserRef;
use crate::error::Result;
use crate::observable::Property;
use crate::ot::op::{key_path, Path, PathSegment};

/// Handle for one `(field, locale)` value, created per field editor.
///
/// Remembers the last value it wrote so the editor is not notified of its
/// own round-tripped edit.
#[derive(Clone)]
pub struct FieldLocaleView {
    doc: Document,
    field_id: String,
    locale: String,
    path: Path,
    /// Outer `None` until the first `set`.
    last_set: Arc<Mutex<Option<Option<Value>>>>,
}

impl FieldLocaleView {
    pub(super) fn new(doc: Document, field_id: String, locale: String) -> Self {
        let path = key_path(&["fields", field_id.as_str(), locale.as_str()]);
        Self {
            doc,
            field_id,
            locale,
            path,
            last_set: Arc::new(Mutex::new(None)),
        }
    }

    pub fn field_id(&self) -> &str {
        &self.field_id
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn path(&self) -> &[PathSegment] {
        &self.path
    }

    pub fn get(&self) -> Option<Value> {
        self.doc.get_value_at(&self.path)
    }

    pub async fn set(&self, value: Value) -> Result<()> {
        *lock(&self.last_set) = Some(Some(value.clone()));
        match self.doc.set_value_at(&self.path, value).await {
            Ok(()) => Ok(()),
            Err(e) => {
                *lock(&self.last_set) = Some(self.get());
                Err(e)
            }
        }
    }

    /// Value changes, minus emissions equal to the last value written
    /// through this view.
    pub fn value_property(&self) -> Property<Option<Value>> {
        let last_set = Arc::clone(&self.last_set);
        self.doc
            .value_property_at(&self.path)
            .filter(move |value| match &*lock(&last_set) {
                Some(written) => written != value,
                None => true,
            })
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

    pub async fn remove(&self) -> Result<()> {
        self.doc.remove_value_at(&self.path).await
    }

    pub async fn remove_at(&self, index: usize) -> Result<()> {
        let mut path = self.path.clone();
        path.push(PathSegment::Index(index));
        self.doc.remove_value_at(&path).await
    }

    pub fn notify_focus(&self) {
        self.doc.notify_focus(&self.field_id, &self.locale);
    }

    /// Other users focused on this field and locale.
    pub fn collaborators(&self) -> Property<BTreeSet<UserRef>> {
        self.doc.collaborators_for(&self.field_id, &self.locale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentOptions;
    use crate::entity::{Entity, EntityRef, EntityType, Entry, SysMetadata};
    use crate::error::SyncError;
    use crate::ot::memory::MemoryBackend;
    use crate::ot::op::Op;
    use futures_util::stream::{BoxStream, StreamExt};
    use serde_json::json;
    use std::time::Duration;

    async fn open_title() -> (MemoryBackend, EntityRef, FieldLocaleView) {
        let backend = MemoryBackend::new("space");
        let entity_ref = backend.seed(Entity::Entry(Entry {
            sys: SysMetadata::new("e1", EntityType::Entry, 1),
            content_type_id: "post".into(),
            fields: json!({"title": {"en-US": "Hello"}}),
        }));
        let doc = Document::open(
            &backend.connect(UserRef::new("alice")),
            entity_ref.clone(),
            DocumentOptions::default(),
        )
        .await
        .unwrap();
        (backend, entity_ref, doc.field_locale("title", "en-US"))
    }

    async fn next(stream: &mut BoxStream<'static, Option<Value>>) -> Option<Option<Value>> {
        tokio::time::timeout(Duration::from_millis(200), stream.next())
            .await
            .ok()
            .flatten()
    }

    fn remote_set(backend: &MemoryBackend, entity_ref: &EntityRef, from: &str, to: &str) {
        backend
            .push_remote_change(
                entity_ref,
                vec![Op::ObjectReplace {
                    p: key_path(&["fields", "title", "en-US"]),
                    od: json!(from),
                    oi: json!(to),
                }],
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_own_edit_is_not_echoed() {
        let (backend, entity_ref, view) = open_title().await;
        let mut values = view.value_property().subscribe();
        assert_eq!(next(&mut values).await, Some(Some(json!("Hello"))));

        view.set(json!("Mine")).await.unwrap();
        assert_eq!(view.get(), Some(json!("Mine")));
        assert_eq!(next(&mut values).await, None, "own ack must be suppressed");

        remote_set(&backend, &entity_ref, "Mine", "Theirs");
        assert_eq!(next(&mut values).await, Some(Some(json!("Theirs"))));
    }

    #[tokio::test]
    async fn test_rejected_set_resets_to_authoritative_value() {
        let (backend, entity_ref, view) = open_title().await;
        let mut values = view.value_property().subscribe();
        assert_eq!(next(&mut values).await, Some(Some(json!("Hello"))));

        backend.reject_next_op(SyncError::ValidationRejected("nope".into()));
        assert!(view.set(json!("Bad")).await.is_err());
        assert_eq!(view.get(), Some(json!("Hello")));

        // The filter now holds the authoritative value, so a remote write
        // of "Bad" is a genuine change.
        remote_set(&backend, &entity_ref, "Hello", "Bad");
        assert_eq!(next(&mut values).await, Some(Some(json!("Bad"))));
    }

    #[tokio::test]
    async fn test_list_forwarders() {
        let (_backend, _entity_ref, view) = open_title().await;
        let doc = view.doc.clone();
        let tags = doc.field_locale("tags", "en-US");

        tags.push(json!("a")).await.unwrap();
        tags.push(json!("b")).await.unwrap();
        tags.insert(1, json!("c")).await.unwrap();
        tags.move_item(2, 0).await.unwrap();
        assert_eq!(tags.get(), Some(json!(["b", "a", "c"])));

        tags.remove_at(0).await.unwrap();
        assert_eq!(tags.get(), Some(json!(["a", "c"])));
        tags.remove().await.unwrap();
        assert_eq!(tags.get(), None);
        assert_eq!(tags.path(), key_path(&["fields", "tags", "en-US"]).as_slice());
    }
}
