//! Entity identity and system metadata
//!
//! Entries and assets share one version model. Anything that can report
//! its version pair implements `Versioned`, which is all the revert
//! tracker needs to know about an entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Entry,
    Asset,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Entry => "Entry",
            EntityType::Asset => "Asset",
        }
    }
}

/// Identity of a content record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub space_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn entry(space_id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            entity_type: EntityType::Entry,
            entity_id: entity_id.into(),
        }
    }

    pub fn asset(space_id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            entity_type: EntityType::Asset,
            entity_id: entity_id.into(),
        }
    }

    /// Transport key: `space:type:id`.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.space_id, self.entity_type.as_str(), self.entity_id)
    }
}

/// The system-managed envelope of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SysMetadata {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SysMetadata {
    pub fn new(id: impl Into<String>, entity_type: EntityType, version: u64) -> Self {
        Self {
            id: id.into(),
            entity_type,
            version,
            published_version: None,
            archived_version: None,
            updated_at: None,
        }
    }
}

/// Another user with the document open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl UserRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }
}

/// Capability shared by everything that carries a version pair.
pub trait Versioned {
    fn version(&self) -> u64;

    fn published_version(&self) -> Option<u64>;

    fn archived_version(&self) -> Option<u64> {
        None
    }

    /// The entity's field data.
    fn data(&self) -> Value;

    fn is_published(&self) -> bool {
        self.published_version().is_some()
    }

    fn is_archived(&self) -> bool {
        self.archived_version().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub sys: SysMetadata,
    pub content_type_id: String,
    #[serde(default)]
    pub fields: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub sys: SysMetadata,
    #[serde(default)]
    pub fields: Value,
}

/// An entry or asset as seen by the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Entity {
    Entry(Entry),
    Asset(Asset),
}

impl Entity {
    pub fn sys(&self) -> &SysMetadata {
        match self {
            Entity::Entry(e) => &e.sys,
            Entity::Asset(a) => &a.sys,
        }
    }

    pub fn sys_mut(&mut self) -> &mut SysMetadata {
        match self {
            Entity::Entry(e) => &mut e.sys,
            Entity::Asset(a) => &mut a.sys,
        }
    }

    pub fn fields(&self) -> &Value {
        match self {
            Entity::Entry(e) => &e.fields,
            Entity::Asset(a) => &a.fields,
        }
    }

    pub fn fields_mut(&mut self) -> &mut Value {
        match self {
            Entity::Entry(e) => &mut e.fields,
            Entity::Asset(a) => &mut a.fields,
        }
    }

    pub fn entity_ref(&self, space_id: impl Into<String>) -> EntityRef {
        let sys = self.sys();
        EntityRef {
            space_id: space_id.into(),
            entity_type: sys.entity_type,
            entity_id: sys.id.clone(),
        }
    }
}

impl Versioned for Entity {
    fn version(&self) -> u64 {
        self.sys().version
    }

    fn published_version(&self) -> Option<u64> {
        self.sys().published_version
    }

    fn archived_version(&self) -> Option<u64> {
        self.sys().archived_version
    }

    fn data(&self) -> Value {
        self.fields().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(version: u64, published: Option<u64>) -> Entity {
        let mut sys = SysMetadata::new("e1", EntityType::Entry, version);
        sys.published_version = published;
        Entity::Entry(Entry {
            sys,
            content_type_id: "post".into(),
            fields: json!({"title": {"en-US": "Hello"}}),
        })
    }

    #[test]
    fn test_entity_key() {
        assert_eq!(EntityRef::entry("space1", "e1").key(), "space1:Entry:e1");
        assert_eq!(EntityRef::asset("space1", "a9").key(), "space1:Asset:a9");
    }

    #[test]
    fn test_versioned_entity() {
        let draft = entry(4, None);
        assert!(!draft.is_published());
        assert_eq!(draft.version(), 4);

        let published = entry(6, Some(5));
        assert!(published.is_published());
        assert!(!published.is_archived());
        assert_eq!(published.data(), json!({"title": {"en-US": "Hello"}}));
    }

    #[test]
    fn test_sys_wire_format() {
        let mut sys = SysMetadata::new("e1", EntityType::Asset, 3);
        sys.published_version = Some(2);
        let encoded = serde_json::to_value(&sys).unwrap();
        assert_eq!(
            encoded,
            json!({"id": "e1", "type": "Asset", "version": 3, "publishedVersion": 2})
        );
    }
}
