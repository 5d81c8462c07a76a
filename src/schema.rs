//! Content type and locale definitions consumed by snapshot normalization.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub disabled: bool,
}

impl FieldSpec {
    pub fn new(id: impl Into<String>, field_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            field_type: field_type.into(),
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentType {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl ContentType {
    pub fn new(id: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            fields,
        }
    }

    pub fn has_field(&self, field_id: &str) -> bool {
        self.fields.iter().any(|f| f.id == field_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locale {
    /// Code used as the key inside stored field values.
    pub internal_code: String,
    /// Public code shown to users.
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub default: bool,
}

impl Locale {
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            internal_code: code.clone(),
            name: code.clone(),
            code,
            default: false,
        }
    }
}
