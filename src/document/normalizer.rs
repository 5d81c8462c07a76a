//! Snapshot normalization against the current schema
//!
//! Strips fields that no longer exist on the content type and locales that
//! no longer exist in the space. Works on a local copy only; nothing here
//! is submitted to the transport, so callers re-run it whenever the raw
//! snapshot or the schema inputs change.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::schema::{ContentType, Locale};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalization {
    /// `fields` was missing or not an object and was replaced by `{}`.
    pub fields_reset: bool,
    pub removed_fields: Vec<String>,
    /// `(field_id, locale_code)` pairs dropped.
    pub removed_locales: Vec<(String, String)>,
}

impl Normalization {
    pub fn is_noop(&self) -> bool {
        !self.fields_reset && self.removed_fields.is_empty() && self.removed_locales.is_empty()
    }
}

/// Whether the raw snapshot's `fields` needs resetting at the document
/// level (a submitted op, unlike the rest of normalization).
pub fn fields_malformed(snapshot: &Value) -> bool {
    !matches!(snapshot.get("fields"), Some(Value::Object(_)))
}

pub fn normalize(
    snapshot: &mut Value,
    content_type: Option<&ContentType>,
    locales: &[Locale],
) -> Normalization {
    let mut report = Normalization::default();

    if !snapshot.is_object() {
        *snapshot = Value::Object(Map::new());
    }
    if fields_malformed(snapshot) {
        snapshot["fields"] = Value::Object(Map::new());
        report.fields_reset = true;
    }
    let Some(Value::Object(fields)) = snapshot.get_mut("fields") else {
        return report;
    };

    if let Some(ct) = content_type {
        let known: HashSet<&str> = ct.fields.iter().map(|f| f.id.as_str()).collect();
        fields.retain(|field_id, _| {
            let keep = known.contains(field_id.as_str());
            if !keep {
                report.removed_fields.push(field_id.clone());
            }
            keep
        });
    }

    let codes: HashSet<&str> = locales.iter().map(|l| l.internal_code.as_str()).collect();
    for (field_id, value) in fields.iter_mut() {
        if let Value::Object(by_locale) = value {
            by_locale.retain(|code, _| {
                let keep = codes.contains(code.as_str());
                if !keep {
                    report.removed_locales.push((field_id.clone(), code.clone()));
                }
                keep
            });
        }
    }

    report
}
