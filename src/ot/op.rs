//! JSON operations exchanged with the transport
//!
//! Ops follow the json0 shape: a path `p` plus one of the insert/delete
//! keys (`oi`, `od`, `li`, `ld`, `lm`). The transport owns merging; this
//! module only knows how to apply a committed op to a local snapshot.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};

/// One step into a JSON tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

pub type Path = Vec<PathSegment>;

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{i}"),
            PathSegment::Key(k) => write!(f, "{k}"),
        }
    }
}

/// Build a path of object keys.
pub fn key_path<S: AsRef<str>>(keys: &[S]) -> Path {
    keys.iter().map(|k| PathSegment::Key(k.as_ref().to_string())).collect()
}

pub fn display_path(path: &[PathSegment]) -> String {
    path.iter().map(ToString::to_string).collect::<Vec<_>>().join("/")
}

/// A single json0-style operation.
///
/// Variant order matters for untagged deserialization: replace variants
/// carry a superset of the insert/delete keys and must be tried first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Op {
    ObjectReplace { p: Path, od: Value, oi: Value },
    ListReplace { p: Path, ld: Value, li: Value },
    ListMove { p: Path, lm: usize },
    ObjectInsert { p: Path, oi: Value },
    ObjectDelete { p: Path, od: Value },
    ListInsert { p: Path, li: Value },
    ListDelete { p: Path, ld: Value },
}

impl Op {
    pub fn path(&self) -> &Path {
        match self {
            Op::ObjectReplace { p, .. }
            | Op::ListReplace { p, .. }
            | Op::ListMove { p, .. }
            | Op::ObjectInsert { p, .. }
            | Op::ObjectDelete { p, .. }
            | Op::ListInsert { p, .. }
            | Op::ListDelete { p, .. } => p,
        }
    }

    /// The subtree this op can disturb. List ops shift their siblings, so
    /// they claim the whole list.
    pub fn footprint(&self) -> &[PathSegment] {
        let p = self.path();
        match self {
            Op::ListMove { .. } | Op::ListInsert { .. } | Op::ListDelete { .. } => {
                &p[..p.len().saturating_sub(1)]
            }
            _ => p,
        }
    }

    pub fn conflicts_with(&self, other: &Op) -> bool {
        paths_conflict(self.footprint(), other.footprint())
    }
}

/// Two paths conflict when one is a prefix of the other.
pub fn paths_conflict(a: &[PathSegment], b: &[PathSegment]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

pub fn value_at<'a>(snapshot: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(snapshot, |node, segment| match (node, segment) {
        (Value::Object(map), PathSegment::Key(k)) => map.get(k),
        (Value::Array(items), PathSegment::Index(i)) => items.get(*i),
        _ => None,
    })
}

fn container_mut<'a>(snapshot: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value> {
    let mut node = snapshot;
    for segment in path {
        node = match (node, segment) {
            (Value::Object(map), PathSegment::Key(k)) => map.get_mut(k),
            (Value::Array(items), PathSegment::Index(i)) => items.get_mut(*i),
            _ => None,
        }
        .ok_or_else(|| SyncError::InvalidPath(display_path(path)))?;
    }
    Ok(node)
}

fn split(path: &[PathSegment]) -> Result<(&[PathSegment], &PathSegment)> {
    path.split_last()
        .map(|(last, parent)| (parent, last))
        .ok_or_else(|| SyncError::InvalidPath("empty path".into()))
}

fn object_at<'a>(
    snapshot: &'a mut Value,
    path: &[PathSegment],
) -> Result<(&'a mut Map<String, Value>, String)> {
    let (parent, last) = split(path)?;
    let key = match last {
        PathSegment::Key(k) => k.clone(),
        PathSegment::Index(_) => return Err(SyncError::InvalidPath(display_path(path))),
    };
    match container_mut(snapshot, parent)? {
        Value::Object(map) => Ok((map, key)),
        _ => Err(SyncError::InvalidPath(display_path(path))),
    }
}

fn list_at<'a>(
    snapshot: &'a mut Value,
    path: &[PathSegment],
) -> Result<(&'a mut Vec<Value>, usize)> {
    let (parent, last) = split(path)?;
    let index = match last {
        PathSegment::Index(i) => *i,
        PathSegment::Key(_) => return Err(SyncError::InvalidPath(display_path(path))),
    };
    match container_mut(snapshot, parent)? {
        Value::Array(items) => Ok((items, index)),
        _ => Err(SyncError::InvalidPath(display_path(path))),
    }
}

/// Apply one committed op to a snapshot in place.
pub fn apply(snapshot: &mut Value, op: &Op) -> Result<()> {
    let out_of_range = || SyncError::InvalidPath(display_path(op.path()));
    match op {
        Op::ObjectInsert { p, oi } => {
            let (map, key) = object_at(snapshot, p)?;
            map.insert(key, oi.clone());
        }
        Op::ObjectDelete { p, .. } => {
            let (map, key) = object_at(snapshot, p)?;
            map.remove(&key).ok_or_else(out_of_range)?;
        }
        Op::ObjectReplace { p, oi, .. } => {
            let (map, key) = object_at(snapshot, p)?;
            let slot = map.get_mut(&key).ok_or_else(out_of_range)?;
            *slot = oi.clone();
        }
        Op::ListInsert { p, li } => {
            let (items, index) = list_at(snapshot, p)?;
            if index > items.len() {
                return Err(out_of_range());
            }
            items.insert(index, li.clone());
        }
        Op::ListDelete { p, .. } => {
            let (items, index) = list_at(snapshot, p)?;
            if index >= items.len() {
                return Err(out_of_range());
            }
            items.remove(index);
        }
        Op::ListReplace { p, li, .. } => {
            let (items, index) = list_at(snapshot, p)?;
            let slot = items.get_mut(index).ok_or_else(out_of_range)?;
            *slot = li.clone();
        }
        Op::ListMove { p, lm } => {
            let (items, from) = list_at(snapshot, p)?;
            if from >= items.len() || *lm >= items.len() {
                return Err(out_of_range());
            }
            let moved = items.remove(from);
            items.insert(*lm, moved);
        }
    }
    Ok(())
}

/// Apply a batch atomically: on failure the snapshot is left untouched.
pub fn apply_all(snapshot: &mut Value, ops: &[Op]) -> Result<()> {
    let mut scratch = snapshot.clone();
    for op in ops {
        apply(&mut scratch, op)?;
    }
    *snapshot = scratch;
    Ok(())
}
