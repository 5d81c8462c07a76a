//! Translate path-level edits into ops against the raw snapshot.
//!
//! Every builder inspects the snapshot as acknowledged so far and returns
//! the ops needed; an empty batch means the edit is already in place.

use serde_json::{Map, Value};

use crate::error::{Result, SyncError};
use crate::ot::op::{display_path, value_at, Op, Path, PathSegment};

fn invalid(path: &[PathSegment]) -> SyncError {
    SyncError::InvalidPath(display_path(path))
}

fn child(path: &[PathSegment], segment: PathSegment) -> Path {
    let mut p = path.to_vec();
    p.push(segment);
    p
}

/// Set `value` at `path`, creating missing intermediate objects.
pub fn set_ops(snapshot: &Value, path: &[PathSegment], value: Value) -> Result<Vec<Op>> {
    if path.is_empty() {
        return Err(invalid(path));
    }
    if let Some(current) = value_at(snapshot, path) {
        if *current == value {
            return Ok(Vec::new());
        }
        let op = match path.last() {
            Some(PathSegment::Index(_)) => Op::ListReplace {
                p: path.to_vec(),
                ld: current.clone(),
                li: value,
            },
            _ => Op::ObjectReplace {
                p: path.to_vec(),
                od: current.clone(),
                oi: value,
            },
        };
        return Ok(vec![op]);
    }

    // Deepest existing ancestor.
    let existing = (0..path.len())
        .rev()
        .find(|&depth| value_at(snapshot, &path[..depth]).is_some())
        .ok_or_else(|| invalid(path))?;
    let container = value_at(snapshot, &path[..existing]).ok_or_else(|| invalid(path))?;

    if let (Value::Array(items), PathSegment::Index(i)) = (container, &path[existing]) {
        if existing + 1 == path.len() && *i == items.len() {
            return Ok(vec![Op::ListInsert {
                p: path.to_vec(),
                li: value,
            }]);
        }
        return Err(invalid(path));
    }
    if !container.is_object() {
        return Err(invalid(path));
    }

    let mut nested = value;
    for segment in path[existing + 1..].iter().rev() {
        match segment {
            PathSegment::Key(k) => {
                let mut map = Map::new();
                map.insert(k.clone(), nested);
                nested = Value::Object(map);
            }
            PathSegment::Index(_) => return Err(invalid(path)),
        }
    }
    match &path[existing] {
        PathSegment::Key(_) => Ok(vec![Op::ObjectInsert {
            p: path[..=existing].to_vec(),
            oi: nested,
        }]),
        PathSegment::Index(_) => Err(invalid(path)),
    }
}

pub fn remove_ops(snapshot: &Value, path: &[PathSegment]) -> Result<Vec<Op>> {
    let Some(current) = value_at(snapshot, path) else {
        return Ok(Vec::new());
    };
    let op = match path.last() {
        Some(PathSegment::Index(_)) => Op::ListDelete {
            p: path.to_vec(),
            ld: current.clone(),
        },
        Some(PathSegment::Key(_)) => Op::ObjectDelete {
            p: path.to_vec(),
            od: current.clone(),
        },
        None => return Err(invalid(path)),
    };
    Ok(vec![op])
}

/// Insert into the list at `path`. A missing list is created when
/// inserting at index 0.
pub fn insert_ops(
    snapshot: &Value,
    path: &[PathSegment],
    index: usize,
    value: Value,
) -> Result<Vec<Op>> {
    match value_at(snapshot, path) {
        None if index == 0 => set_ops(snapshot, path, Value::Array(vec![value])),
        Some(Value::Array(items)) if index <= items.len() => Ok(vec![Op::ListInsert {
            p: child(path, PathSegment::Index(index)),
            li: value,
        }]),
        _ => Err(invalid(&child(path, PathSegment::Index(index)))),
    }
}

pub fn push_ops(snapshot: &Value, path: &[PathSegment], value: Value) -> Result<Vec<Op>> {
    let len = match value_at(snapshot, path) {
        None => 0,
        Some(Value::Array(items)) => items.len(),
        Some(_) => return Err(invalid(path)),
    };
    insert_ops(snapshot, path, len, value)
}

pub fn move_ops(snapshot: &Value, path: &[PathSegment], from: usize, to: usize) -> Result<Vec<Op>> {
    match value_at(snapshot, path) {
        Some(Value::Array(items)) if from < items.len() && to < items.len() => {
            if from == to {
                return Ok(Vec::new());
            }
            Ok(vec![Op::ListMove {
                p: child(path, PathSegment::Index(from)),
                lm: to,
            }])
        }
        _ => Err(invalid(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::op::{apply_all, key_path};
    use serde_json::json;

    fn applied(mut snapshot: Value, ops: &[Op]) -> Value {
        apply_all(&mut snapshot, ops).unwrap();
        snapshot
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let snapshot = json!({"fields": {}});
        let ops =
            set_ops(&snapshot, &key_path(&["fields", "title", "en-US"]), json!("Hi")).unwrap();
        assert_eq!(
            ops,
            vec![Op::ObjectInsert {
                p: key_path(&["fields", "title"]),
                oi: json!({"en-US": "Hi"}),
            }]
        );
        assert_eq!(applied(snapshot, &ops), json!({"fields": {"title": {"en-US": "Hi"}}}));
    }

    #[test]
    fn test_set_replaces_and_skips_unchanged() {
        let snapshot = json!({"fields": {"title": {"en-US": "Hi"}}});
        let path = key_path(&["fields", "title", "en-US"]);
        assert!(set_ops(&snapshot, &path, json!("Hi")).unwrap().is_empty());

        let ops = set_ops(&snapshot, &path, json!("Hello")).unwrap();
        assert!(matches!(&ops[0], Op::ObjectReplace { od, .. } if *od == json!("Hi")));
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let snapshot = json!({"fields": {"title": "flat"}});
        assert!(set_ops(&snapshot, &key_path(&["fields", "title", "en-US"]), json!(1)).is_err());
    }

    #[test]
    fn test_list_builders() {
        let path = key_path(&["fields", "tags", "en-US"]);
        let empty = json!({"fields": {}});

        let created = applied(empty.clone(), &push_ops(&empty, &path, json!("a")).unwrap());
        assert_eq!(created, json!({"fields": {"tags": {"en-US": ["a"]}}}));

        let pushed = applied(created.clone(), &push_ops(&created, &path, json!("b")).unwrap());
        let inserted = applied(pushed.clone(), &insert_ops(&pushed, &path, 0, json!("z")).unwrap());
        assert_eq!(value_at(&inserted, &path), Some(&json!(["z", "a", "b"])));

        let moved = applied(inserted.clone(), &move_ops(&inserted, &path, 0, 2).unwrap());
        assert_eq!(value_at(&moved, &path), Some(&json!(["a", "b", "z"])));

        let mut item = path.clone();
        item.push(PathSegment::Index(1));
        let removed = applied(moved.clone(), &remove_ops(&moved, &item).unwrap());
        assert_eq!(value_at(&removed, &path), Some(&json!(["a", "z"])));

        assert!(insert_ops(&removed, &path, 9, json!("x")).is_err());
        assert!(move_ops(&removed, &path, 0, 5).is_err());
        assert!(insert_ops(&empty, &path, 3, json!("x")).is_err());
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let snapshot = json!({"fields": {}});
        assert!(remove_ops(&snapshot, &key_path(&["fields", "gone"])).unwrap().is_empty());
    }
}
