//! Path-addressed reads and mutations on decoded documents.
//!
//! Every function walks `branch` one segment at a time. List segments are
//! integer indices (negative values count from the end); map segments are
//! keys that must already exist, except for the final segment of an insert.
//! No I/O happens here.

use std::collections::BTreeMap;

use starry_types::{Segment, Value};

use crate::error::{PathError, PathResult};

/// Resolve a possibly negative index against a list of `len` elements.
fn resolve_index(index: i64, len: usize) -> PathResult<usize> {
    let resolved = if index < 0 { len as i64 + index } else { index };
    if (0..len as i64).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(PathError::IndexOutOfRange { index, len })
    }
}

/// Like [`resolve_index`], but one past the end is a valid insert position.
fn resolve_insert_index(index: i64, len: usize) -> PathResult<usize> {
    let resolved = if index < 0 { len as i64 + index } else { index };
    if (0..=len as i64).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(PathError::IndexOutOfRange { index, len })
    }
}

/// Keep only `filters` in a map, or in every map of a list.
///
/// Leaves the value untouched unless every targeted map holds every filter
/// field.
fn project(value: Value, filters: &[String]) -> Value {
    let covers = |map: &BTreeMap<String, Value>| filters.iter().all(|f| map.contains_key(f));
    let retain = |mut map: BTreeMap<String, Value>| {
        map.retain(|k, _| filters.contains(k));
        Value::Map(map)
    };

    match value {
        Value::Map(map) if covers(&map) => retain(map),
        Value::List(items)
            if items.iter().all(|item| item.as_map().is_some_and(|m| covers(m))) =>
        {
            Value::List(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::Map(map) => retain(map),
                        other => other,
                    })
                    .collect(),
            )
        }
        other => other,
    }
}

/// Read the value at `branch`, then project it onto `filters`.
///
/// A string segment applied to a list of maps collects that field from every
/// element.
pub fn get_part(value: Value, branch: &[Segment], filters: &[String]) -> PathResult<Value> {
    let mut current = value;

    for segment in branch {
        current = match (current, segment) {
            (Value::List(mut items), Segment::Index(index)) => {
                let pos = resolve_index(*index, items.len())?;
                items.swap_remove(pos)
            }
            (current, Segment::Key(key)) => descend_key(current, key)?,
            (current, Segment::Select { key, fields }) => {
                let next = descend_key(current, key)?;
                if fields.is_empty() {
                    next
                } else {
                    project(next, fields)
                }
            }
            _ => return Err(PathError::Syntax),
        };
    }

    if filters.is_empty() {
        Ok(current)
    } else {
        Ok(project(current, filters))
    }
}

fn descend_key(current: Value, key: &str) -> PathResult<Value> {
    match current {
        Value::Map(mut map) => map.remove(key).ok_or(PathError::Syntax),
        Value::List(items) if items.iter().all(Value::is_map) => items
            .into_iter()
            .map(|item| match item {
                Value::Map(mut map) => map
                    .remove(key)
                    .ok_or_else(|| PathError::MissingField(key.to_string())),
                _ => Err(PathError::Syntax),
            })
            .collect::<PathResult<Vec<_>>>()
            .map(Value::List),
        _ => Err(PathError::Syntax),
    }
}

/// Borrow the existing child addressed by one segment.
fn child_mut<'a>(value: &'a mut Value, segment: &Segment) -> PathResult<&'a mut Value> {
    match (value, segment) {
        (Value::List(items), Segment::Index(index)) => {
            let pos = resolve_index(*index, items.len())?;
            Ok(&mut items[pos])
        }
        (Value::Map(map), Segment::Key(key)) => map.get_mut(key).ok_or(PathError::Syntax),
        _ => Err(PathError::Syntax),
    }
}

/// Overwrite the existing slot at `branch`.
///
/// Returns `false` when the slot already equals `part`, so the caller can
/// skip the write.
pub fn update_part(value: &mut Value, branch: &[Segment], part: Value) -> PathResult<bool> {
    let (first, rest) = branch.split_first().ok_or(PathError::Syntax)?;
    let slot = child_mut(value, first)?;

    if !rest.is_empty() {
        return update_part(slot, rest, part);
    }
    if *slot == part {
        return Ok(false);
    }
    *slot = part;
    Ok(true)
}

/// Insert `part` at `branch`.
///
/// A final list index shifts later elements right. A final map key is added,
/// or overwritten like [`update_part`] when present.
pub fn insert_part(value: &mut Value, branch: &[Segment], part: Value) -> PathResult<bool> {
    let (first, rest) = branch.split_first().ok_or(PathError::Syntax)?;

    if !rest.is_empty() {
        return insert_part(child_mut(value, first)?, rest, part);
    }

    match (value, first) {
        (Value::List(items), Segment::Index(index)) => {
            let pos = resolve_insert_index(*index, items.len())?;
            items.insert(pos, part);
            Ok(true)
        }
        (Value::Map(map), Segment::Key(key)) => {
            if map.get(key) == Some(&part) {
                return Ok(false);
            }
            map.insert(key.clone(), part);
            Ok(true)
        }
        _ => Err(PathError::Syntax),
    }
}

/// Remove the slot at `branch` from its parent.
pub fn delete_part(value: &mut Value, branch: &[Segment]) -> PathResult<()> {
    let (first, rest) = branch.split_first().ok_or(PathError::Syntax)?;

    if !rest.is_empty() {
        return delete_part(child_mut(value, first)?, rest);
    }

    match (value, first) {
        (Value::List(items), Segment::Index(index)) => {
            let pos = resolve_index(*index, items.len())?;
            items.remove(pos);
            Ok(())
        }
        (Value::Map(map), Segment::Key(key)) => {
            map.remove(key).map(|_| ()).ok_or(PathError::Syntax)
        }
        _ => Err(PathError::Syntax),
    }
}
