//! JSON-path navigation over plugin output.
//!
//! Supports the subset used by assertions and saves: dot-separated field
//! access, bracket and dot numeric indices (negative indices count from the
//! end), and a trailing `length` segment that yields the element count of an
//! array or the key count of an object. A leading `$` or `.` is accepted and
//! ignored.

use serde_json::Value;

/// Evaluate `path` against `value`, returning the addressed node.
///
/// Returns `None` when any segment fails to resolve, including an index out
/// of bounds or a field access on a non-object.
pub fn evaluate_json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in parse_segments(path)? {
        current = match segment {
            Segment::Field(name) => current.as_object()?.get(name.as_str())?,
            Segment::Index(index) => {
                let array = current.as_array()?;
                let resolved = resolve_index(index, array.len())?;
                array.get(resolved)?
            }
            Segment::Length => return None,
        };
    }
    Some(current)
}

/// Evaluate `path`, materializing computed segments such as `length`.
///
/// This is the entry point assertions and saves use: plain navigation borrows
/// from the document, while `length` produces a fresh number.
pub fn evaluate_json_path_owned(value: &Value, path: &str) -> Option<Value> {
    let segments = parse_segments(path)?;
    let mut current = value;
    for (position, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Field(name) => current = current.as_object()?.get(name.as_str())?,
            Segment::Index(index) => {
                let array = current.as_array()?;
                let resolved = resolve_index(*index, array.len())?;
                current = array.get(resolved)?;
            }
            Segment::Length => {
                // `length` is only meaningful as the final segment.
                if position + 1 != segments.len() {
                    return None;
                }
                let count = match current {
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    Value::String(text) => text.chars().count(),
                    _ => return None,
                };
                return Some(Value::from(count as u64));
            }
        }
    }
    Some(current.clone())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(i64),
    Length,
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    if index >= 0 {
        let index = index as usize;
        (index < len).then_some(index)
    } else {
        let back = index.unsigned_abs() as usize;
        (back <= len).then(|| len - back)
    }
}

fn parse_segments(path: &str) -> Option<Vec<Segment>> {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix('.').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Some(Vec::new());
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut characters = trimmed.chars().peekable();

    while let Some(character) = characters.next() {
        match character {
            '.' => {
                push_segment(&mut segments, &mut current)?;
            }
            '[' => {
                if !current.is_empty() {
                    push_segment(&mut segments, &mut current)?;
                }
                let mut inner = String::new();
                loop {
                    match characters.next() {
                        Some(']') => break,
                        Some(inner_character) => inner.push(inner_character),
                        None => return None,
                    }
                }
                let index: i64 = inner.trim().parse().ok()?;
                segments.push(Segment::Index(index));
            }
            _ => current.push(character),
        }
    }
    if !current.is_empty() {
        push_segment(&mut segments, &mut current)?;
    }
    Some(segments)
}

fn push_segment(segments: &mut Vec<Segment>, buffer: &mut String) -> Option<()> {
    if buffer.is_empty() {
        return None;
    }
    let segment = if buffer == "length" {
        Segment::Length
    } else if let Ok(index) = buffer.parse::<i64>() {
        Segment::Index(index)
    } else {
        Segment::Field(std::mem::take(buffer))
    };
    buffer.clear();
    segments.push(segment);
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn navigates_fields_and_indices() {
        let document = json!({"users": [{"id": "a"}, {"id": "b"}]});
        assert_eq!(
            evaluate_json_path(&document, ".users[0].id"),
            Some(&json!("a"))
        );
        assert_eq!(
            evaluate_json_path(&document, "$.users.1.id"),
            Some(&json!("b"))
        );
    }

    #[test]
    fn negative_indices_count_from_the_end() {
        let document = json!({"items": [1, 2, 3]});
        assert_eq!(
            evaluate_json_path_owned(&document, ".items[-1]"),
            Some(json!(3))
        );
        assert_eq!(evaluate_json_path_owned(&document, ".items[-4]"), None);
    }

    #[test]
    fn length_yields_array_and_object_sizes() {
        let document = json!({"items": [1, 2, 3], "meta": {"a": 1, "b": 2}});
        assert_eq!(
            evaluate_json_path_owned(&document, ".items.length"),
            Some(json!(3))
        );
        assert_eq!(
            evaluate_json_path_owned(&document, ".meta.length"),
            Some(json!(2))
        );
        // length before the end of the path does not resolve
        assert_eq!(evaluate_json_path_owned(&document, ".items.length.x"), None);
    }

    #[test]
    fn missing_segments_resolve_to_none() {
        let document = json!({"a": {"b": 1}});
        assert_eq!(evaluate_json_path(&document, ".a.c"), None);
        assert_eq!(evaluate_json_path(&document, ".a.b.c"), None);
        assert_eq!(evaluate_json_path(&document, ".a[0]"), None);
    }
}
