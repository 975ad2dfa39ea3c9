// Accessor Resolver - resolves { "$ref": "dot.path" } nodes against the
// run context. Resolution is total: an unreachable path degrades to null
// instead of failing the step.

use serde_json::Value;

/// Look up a dot-separated path inside a JSON tree. Object segments index
/// by key, array segments by numeric position; the first missing segment
/// yields `None`.
pub fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Recursively resolve every accessor node in a step-field tree.
///
/// `{ "$ref": path }` nodes are replaced by the context value at `path`
/// (null when unreachable). Plain objects recurse per property so that an
/// accessor buried at a leaf resolves without disturbing its siblings.
/// Arrays recurse per element. Literals, including explicit nulls, pass
/// through unchanged.
pub fn resolve(fields: &Value, context: &Value) -> Value {
    match fields {
        Value::Object(map) => {
            if let Some(Value::String(path)) = map.get("$ref") {
                if map.len() == 1 {
                    return lookup(context, path).cloned().unwrap_or(Value::Null);
                }
            }
            Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), resolve(value, context)))
                    .collect(),
            )
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| resolve(item, context)).collect())
        }
        literal => literal.clone(),
    }
}
