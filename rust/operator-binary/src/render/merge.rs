//! Deep merge of user supplied partial objects into rendered ones.
//!
//! Both sides go through their JSON representation. Overlay leaves win, except for
//! empty values (`null`, `""`, `[]`, `{}`) which never erase what was rendered. Lists
//! of named items are merged entry by entry, every other list is replaced whole.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use snafu::ResultExt;

use super::{MergeOverlaySnafu, Result};

/// Keys whose array items are matched by their `name` field instead of replaced.
const NAMED_LISTS: &[&str] = &["containers", "initContainers", "env", "volumes"];

/// Merges `overlay` on top of `rendered`, returning the combined object.
pub fn merge_overlay<T, O>(rendered: T, overlay: &O, what: &'static str) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    O: Serialize + ?Sized,
{
    let mut base = serde_json::to_value(&rendered).context(MergeOverlaySnafu { what })?;
    let overlay = serde_json::to_value(overlay).context(MergeOverlaySnafu { what })?;
    merge_json(&mut base, &overlay);
    serde_json::from_value(base).context(MergeOverlaySnafu { what })
}

pub fn merge_json(base: &mut Value, overlay: &Value) {
    merge_value(base, overlay, None);
}

fn merge_value(base: &mut Value, overlay: &Value, key: Option<&str>) {
    if is_empty(overlay) {
        return;
    }
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                if is_empty(value) {
                    continue;
                }
                match base.get_mut(key) {
                    Some(existing) => merge_value(existing, value, Some(key)),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(overlay))
            if key.is_some_and(|key| NAMED_LISTS.contains(&key)) =>
        {
            for item in overlay {
                let existing = item_name(item)
                    .and_then(|name| base.iter_mut().find(|entry| item_name(entry) == Some(name)));
                match existing {
                    Some(existing) => merge_value(existing, item, None),
                    None => base.push(item.clone()),
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

fn item_name(item: &Value) -> Option<&str> {
    item.get("name").and_then(Value::as_str)
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
