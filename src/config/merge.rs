//! Layered configuration merge. Nested tables merge key by key; any other
//! value in a later layer (arrays included) replaces the earlier one.

use serde_json::{Map, Value};

/// Merge `overlay` onto `base`.
pub fn deep_merge(mut base: Value, overlay: Value) -> Value {
    merge_into(&mut base, overlay);
    base
}

fn merge_into(target: &mut Value, overlay: Value) {
    match (target, overlay) {
        (Value::Object(target_map), Value::Object(overlay_map)) => merge_maps(target_map, overlay_map),
        (slot, overlay) => *slot = overlay,
    }
}

fn merge_maps(target: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match target.get_mut(&key) {
            Some(existing) => merge_into(existing, value),
            None => {
                target.insert(key, value);
            }
        }
    }
}

/// Fold configuration layers left to right; later layers win.
pub fn merge_layers(layers: impl IntoIterator<Item = Value>) -> Value {
    layers
        .into_iter()
        .fold(Value::Object(Map::new()), deep_merge)
}
