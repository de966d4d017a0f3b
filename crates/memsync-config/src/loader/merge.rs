//! JSON merging for layered configuration.

use serde_json::{Map, Value};

/// Deep-merge `overlay` into `base`. Objects merge key by key; anything else,
/// arrays included, is replaced.
pub(super) fn merge_json_values(base: &mut Value, overlay: &Value) {
    if let (Value::Object(base_map), Value::Object(overlay_map)) = (&mut *base, overlay) {
        for (key, value) in overlay_map {
            match base_map.get_mut(key) {
                Some(existing) => merge_json_values(existing, value),
                None => {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
        return;
    }
    *base = overlay.clone();
}

/// Deep-merge `overlay` into `base`, leaving every key that `constraints`
/// pins to a non-object value untouched.
pub(super) fn merge_json_with_constraints(
    base: &mut Value,
    overlay: &Value,
    constraints: Option<&Value>,
) {
    let Some(constraints) = constraints else {
        merge_json_values(base, overlay);
        return;
    };
    let Value::Object(pinned) = constraints else {
        return;
    };
    let Value::Object(overlay_map) = overlay else {
        return;
    };
    if !base.is_object() {
        *base = Value::Object(Map::new());
    }
    let Value::Object(base_map) = base else {
        return;
    };
    for (key, value) in overlay_map {
        match pinned.get(key) {
            None => match base_map.get_mut(key) {
                Some(existing) => merge_json_values(existing, value),
                None => {
                    base_map.insert(key.clone(), value.clone());
                }
            },
            Some(nested) if nested.is_object() => {
                let entry = base_map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                merge_json_with_constraints(entry, value, Some(nested));
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::merge_json_with_constraints;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn pinned_keys_keep_required_values() {
        let mut base = json!({ "sync": { "hub": "kuzu", "conflict_log_limit": 10 } });
        let overlay = json!({ "sync": { "hub": "graph", "conflict_log_limit": 99 } });
        let constraints = json!({ "sync": { "hub": "kuzu" } });
        merge_json_with_constraints(&mut base, &overlay, Some(&constraints));
        assert_eq!(
            base,
            json!({ "sync": { "hub": "kuzu", "conflict_log_limit": 99 } })
        );
    }
}
