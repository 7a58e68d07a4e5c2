//! JSON helpers shared by the repositories and the auth layer.

use serde_json::Value;

/// Merge `src` into `dst` with Postgres `||` semantics: top-level object
/// keys from `src` overwrite keys in `dst`; nested objects are replaced,
/// not merged. Non-object operands make the result `src`.
pub fn merge_json(dst: &Value, src: &Value) -> Value {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            let mut out = dst_map.clone();
            for (k, v) in src_map {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        _ => src.clone(),
    }
}

/// Containment predicate mirroring Postgres jsonb `@>`, restricted to the
/// shape the metadata filters need:
/// - objects: every key in `filter` must be contained in `superset`,
///   recursing into nested objects;
/// - arrays: exact element-by-element match;
/// - scalars: equality.
pub fn json_contains(superset: &Value, filter: &Value) -> bool {
    match (superset, filter) {
        (Value::Object(sup), Value::Object(sub)) => sub
            .iter()
            .all(|(k, v)| sup.get(k).is_some_and(|sv| json_contains(sv, v))),
        (Value::Array(sup), Value::Array(sub)) => sup == sub,
        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overwrites_top_level_keys() {
        let merged = merge_json(
            &json!({"a": 1, "nested": {"x": 1, "y": 2}}),
            &json!({"b": 2, "nested": {"x": 9}}),
        );
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
        // `||` replaces nested objects wholesale.
        assert_eq!(merged["nested"], json!({"x": 9}));
    }

    #[test]
    fn merge_with_non_object_yields_src() {
        assert_eq!(merge_json(&json!({"a": 1}), &json!(null)), json!(null));
        assert_eq!(merge_json(&json!(3), &json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn contains_handles_nested_objects() {
        let sup = json!({"user": {"id": "u1", "org": "o1"}, "tag": "x"});
        assert!(json_contains(&sup, &json!({})));
        assert!(json_contains(&sup, &json!({"tag": "x"})));
        assert!(json_contains(&sup, &json!({"user": {"org": "o1"}})));
        assert!(!json_contains(&sup, &json!({"user": {"org": "o2"}})));
        assert!(!json_contains(&sup, &json!({"missing": true})));
    }

    #[test]
    fn contains_requires_exact_array_match() {
        let sup = json!({"tags": ["a", "b"]});
        assert!(json_contains(&sup, &json!({"tags": ["a", "b"]})));
        assert!(!json_contains(&sup, &json!({"tags": ["a"]})));
        assert!(!json_contains(&sup, &json!({"tags": ["b", "a"]})));
    }

    #[test]
    fn scalar_containment_is_equality() {
        assert!(json_contains(&json!(5), &json!(5)));
        assert!(!json_contains(&json!(5), &json!("5")));
    }
}
