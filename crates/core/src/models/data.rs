//! 不透明数据文档的合并与变量替换

use std::collections::BTreeMap;

use serde_json::Value;

/// 深度合并: `overlay` 中的标量与列表覆盖 `base`，对象逐键递归合并
pub fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            let mut merged = b.clone();
            for (key, value) in o {
                let next = match merged.get(key) {
                    Some(existing) => merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, Value::Null) => base.clone(),
        _ => overlay.clone(),
    }
}

/// 将字符串中的 `$(VAR)` 替换为 `env` 中的值，未定义的变量保持原样
pub fn substitute(document: &Value, env: &BTreeMap<String, String>) -> Value {
    match document {
        Value::String(s) => Value::String(expand(s, env)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, env)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, env)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn expand(s: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("$(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find(')') {
            Some(end) => {
                let name = &after[..end];
                match env.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("$(");
                        out.push_str(name);
                        out.push(')');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_rules() {
        let base = json!({"a": 1, "list": [1, 2], "nested": {"x": 1, "y": 2}});
        let overlay = json!({"a": 2, "list": [3], "nested": {"y": 3}, "extra": null});
        let merged = merge(&base, &overlay);
        assert_eq!(
            merged,
            json!({"a": 2, "list": [3], "nested": {"x": 1, "y": 3}, "extra": null})
        );
    }

    #[test]
    fn test_merge_preserves_key_order() {
        let merged = merge(&json!({"z": 1, "a": 1}), &json!({"m": 1}));
        let keys: Vec<&String> = merged.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_substitute() {
        let mut env = BTreeMap::new();
        env.insert("PORT".to_string(), "8000".to_string());
        let doc = json!({"url": "http://localhost:$(PORT)/x", "other": ["$(MISSING)", 3, "$(PORT"]});
        let out = substitute(&doc, &env);
        assert_eq!(out["url"], "http://localhost:8000/x");
        assert_eq!(out["other"][0], "$(MISSING)");
        assert_eq!(out["other"][1], 3);
        assert_eq!(out["other"][2], "$(PORT");
    }
}
