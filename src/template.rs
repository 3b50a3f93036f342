use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static SELF_INSTANCE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{\{\s*var\s+"self-instance-id"\s*\}\}"#).expect("template pattern is valid")
});

/// Substitutes `{{ var "self-instance-id" }}` in a string.
pub fn render_str(input: &str, instance_id: &str) -> String {
    SELF_INSTANCE_ID
        .replace_all(input, regex::NoExpand(instance_id))
        .into_owned()
}

/// Substitutes the instance ID in every string leaf of a JSON value.
pub fn render_value(value: &mut Value, instance_id: &str) {
    match value {
        Value::String(s) => {
            if SELF_INSTANCE_ID.is_match(s) {
                *s = render_str(s, instance_id);
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .for_each(|item| render_value(item, instance_id)),
        Value::Object(map) => map
            .values_mut()
            .for_each(|item| render_value(item, instance_id)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}
