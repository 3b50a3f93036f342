//! Platform-specific encoding of instance tags.
//!
//! Map-style platforms keep tags as a JSON object. List-style platforms keep
//! them as `key:value` strings, so the comma-separated attach tag is stored
//! space-delimited there and restored on parse.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::platform::{TagStyle, VmType};
use crate::resource::{ResourceProperties, TAG_ATTACH};

pub type Tags = BTreeMap<String, String>;

/// Merges `new_tags` into the VM properties; new values win.
pub fn merge(vm: VmType, props: &mut ResourceProperties, new_tags: &Tags) {
    let property = vm.tag_property();
    match vm.tag_style() {
        TagStyle::Map => {
            let mut tags = match props.remove(property) {
                Some(Value::Object(existing)) => existing,
                _ => Map::new(),
            };
            for (key, value) in new_tags {
                tags.insert(key.clone(), Value::String(value.clone()));
            }
            props.insert(property.to_string(), Value::Object(tags));
        }
        TagStyle::List { lowercase_keys } => {
            let mut tags = parse_list(props.get(property));
            for (key, value) in new_tags {
                tags.retain(|existing, _| !existing.eq_ignore_ascii_case(key));
                tags.insert(key.clone(), value.clone());
            }
            let list = tags
                .into_iter()
                .map(|(key, value)| {
                    let key = if lowercase_keys {
                        key.to_lowercase()
                    } else {
                        key
                    };
                    let value = if key == TAG_ATTACH {
                        value.replace(',', " ")
                    } else {
                        value
                    };
                    Value::String(format!("{key}:{value}"))
                })
                .collect();
            props.insert(property.to_string(), Value::Array(list));
        }
    }
}

/// Reads the tags of a VM resource back into a flat map.
pub fn parse(vm: VmType, props: &ResourceProperties) -> Tags {
    match vm.tag_style() {
        TagStyle::Map => match props.get(vm.tag_property()) {
            Some(Value::Object(tags)) => tags
                .iter()
                .map(|(key, value)| (key.clone(), scalar_to_string(value)))
                .collect(),
            _ => Tags::new(),
        },
        TagStyle::List { .. } => parse_list(props.get(vm.tag_property())),
    }
}

fn parse_list(tags: Option<&Value>) -> Tags {
    let Some(Value::Array(entries)) = tags else {
        return Tags::new();
    };
    entries
        .iter()
        .filter_map(Value::as_str)
        .map(|entry| {
            let (key, value) = entry.split_once(':').unwrap_or((entry, ""));
            let value = if key.eq_ignore_ascii_case(TAG_ATTACH) {
                value.split_whitespace().collect::<Vec<_>>().join(",")
            } else {
                value.to_string()
            };
            (key.to_string(), value)
        })
        .collect()
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn encode_attach<S: AsRef<str>>(files: &[S]) -> String {
    files
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn decode_attach(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

/// Files listed in the attach tag of a VM resource.
pub fn attached_files(vm: VmType, props: &ResourceProperties) -> Vec<String> {
    parse(vm, props)
        .get(TAG_ATTACH)
        .map(|value| decode_attach(value))
        .unwrap_or_default()
}

/// Case-insensitive tag lookup.
pub fn find<'a>(tags: &'a Tags, key: &str) -> Option<&'a String> {
    tags.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}
