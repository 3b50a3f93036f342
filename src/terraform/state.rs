//! Decoder for terraform's flattened text state dump.
//!
//! `terraform show` prints every resource as a `type.name:` header followed by
//! indented `key = value` lines, with nesting flattened into dotted keys:
//!
//! ```text
//! aws_instance.instance-1500000000:
//!   id = i-0abc
//!   tags.% = 1
//!   tags.Name = instance-1500000000
//!   security_groups.# = 1
//!   security_groups.3814588639 = default
//! ```
//!
//! A `.%` key marks its parent as a map, a `.#` key marks it as a list whose
//! element keys are opaque hashes. Decoded list order is therefore arbitrary.

use std::collections::BTreeMap;

use serde_json::{Number, Value};

const MAP_MARKER: &str = "%";
const LIST_MARKER: &str = "#";

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Scalar {
    /// Empty stays a string, otherwise numeric, then boolean, then string.
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return Scalar::Str(String::new());
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Scalar::Int(i);
        }
        if looks_numeric(raw) {
            if let Ok(f) = raw.parse::<f64>() {
                if f.is_finite() {
                    return Scalar::Float(f);
                }
            }
        }
        match raw {
            "true" => Scalar::Bool(true),
            "false" => Scalar::Bool(false),
            _ => Scalar::Str(raw.to_string()),
        }
    }
}

fn looks_numeric(raw: &str) -> bool {
    raw.bytes().any(|b| b.is_ascii_digit())
        && raw
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'))
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlatValue {
    Scalar(Scalar),
    List(Vec<FlatValue>),
    Map(BTreeMap<String, FlatValue>),
}

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::Int(i) => Value::Number(i.into()),
            Scalar::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            Scalar::Bool(b) => Value::Bool(b),
            Scalar::Str(s) => Value::String(s),
        }
    }
}

impl From<FlatValue> for Value {
    fn from(value: FlatValue) -> Self {
        match value {
            FlatValue::Scalar(scalar) => scalar.into(),
            FlatValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            FlatValue::Map(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

type Entries = Vec<(String, String)>;

#[derive(Default)]
struct Group {
    leaf: Option<String>,
    children: Entries,
}

/// Builds a nested value out of flattened `key -> raw value` pairs.
pub fn decode_flat(entries: impl IntoIterator<Item = (String, String)>) -> FlatValue {
    build_node(None, entries.into_iter().collect())
}

fn build_node(leaf: Option<String>, children: Entries) -> FlatValue {
    if children.is_empty() {
        return FlatValue::Scalar(Scalar::parse(leaf.as_deref().unwrap_or_default()));
    }
    if has_marker(&children, LIST_MARKER) {
        return build_list(children);
    }
    if has_marker(&children, MAP_MARKER) {
        return build_map(children);
    }
    FlatValue::Map(
        group(children)
            .into_iter()
            .map(|(segment, g)| (segment, build_node(g.leaf, g.children)))
            .collect(),
    )
}

fn build_list(children: Entries) -> FlatValue {
    let mut elements: Vec<(String, Group)> = group(without_marker(children, LIST_MARKER))
        .into_iter()
        .collect();
    elements.sort_by(|(a, _), (b, _)| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    });
    FlatValue::List(
        elements
            .into_iter()
            .map(|(_, g)| build_node(g.leaf, g.children))
            .collect(),
    )
}

fn build_map(children: Entries) -> FlatValue {
    let mut map = BTreeMap::new();
    for (segment, g) in group(without_marker(children, MAP_MARKER)) {
        let nested = has_marker(&g.children, LIST_MARKER) || has_marker(&g.children, MAP_MARKER);
        if g.children.is_empty() || nested {
            map.insert(segment, build_node(g.leaf, g.children));
            continue;
        }
        // Map keys may contain dots (`tags.kubernetes.io/cluster`); without a
        // marker underneath, the remainder belongs to the key.
        if let Some(leaf) = g.leaf {
            map.insert(segment.clone(), FlatValue::Scalar(Scalar::parse(&leaf)));
        }
        for (rest, raw) in g.children {
            map.insert(
                format!("{segment}.{rest}"),
                FlatValue::Scalar(Scalar::parse(&raw)),
            );
        }
    }
    FlatValue::Map(map)
}

fn has_marker(children: &Entries, marker: &str) -> bool {
    children.iter().any(|(key, _)| key == marker)
}

fn without_marker(children: Entries, marker: &str) -> Entries {
    children.into_iter().filter(|(key, _)| key != marker).collect()
}

fn group(children: Entries) -> BTreeMap<String, Group> {
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();
    for (key, raw) in children {
        match key.split_once('.') {
            Some((segment, rest)) => groups
                .entry(segment.to_string())
                .or_default()
                .children
                .push((rest.to_string(), raw)),
            None => groups.entry(key).or_default().leaf = Some(raw),
        }
    }
    groups
}

fn parse_assignment(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    let (key, value) = match trimmed.split_once(" = ") {
        Some((key, value)) => (key, value),
        None => (trimmed.strip_suffix(" =")?, ""),
    };
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

fn parse_header(line: &str) -> Option<String> {
    if line.starts_with(char::is_whitespace) || line.contains(" = ") {
        return None;
    }
    let (address, _) = line.trim_end().split_once(':')?;
    if address.contains('.') && !address.contains(char::is_whitespace) {
        Some(address.to_string())
    } else {
        None
    }
}

/// Decodes `terraform show` output into `type.name -> properties`.
///
/// Unparseable lines are skipped; output without any header is treated as a
/// single unnamed resource under the empty address.
pub fn decode_resources(text: &str) -> BTreeMap<String, FlatValue> {
    enum Cursor {
        Start,
        Resource(String),
        Ignored,
    }

    let mut resources: BTreeMap<String, Entries> = BTreeMap::new();
    let mut cursor = Cursor::Start;

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(address) = parse_header(line) {
            resources.entry(address.clone()).or_default();
            cursor = Cursor::Resource(address);
            continue;
        }
        let Some(entry) = parse_assignment(line) else {
            // Section titles such as `Outputs:` end the current resource.
            if !line.starts_with(char::is_whitespace) {
                cursor = Cursor::Ignored;
            }
            tracing::debug!(line, "skipping unparseable state line");
            continue;
        };
        if matches!(cursor, Cursor::Start) {
            cursor = Cursor::Resource(String::new());
        }
        if let Cursor::Resource(address) = &cursor {
            resources.entry(address.clone()).or_default().push(entry);
        }
    }

    resources
        .into_iter()
        .map(|(address, entries)| (address, decode_flat(entries)))
        .collect()
}

/// Decodes `terraform state show <address>` output for a single resource.
pub fn decode_resource(text: &str) -> FlatValue {
    let entries = text
        .lines()
        .filter(|line| parse_header(line).is_none())
        .filter_map(parse_assignment);
    decode_flat(entries)
}
