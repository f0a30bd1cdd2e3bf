//! Cypher text generation for Apache AGE.
//!
//! AGE has no bound parameters inside `cypher(...)`, so every value that
//! reaches query text goes through this module:
//!
//! - node ids become `x` + hex(utf8) labels, so only `[0-9a-fx]` is ever
//!   embedded for them
//! - property keys are back-quoted with inner backticks doubled
//! - property values are rendered as Cypher literals with JSON string escaping
//! - the whole query body is dollar-quoted with a tag that does not occur in it

use serde_json::Value;
use tracing::warn;

use crate::error::DecodeError;
use crate::storage::PropertyMap;

/// Upper bound on nodes returned by a subgraph query.
pub const MAX_GRAPH_NODES: usize = 1000;

const DOLLAR_TAG: &str = "lightrag";

/// `"x" + hex(utf8(label))`. Lossless: `decode_graph_label` returns the input.
pub fn encode_graph_label(label: &str) -> String {
    format!("x{}", hex::encode(label.as_bytes()))
}

pub fn decode_graph_label(encoded: &str) -> Result<String, DecodeError> {
    let digits = encoded.strip_prefix('x').unwrap_or(encoded);
    let bytes = hex::decode(digits).map_err(|_| DecodeError::Hex(encoded.to_string()))?;
    String::from_utf8(bytes).map_err(|_| DecodeError::Utf8(encoded.to_string()))
}

/// Decode a label, falling back to the encoded text when it is corrupt.
pub fn decode_graph_label_lossy(encoded: &str) -> String {
    decode_graph_label(encoded).unwrap_or_else(|err| {
        warn!(value = encoded, "Could not decode graph label: {}", err);
        encoded.to_string()
    })
}

/// Back-quote a map key.
pub fn quote_key(key: &str) -> String {
    format!("`{}`", key.replace('`', "``"))
}

/// Render a JSON value as a Cypher literal.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // serde_json string escaping matches the Cypher string grammar AGE accepts.
        Value::String(s) => Value::String(s.clone()).to_string(),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(literal).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => map_literal(map.iter()),
    }
}

fn map_literal<'a>(entries: impl Iterator<Item = (&'a String, &'a Value)>) -> String {
    let inner: Vec<String> = entries
        .map(|(k, v)| format!("{}: {}", quote_key(k), literal(v)))
        .collect();
    format!("{{{}}}", inner.join(", "))
}

/// Property map for `SET n += {...}`. When `id` is given and the map has no
/// `id` key, it is added.
pub fn format_properties(properties: &PropertyMap, id: Option<&str>) -> String {
    let mut entries: Vec<String> = properties
        .iter()
        .map(|(k, v)| format!("{}: {}", quote_key(k), literal(v)))
        .collect();
    if let Some(id) = id {
        if !properties.contains_key("id") {
            entries.push(format!("id: {}", literal(&Value::String(id.to_string()))));
        }
    }
    format!("{{{}}}", entries.join(", "))
}

/// Cypher string literal of an already-encoded label.
pub fn label_literal(encoded: &str) -> String {
    literal(&Value::String(encoded.to_string()))
}

fn dollar_tag(body: &str) -> String {
    let mut tag = format!("${DOLLAR_TAG}$");
    let mut n = 0;
    while body.contains(&tag) {
        n += 1;
        tag = format!("${DOLLAR_TAG}{n}$");
    }
    tag
}

/// Wrap a Cypher body into the SQL call AGE expects. Every result column is
/// declared `agtype`.
pub fn cypher_sql(graph_name: &str, body: &str, columns: &[&str]) -> String {
    let tag = dollar_tag(body);
    let columns: Vec<String> = columns.iter().map(|c| format!("{c} agtype")).collect();
    format!(
        "SELECT * FROM cypher('{graph_name}', {tag}\n{body}\n{tag}) AS ({})",
        columns.join(", ")
    )
}
