//! Decoder for AGE `agtype` text output.
//!
//! AGE prints graph values as JSON with type annotations appended to
//! composite values, e.g.
//!
//! ```text
//! {"id": 844424930131969, "label": "Entity", "properties": {...}}::vertex
//! [{"id": 1, ...}::vertex, {"id": 2, ...}::edge, {"id": 3, ...}::vertex]::path
//! ```
//!
//! Annotations are stripped outside string literals, the remainder is parsed
//! as JSON and vertices/edges are recognised by shape.

use std::collections::HashMap;

use serde_json::Value;
use tokio_postgres::SimpleQueryRow;
use tracing::warn;

use crate::error::DecodeError;
use crate::storage::PropertyMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub id: String,
    pub label: String,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub id: String,
    pub label: String,
    pub start_id: String,
    pub end_id: String,
    pub properties: PropertyMap,
}

/// One decoded agtype column.
#[derive(Debug, Clone, PartialEq)]
pub enum AgValue {
    Null,
    Vertex(Vertex),
    Edge(Edge),
    List(Vec<AgValue>),
    Scalar(Value),
    /// Text that could not be decoded, passed through as-is.
    Raw(String),
}

static NULL: AgValue = AgValue::Null;

impl AgValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AgValue::Null | AgValue::Scalar(Value::Null))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AgValue::Scalar(Value::Bool(b)) => Some(*b),
            AgValue::Scalar(Value::String(s)) | AgValue::Raw(s) => match s.as_str() {
                "t" | "true" => Some(true),
                "f" | "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AgValue::Scalar(Value::Number(n)) => n.as_i64(),
            AgValue::Scalar(Value::String(s)) | AgValue::Raw(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AgValue::Scalar(Value::String(s)) | AgValue::Raw(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vertex(&self) -> Option<&Vertex> {
        match self {
            AgValue::Vertex(v) => Some(v),
            _ => None,
        }
    }

    /// Map scalar, e.g. the result of `properties(r)`.
    pub fn as_object(&self) -> Option<&PropertyMap> {
        match self {
            AgValue::Scalar(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// Flatten a value into the vertices and edges it contains.
    pub fn collect_graph<'a>(&'a self, vertices: &mut Vec<&'a Vertex>, edges: &mut Vec<&'a Edge>) {
        match self {
            AgValue::Vertex(v) => vertices.push(v),
            AgValue::Edge(e) => edges.push(e),
            AgValue::List(items) => {
                for item in items {
                    item.collect_graph(vertices, edges);
                }
            }
            _ => {}
        }
    }
}

/// One result row, by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphRecord {
    columns: HashMap<String, AgValue>,
}

impl GraphRecord {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, AgValue)>) -> Self {
        Self {
            columns: pairs.into_iter().collect(),
        }
    }

    /// Decode every column of a text-protocol row.
    pub fn from_row(row: &SimpleQueryRow) -> Self {
        let pairs = row.columns().iter().enumerate().map(|(idx, column)| {
            let name = column.name().to_string();
            let value = decode_column(&name, row.get(idx));
            (name, value)
        });
        Self::from_pairs(pairs)
    }

    /// Missing columns read as [`AgValue::Null`].
    pub fn get(&self, column: &str) -> &AgValue {
        self.columns.get(column).unwrap_or(&NULL)
    }
}

/// Decode a column, degrading to [`AgValue::Raw`] with a warning.
pub fn decode_column(column: &str, raw: Option<&str>) -> AgValue {
    let Some(raw) = raw else {
        return AgValue::Null;
    };
    match decode(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(column, value = raw, "Failed to decode agtype column: {}", err);
            AgValue::Raw(raw.to_string())
        }
    }
}

pub fn decode(raw: &str) -> Result<AgValue, DecodeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(AgValue::Null);
    }

    let stripped = strip_annotations(trimmed)?;
    let json: Value = serde_json::from_str(&stripped.text).map_err(|err| DecodeError::Agtype {
        value: raw.to_string(),
        reason: err.to_string(),
    })?;

    if stripped.has_graph_types {
        Ok(classify(json))
    } else {
        Ok(AgValue::Scalar(json))
    }
}

struct Stripped {
    text: String,
    has_graph_types: bool,
}

/// Remove `::type` annotations that appear outside string literals.
fn strip_annotations(input: &str) -> Result<Stripped, DecodeError> {
    let mut text = String::with_capacity(input.len());
    let mut has_graph_types = false;
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = input.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if in_string {
            text.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                text.push(c);
            }
            ':' if input[idx..].starts_with("::") => {
                chars.next();
                let mut annotation = String::new();
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        annotation.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if annotation.is_empty() {
                    return Err(DecodeError::Agtype {
                        value: input.to_string(),
                        reason: "empty type annotation".to_string(),
                    });
                }
                if matches!(annotation.as_str(), "vertex" | "edge" | "path") {
                    has_graph_types = true;
                }
            }
            _ => text.push(c),
        }
    }

    if in_string {
        return Err(DecodeError::Agtype {
            value: input.to_string(),
            reason: "unterminated string".to_string(),
        });
    }

    Ok(Stripped {
        text,
        has_graph_types,
    })
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn classify(value: Value) -> AgValue {
    match value {
        Value::Null => AgValue::Null,
        Value::Array(items) => AgValue::List(items.into_iter().map(classify).collect()),
        Value::Object(mut map) => {
            let is_entity = map.contains_key("id") && map.contains_key("label");
            if !is_entity {
                return AgValue::Scalar(Value::Object(map));
            }

            let id = map.get("id").and_then(id_text).unwrap_or_default();
            let label = map
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let properties = match map.remove("properties") {
                Some(Value::Object(props)) => props,
                _ => PropertyMap::new(),
            };

            match (
                map.get("start_id").and_then(id_text),
                map.get("end_id").and_then(id_text),
            ) {
                (Some(start_id), Some(end_id)) => AgValue::Edge(Edge {
                    id,
                    label,
                    start_id,
                    end_id,
                    properties,
                }),
                _ => AgValue::Vertex(Vertex {
                    id,
                    label,
                    properties,
                }),
            }
        }
        scalar => AgValue::Scalar(scalar),
    }
}
