//! Records exchanged with the storage backends.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::namespace::NamespaceKind;

/// Open-ended property bag of a graph node or edge.
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullDoc {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub tokens: i32,
    pub chunk_order_index: i32,
    pub full_doc_id: String,
    pub content: String,
}

/// One cached LLM answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub original_prompt: String,
    #[serde(rename = "return")]
    pub return_value: String,
}

/// A KV value. The variant must match the namespace of the store it is
/// written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvRecord {
    FullDoc(FullDoc),
    TextChunk(TextChunk),
    /// Answers cached under one key, by retrieval mode (`local`, `hybrid`, ...).
    Cache(BTreeMap<String, CacheEntry>),
}

impl KvRecord {
    pub fn kind(&self) -> NamespaceKind {
        match self {
            KvRecord::FullDoc(_) => NamespaceKind::FullDocs,
            KvRecord::TextChunk(_) => NamespaceKind::TextChunks,
            KvRecord::Cache(_) => NamespaceKind::LlmResponseCache,
        }
    }
}

/// A vector-store value. Its `content` is what gets embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorRecord {
    Chunk {
        tokens: i32,
        chunk_order_index: i32,
        full_doc_id: String,
        content: String,
    },
    Entity {
        entity_name: String,
        content: String,
    },
    Relationship {
        src_id: String,
        tgt_id: String,
        content: String,
    },
}

impl VectorRecord {
    pub fn content(&self) -> &str {
        match self {
            VectorRecord::Chunk { content, .. }
            | VectorRecord::Entity { content, .. }
            | VectorRecord::Relationship { content, .. } => content,
        }
    }

    pub fn kind(&self) -> NamespaceKind {
        match self {
            VectorRecord::Chunk { .. } => NamespaceKind::Chunks,
            VectorRecord::Entity { .. } => NamespaceKind::Entities,
            VectorRecord::Relationship { .. } => NamespaceKind::Relationships,
        }
    }
}

/// What a similarity search identifies, per namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VectorHit {
    Chunk { id: String },
    Entity { entity_name: String },
    Relationship { src_id: String, tgt_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    #[serde(flatten)]
    pub hit: VectorHit,
    /// `1 - cosine_distance`
    pub similarity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl DocStatus {
    pub const ALL: [DocStatus; 4] = [
        DocStatus::Pending,
        DocStatus::Processing,
        DocStatus::Processed,
        DocStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocStatus::Pending => "pending",
            DocStatus::Processing => "processing",
            DocStatus::Processed => "processed",
            DocStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DocStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown document status {s:?}")))
    }
}

/// Processing state of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocProcessingStatus {
    pub content: String,
    pub content_summary: String,
    pub content_length: i32,
    pub status: DocStatus,
    /// `None` on write is stored as `-1` ("not computed yet").
    #[serde(default)]
    pub chunks_count: Option<i32>,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraphNode {
    pub id: String,
    pub labels: Vec<String>,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraphEdge {
    pub id: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub source: String,
    pub target: String,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    pub nodes: Vec<KnowledgeGraphNode>,
    pub edges: Vec<KnowledgeGraphEdge>,
    /// Set when the node ceiling cut the result short.
    #[serde(default)]
    pub is_truncated: bool,
}

/// Output of a node-embedding algorithm.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeEmbeddings {
    pub embeddings: Vec<Vec<f32>>,
    pub node_ids: Vec<String>,
}
