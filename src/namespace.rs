//! Namespace routing.
//!
//! A namespace is a logical collection name such as `full_docs` or
//! `myprefix_entities`. It is resolved once, when a store is constructed, into
//! a [`NamespaceKind`] that fixes the backing table and the record shape.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

pub const KV_STORE_FULL_DOCS: &str = "full_docs";
pub const KV_STORE_TEXT_CHUNKS: &str = "text_chunks";
pub const KV_STORE_LLM_RESPONSE_CACHE: &str = "llm_response_cache";
pub const VECTOR_STORE_ENTITIES: &str = "entities";
pub const VECTOR_STORE_RELATIONSHIPS: &str = "relationships";
pub const VECTOR_STORE_CHUNKS: &str = "chunks";
pub const GRAPH_STORE_CHUNK_ENTITY_RELATION: &str = "chunk_entity_relation";
pub const DOC_STATUS: &str = "doc_status";

/// Workspace used when nothing else is configured.
pub const DEFAULT_WORKSPACE: &str = "default";

static NON_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]+").expect("valid identifier regex"));

/// Closed set of collections the storage layer knows how to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
    FullDocs,
    TextChunks,
    LlmResponseCache,
    Entities,
    Relationships,
    Chunks,
    ChunkEntityRelation,
    DocStatus,
}

impl NamespaceKind {
    pub const ALL: [NamespaceKind; 8] = [
        NamespaceKind::FullDocs,
        NamespaceKind::TextChunks,
        NamespaceKind::LlmResponseCache,
        NamespaceKind::Entities,
        NamespaceKind::Relationships,
        NamespaceKind::Chunks,
        NamespaceKind::ChunkEntityRelation,
        NamespaceKind::DocStatus,
    ];

    pub fn base_name(self) -> &'static str {
        match self {
            NamespaceKind::FullDocs => KV_STORE_FULL_DOCS,
            NamespaceKind::TextChunks => KV_STORE_TEXT_CHUNKS,
            NamespaceKind::LlmResponseCache => KV_STORE_LLM_RESPONSE_CACHE,
            NamespaceKind::Entities => VECTOR_STORE_ENTITIES,
            NamespaceKind::Relationships => VECTOR_STORE_RELATIONSHIPS,
            NamespaceKind::Chunks => VECTOR_STORE_CHUNKS,
            NamespaceKind::ChunkEntityRelation => GRAPH_STORE_CHUNK_ENTITY_RELATION,
            NamespaceKind::DocStatus => DOC_STATUS,
        }
    }

    /// Relational table backing this collection. The graph lives in AGE.
    pub fn table(self) -> Option<&'static str> {
        match self {
            NamespaceKind::FullDocs => Some("LIGHTRAG_DOC_FULL"),
            NamespaceKind::TextChunks | NamespaceKind::Chunks => Some("LIGHTRAG_DOC_CHUNKS"),
            NamespaceKind::LlmResponseCache => Some("LIGHTRAG_LLM_CACHE"),
            NamespaceKind::Entities => Some("LIGHTRAG_VDB_ENTITY"),
            NamespaceKind::Relationships => Some("LIGHTRAG_VDB_RELATION"),
            NamespaceKind::DocStatus => Some("LIGHTRAG_DOC_STATUS"),
            NamespaceKind::ChunkEntityRelation => None,
        }
    }

    pub fn is_kv(self) -> bool {
        matches!(
            self,
            NamespaceKind::FullDocs | NamespaceKind::TextChunks | NamespaceKind::LlmResponseCache
        )
    }

    pub fn is_vector(self) -> bool {
        matches!(
            self,
            NamespaceKind::Entities | NamespaceKind::Relationships | NamespaceKind::Chunks
        )
    }

    /// Resolve a (possibly prefixed) namespace by its longest matching suffix,
    /// so `text_chunks` never resolves to `chunks`.
    pub fn resolve(namespace: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .filter(|kind| namespace.ends_with(kind.base_name()))
            .max_by_key(|kind| kind.base_name().len())
            .ok_or_else(|| Error::UnsupportedNamespace(namespace.to_string()))
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base_name())
    }
}

/// A namespace string together with its resolved kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    name: String,
    kind: NamespaceKind,
}

impl Namespace {
    pub fn parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let kind = NamespaceKind::resolve(&name)?;
        Ok(Self { name, kind })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NamespaceKind {
        self.kind
    }

    /// Backing table, or an error for the graph namespace.
    pub fn table(&self) -> Result<&'static str> {
        self.kind
            .table()
            .ok_or_else(|| Error::UnsupportedNamespace(self.name.clone()))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Replace path-like separators in a namespace prefix.
pub fn sanitize_namespace_prefix(prefix: &str) -> String {
    prefix.replace(['|', '/', '\\'], "_").trim().to_string()
}

pub fn make_namespace(prefix: &str, base_namespace: &str) -> String {
    format!("{}{}", sanitize_namespace_prefix(prefix), base_namespace)
}

/// Turn an arbitrary name into a SQL/AGE-safe identifier used for
/// workspaces and graph names: `[A-Za-z0-9_]+`, never starting with a digit.
pub fn sanitize_identifier(name: &str) -> String {
    let cleaned = NON_IDENTIFIER.replace_all(name.trim(), "_").into_owned();
    if cleaned.is_empty() {
        return DEFAULT_WORKSPACE.to_string();
    }
    if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        format!("g_{cleaned}")
    } else {
        cleaned
    }
}
