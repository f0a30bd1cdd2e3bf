//! Storage abstractions and backends.
//!
//! Four storage kinds share one shape: a store is built for one namespace,
//! scoped to one workspace, and talks async.
//!
//! - [`KvStorage`] - full documents, text chunks, LLM response cache
//! - [`VectorStorage`] - embedded chunks, entities and relationships
//! - [`DocStatusStorage`] - per-document processing state
//! - [`GraphStorage`] - entity/relationship property graph
//!
//! [`postgres`] implements all four over one PostgreSQL pool (pgvector for
//! similarity, Apache AGE for the graph). [`JsonKvStorage`] is a file-backed
//! KV store for single-process use.

pub mod json_kv;
pub mod postgres;
pub mod retry;
pub mod types;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

pub use json_kv::JsonKvStorage;
pub use retry::RetryPolicy;
pub use types::{
    CacheEntry, DocProcessingStatus, DocStatus, FullDoc, KnowledgeGraph, KnowledgeGraphEdge,
    KnowledgeGraphNode, KvRecord, NodeEmbeddings, PropertyMap, TextChunk, VectorHit, VectorMatch,
    VectorRecord,
};

use crate::error::Result;
use crate::namespace::Namespace;

#[async_trait]
pub trait KvStorage: Send + Sync {
    fn namespace(&self) -> &Namespace;

    async fn get_by_id(&self, id: &str) -> Result<Option<KvRecord>>;

    /// One slot per requested id, in request order.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<KvRecord>>>;

    /// The subset of `keys` not stored yet.
    async fn filter_keys(&self, keys: &HashSet<String>) -> Result<HashSet<String>>;

    async fn upsert(&self, data: HashMap<String, KvRecord>) -> Result<()>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Called once an indexing pass finished; persist buffered state.
    async fn index_done_callback(&self) -> Result<()>;

    /// Remove everything this store persisted.
    async fn drop_storage(&self) -> Result<()>;
}

#[async_trait]
pub trait VectorStorage: Send + Sync {
    fn namespace(&self) -> &Namespace;

    /// Embed every record's content and store it.
    async fn upsert(&self, data: HashMap<String, VectorRecord>) -> Result<()>;

    /// Records at least as similar as the store threshold, best first,
    /// at most `top_k`.
    async fn query(&self, query: &str, top_k: usize) -> Result<Vec<VectorMatch>>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    async fn delete_entity(&self, entity_name: &str) -> Result<()>;

    /// Remove relationship rows where `entity_name` is source or target.
    async fn delete_entity_relation(&self, entity_name: &str) -> Result<()>;

    async fn index_done_callback(&self) -> Result<()>;

    async fn drop_storage(&self) -> Result<()>;
}

#[async_trait]
pub trait DocStatusStorage: Send + Sync {
    fn namespace(&self) -> &Namespace;

    async fn get_by_id(&self, id: &str) -> Result<Option<DocProcessingStatus>>;

    async fn get_by_ids(&self, ids: &[String]) -> Result<HashMap<String, DocProcessingStatus>>;

    async fn filter_keys(&self, keys: &HashSet<String>) -> Result<HashSet<String>>;

    async fn get_status_counts(&self) -> Result<HashMap<DocStatus, i64>>;

    async fn get_docs_by_status(
        &self,
        status: DocStatus,
    ) -> Result<HashMap<String, DocProcessingStatus>>;

    async fn upsert(&self, data: HashMap<String, DocProcessingStatus>) -> Result<()>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    async fn index_done_callback(&self) -> Result<()>;

    async fn drop_storage(&self) -> Result<()>;
}

#[async_trait]
pub trait GraphStorage: Send + Sync {
    async fn has_node(&self, node_id: &str) -> Result<bool>;

    /// True if an edge joins the two nodes in either direction.
    async fn has_edge(&self, source_node_id: &str, target_node_id: &str) -> Result<bool>;

    async fn get_node(&self, node_id: &str) -> Result<Option<PropertyMap>>;

    async fn get_edge(
        &self,
        source_node_id: &str,
        target_node_id: &str,
    ) -> Result<Option<PropertyMap>>;

    /// Number of outgoing edges.
    async fn node_degree(&self, node_id: &str) -> Result<i64>;

    /// Sum of both endpoint degrees.
    async fn edge_degree(&self, src_id: &str, tgt_id: &str) -> Result<i64>;

    /// `(node, neighbour)` pairs for every edge touching the node.
    async fn get_node_edges(&self, source_node_id: &str) -> Result<Vec<(String, String)>>;

    async fn upsert_node(&self, node_id: &str, node_data: PropertyMap) -> Result<()>;

    async fn upsert_edge(
        &self,
        source_node_id: &str,
        target_node_id: &str,
        edge_data: PropertyMap,
    ) -> Result<()>;

    /// Delete a node together with its edges.
    async fn delete_node(&self, node_id: &str) -> Result<()>;

    async fn remove_nodes(&self, node_ids: &[String]) -> Result<()>;

    async fn remove_edges(&self, edges: &[(String, String)]) -> Result<()>;

    async fn get_all_labels(&self) -> Result<Vec<String>>;

    /// Subgraph around `node_label` (`"*"` for the whole graph).
    async fn get_knowledge_graph(&self, node_label: &str, max_depth: usize)
        -> Result<KnowledgeGraph>;

    async fn embed_nodes(&self, algorithm: &str) -> Result<NodeEmbeddings>;

    async fn index_done_callback(&self) -> Result<()>;

    async fn drop_storage(&self) -> Result<()>;
}
