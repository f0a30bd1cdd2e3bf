//! Property graph over Apache AGE.
//!
//! Nodes are `Entity` vertices keyed by the `node_id` property, which holds
//! the hex-encoded node id (see [`cypher::encode_graph_label`]). Edges are
//! always `DIRECTED`. Every query body is built by a function in this module
//! from encoded labels and [`cypher`] literals only.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info};

use super::agtype::{Edge, GraphRecord, Vertex};
use super::cypher::{
    self, decode_graph_label_lossy, encode_graph_label, format_properties, label_literal,
    MAX_GRAPH_NODES,
};
use super::db::PostgresDb;
use crate::config::GlobalConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::namespace::{Namespace, NamespaceKind};
use crate::storage::retry::{retry, RetryPolicy};
use crate::storage::{
    GraphStorage, KnowledgeGraph, KnowledgeGraphEdge, KnowledgeGraphNode, NodeEmbeddings,
    PropertyMap,
};

const STORE: &str = "graph";

/// Property holding the encoded node id.
pub const NODE_ID_PROPERTY: &str = "node_id";

/// Node-embedding algorithms that can be requested by name.
pub const NODE_EMBED_ALGORITHMS: [&str; 1] = ["node2vec"];

/// Start label that selects the whole graph.
pub const WILDCARD_LABEL: &str = "*";

const WILDCARD_COLUMNS: &[&str] = &["n", "r", "m"];
const PATH_COLUMNS: &[&str] = &["n", "nodes", "relationships"];

/// Node ids arrive from extraction with stray surrounding quotes; `"Alice"`
/// and `Alice` name the same node.
fn node_key(node_id: &str) -> &str {
    node_id.trim_matches('"')
}

fn encoded_node_literal(node_id: &str) -> String {
    label_literal(&encode_graph_label(node_key(node_id)))
}

fn node_pattern(alias: &str, node_id: &str) -> String {
    format!(
        "({alias}:Entity {{{NODE_ID_PROPERTY}: {}}})",
        encoded_node_literal(node_id)
    )
}

fn has_node_query(node_id: &str) -> String {
    format!(
        "MATCH {}\nRETURN count(n) > 0 AS node_exists",
        node_pattern("n", node_id)
    )
}

fn has_edge_query(source: &str, target: &str) -> String {
    format!(
        "MATCH {}-[r]-{}\nRETURN count(r) > 0 AS edge_exists",
        node_pattern("a", source),
        node_pattern("b", target)
    )
}

fn get_node_query(node_id: &str) -> String {
    format!("MATCH {}\nRETURN n", node_pattern("n", node_id))
}

fn node_degree_query(node_id: &str) -> String {
    format!(
        "MATCH {}-[]->(x)\nRETURN count(x) AS total_edge_count",
        node_pattern("n", node_id)
    )
}

fn get_edge_query(source: &str, target: &str) -> String {
    format!(
        "MATCH {}-[r]->{}\nRETURN properties(r) AS edge_properties\nLIMIT 1",
        node_pattern("a", source),
        node_pattern("b", target)
    )
}

fn node_edges_query(node_id: &str) -> String {
    format!(
        "MATCH {}\nOPTIONAL MATCH (n)-[]-(connected)\nRETURN n, connected",
        node_pattern("n", node_id)
    )
}

/// `node_id` is the match key and cannot be overwritten through properties.
fn upsert_node_query(node_id: &str, properties: &PropertyMap) -> String {
    let mut properties = properties.clone();
    if properties.remove(NODE_ID_PROPERTY).is_some() {
        debug!(node_id, "Ignoring caller-supplied node_id property");
    }
    format!(
        "MERGE {}\nSET n += {}\nRETURN n",
        node_pattern("n", node_id),
        format_properties(&properties, Some(node_key(node_id)))
    )
}

fn upsert_edge_query(source: &str, target: &str, properties: &PropertyMap) -> String {
    format!(
        "MATCH {}\nWITH source\nMATCH {}\nMERGE (source)-[r:DIRECTED]->(target)\nSET r += {}\nRETURN r",
        node_pattern("source", source),
        node_pattern("target", target),
        format_properties(properties, None)
    )
}

fn delete_node_query(node_id: &str) -> String {
    format!("MATCH {}\nDETACH DELETE n", node_pattern("n", node_id))
}

fn remove_nodes_query(node_ids: &[String]) -> String {
    let labels: Vec<String> = node_ids
        .iter()
        .map(|id| encoded_node_literal(id))
        .collect();
    format!(
        "MATCH (n:Entity)\nWHERE n.{NODE_ID_PROPERTY} IN [{}]\nDETACH DELETE n",
        labels.join(", ")
    )
}

fn remove_edges_query(edges: &[(String, String)]) -> String {
    let pairs: Vec<String> = edges
        .iter()
        .map(|(src, tgt)| {
            format!(
                "[{}, {}]",
                encoded_node_literal(src),
                encoded_node_literal(tgt)
            )
        })
        .collect();
    format!(
        "MATCH (a:Entity)-[r]->(b:Entity)\nWHERE [a.{NODE_ID_PROPERTY}, b.{NODE_ID_PROPERTY}] IN [{}]\nDELETE r",
        pairs.join(", ")
    )
}

fn all_labels_query() -> String {
    format!("MATCH (n:Entity)\nRETURN DISTINCT n.{NODE_ID_PROPERTY} AS label")
}

/// Body and result columns of a subgraph query.
fn knowledge_graph_query(node_label: &str, max_depth: usize) -> (String, &'static [&'static str]) {
    if node_label == WILDCARD_LABEL {
        let body = format!(
            "MATCH (n:Entity)\nOPTIONAL MATCH (n)-[r]->(m:Entity)\nRETURN n, r, m\nLIMIT {MAX_GRAPH_NODES}"
        );
        (body, WILDCARD_COLUMNS)
    } else {
        let body = format!(
            "MATCH {}\nOPTIONAL MATCH p = (n)-[*..{}]-(m)\nRETURN n, nodes(p) AS nodes, relationships(p) AS relationships\nLIMIT {MAX_GRAPH_NODES}",
            node_pattern("n", node_label),
            max_depth.max(1)
        );
        (body, PATH_COLUMNS)
    }
}

/// Decoded node id of a vertex, or its internal id when `node_id` is absent.
fn vertex_node_id(vertex: &Vertex) -> String {
    match vertex.properties.get(NODE_ID_PROPERTY) {
        Some(Value::String(encoded)) => decode_graph_label_lossy(encoded),
        _ => vertex.id.clone(),
    }
}

/// Vertex properties with `node_id` replaced by the decoded id.
fn node_properties(vertex: &Vertex) -> PropertyMap {
    let mut properties = vertex.properties.clone();
    if let Some(Value::String(encoded)) = properties.get(NODE_ID_PROPERTY) {
        let decoded = decode_graph_label_lossy(encoded);
        properties.insert(NODE_ID_PROPERTY.to_string(), Value::String(decoded));
    }
    properties
}

/// Build a [`KnowledgeGraph`] from subgraph rows.
///
/// Nodes are deduplicated by node id and capped at [`MAX_GRAPH_NODES`].
/// Edge endpoints are mapped from AGE vertex ids to node ids using the
/// vertices in the same result; edges touching a node that did not make the
/// cap are dropped. Edges reached through several paths are kept once per
/// path.
fn assemble_knowledge_graph(records: &[GraphRecord], columns: &[&str]) -> KnowledgeGraph {
    let mut vertices: Vec<&Vertex> = Vec::new();
    let mut edges: Vec<&Edge> = Vec::new();
    for record in records {
        for column in columns {
            record.get(column).collect_graph(&mut vertices, &mut edges);
        }
    }

    let mut graph = KnowledgeGraph {
        is_truncated: records.len() >= MAX_GRAPH_NODES,
        ..Default::default()
    };
    let mut node_ids: HashMap<&str, String> = HashMap::new();
    let mut kept: HashSet<String> = HashSet::new();

    for vertex in vertices {
        let node_id = vertex_node_id(vertex);
        node_ids.insert(vertex.id.as_str(), node_id.clone());
        if kept.contains(&node_id) {
            continue;
        }
        if kept.len() >= MAX_GRAPH_NODES {
            graph.is_truncated = true;
            continue;
        }
        let mut properties = vertex.properties.clone();
        properties.remove(NODE_ID_PROPERTY);
        kept.insert(node_id.clone());
        graph.nodes.push(KnowledgeGraphNode {
            id: node_id,
            labels: vec![vertex.label.clone()],
            properties,
        });
    }

    for edge in edges {
        let (Some(source), Some(target)) = (
            node_ids.get(edge.start_id.as_str()),
            node_ids.get(edge.end_id.as_str()),
        ) else {
            continue;
        };
        if !kept.contains(source) || !kept.contains(target) {
            continue;
        }
        graph.edges.push(KnowledgeGraphEdge {
            id: edge.id.clone(),
            edge_type: edge.label.clone(),
            source: source.clone(),
            target: target.clone(),
            properties: edge.properties.clone(),
        });
    }

    graph
}

/// Graph store for the `chunk_entity_relation` namespace.
pub struct PgGraphStorage {
    db: Arc<PostgresDb>,
    namespace: Namespace,
    graph_name: String,
    retry_policy: RetryPolicy,
    ready: AtomicBool,
}

impl PgGraphStorage {
    pub fn new(namespace: &str, global_config: &GlobalConfig, db: Arc<PostgresDb>) -> Result<Self> {
        let namespace = Namespace::parse(namespace)?;
        if namespace.kind() != NamespaceKind::ChunkEntityRelation {
            return Err(Error::UnsupportedNamespace(namespace.name().to_string()));
        }
        let graph_name = global_config.graph_name_for(namespace.name());
        Ok(Self {
            db,
            namespace,
            graph_name,
            retry_policy: RetryPolicy::graph_mutation(),
            ready: AtomicBool::new(false),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn graph_name(&self) -> &str {
        &self.graph_name
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Create the AGE graph on first use.
    async fn ensure_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.db.ensure_graph(&self.graph_name).await?;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn query(&self, body: &str, columns: &[&str]) -> Result<Vec<GraphRecord>> {
        self.ensure_ready().await?;
        let sql = cypher::cypher_sql(&self.graph_name, body, columns);
        self.db.graph_query(&sql).await
    }

    async fn execute(&self, body: &str, columns: &[&str], upsert: bool) -> Result<()> {
        self.ensure_ready().await?;
        let sql = cypher::cypher_sql(&self.graph_name, body, columns);
        self.db.graph_execute(&sql, upsert).await
    }

    /// First row of a single-column query.
    async fn scalar(&self, body: &str, column: &str) -> Result<Option<GraphRecord>> {
        Ok(self.query(body, &[column]).await?.into_iter().next())
    }
}

#[async_trait]
impl GraphStorage for PgGraphStorage {
    async fn has_node(&self, node_id: &str) -> Result<bool> {
        metrics::observe(STORE, "has_node", async {
            let record = self.scalar(&has_node_query(node_id), "node_exists").await?;
            Ok(record
                .and_then(|r| r.get("node_exists").as_bool())
                .unwrap_or(false))
        })
        .await
    }

    async fn has_edge(&self, source_node_id: &str, target_node_id: &str) -> Result<bool> {
        metrics::observe(STORE, "has_edge", async {
            let body = has_edge_query(source_node_id, target_node_id);
            let record = self.scalar(&body, "edge_exists").await?;
            Ok(record
                .and_then(|r| r.get("edge_exists").as_bool())
                .unwrap_or(false))
        })
        .await
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<PropertyMap>> {
        metrics::observe(STORE, "get_node", async {
            let records = self.query(&get_node_query(node_id), &["n"]).await?;
            Ok(records
                .first()
                .and_then(|r| r.get("n").as_vertex())
                .map(node_properties))
        })
        .await
    }

    async fn get_edge(
        &self,
        source_node_id: &str,
        target_node_id: &str,
    ) -> Result<Option<PropertyMap>> {
        metrics::observe(STORE, "get_edge", async {
            let body = get_edge_query(source_node_id, target_node_id);
            let record = self.scalar(&body, "edge_properties").await?;
            Ok(record
                .as_ref()
                .and_then(|r| r.get("edge_properties").as_object())
                .filter(|properties| !properties.is_empty())
                .cloned())
        })
        .await
    }

    async fn node_degree(&self, node_id: &str) -> Result<i64> {
        metrics::observe(STORE, "node_degree", async {
            let record = self
                .scalar(&node_degree_query(node_id), "total_edge_count")
                .await?;
            Ok(record
                .and_then(|r| r.get("total_edge_count").as_i64())
                .unwrap_or(0))
        })
        .await
    }

    async fn edge_degree(&self, src_id: &str, tgt_id: &str) -> Result<i64> {
        let src_degree = self.node_degree(src_id).await?;
        let tgt_degree = self.node_degree(tgt_id).await?;
        Ok(src_degree + tgt_degree)
    }

    async fn get_node_edges(&self, source_node_id: &str) -> Result<Vec<(String, String)>> {
        metrics::observe(STORE, "get_node_edges", async {
            let records = self
                .query(&node_edges_query(source_node_id), &["n", "connected"])
                .await?;
            Ok(records
                .iter()
                .filter_map(|record| {
                    let source = record.get("n").as_vertex()?;
                    let connected = record.get("connected").as_vertex()?;
                    Some((vertex_node_id(source), vertex_node_id(connected)))
                })
                .collect())
        })
        .await
    }

    async fn upsert_node(&self, node_id: &str, node_data: PropertyMap) -> Result<()> {
        let body = upsert_node_query(node_id, &node_data);
        let upsert = retry(
            &self.retry_policy,
            "upsert_node",
            Error::is_graph_query,
            || self.execute(&body, &["n"], true),
        );
        metrics::observe(STORE, "upsert_node", upsert)
            .await
            .inspect_err(|err| error!(node_id, "Error during node upsert: {}", err))
    }

    async fn upsert_edge(
        &self,
        source_node_id: &str,
        target_node_id: &str,
        edge_data: PropertyMap,
    ) -> Result<()> {
        let body = upsert_edge_query(source_node_id, target_node_id, &edge_data);
        let upsert = retry(
            &self.retry_policy,
            "upsert_edge",
            Error::is_graph_query,
            || self.execute(&body, &["r"], true),
        );
        metrics::observe(STORE, "upsert_edge", upsert)
            .await
            .inspect_err(|err| {
                error!(
                    source = source_node_id,
                    target = target_node_id,
                    "Error during edge upsert: {}",
                    err
                )
            })
    }

    async fn delete_node(&self, node_id: &str) -> Result<()> {
        metrics::observe(STORE, "delete_node", async {
            self.execute(&delete_node_query(node_id), &["n"], false)
                .await
                .inspect_err(|err| error!(node_id, "Error during node deletion: {}", err))
        })
        .await
    }

    async fn remove_nodes(&self, node_ids: &[String]) -> Result<()> {
        metrics::observe(STORE, "remove_nodes", async {
            if node_ids.is_empty() {
                return Ok(());
            }
            self.execute(&remove_nodes_query(node_ids), &["n"], false)
                .await
                .inspect_err(|err| error!("Error during node removal: {}", err))
        })
        .await
    }

    async fn remove_edges(&self, edges: &[(String, String)]) -> Result<()> {
        metrics::observe(STORE, "remove_edges", async {
            if edges.is_empty() {
                return Ok(());
            }
            self.execute(&remove_edges_query(edges), &["r"], false)
                .await
                .inspect_err(|err| error!("Error during edge removal: {}", err))
        })
        .await
    }

    async fn get_all_labels(&self) -> Result<Vec<String>> {
        metrics::observe(STORE, "get_all_labels", async {
            let records = self.query(&all_labels_query(), &["label"]).await?;
            let mut labels: Vec<String> = records
                .iter()
                .filter_map(|record| record.get("label").as_str().map(decode_graph_label_lossy))
                .collect();
            labels.sort();
            Ok(labels)
        })
        .await
    }

    async fn get_knowledge_graph(
        &self,
        node_label: &str,
        max_depth: usize,
    ) -> Result<KnowledgeGraph> {
        metrics::observe(STORE, "get_knowledge_graph", async {
            let (body, columns) = knowledge_graph_query(node_label, max_depth);
            let records = self.query(&body, columns).await?;
            let graph = assemble_knowledge_graph(&records, columns);
            debug!(
                node_label,
                nodes = graph.nodes.len(),
                edges = graph.edges.len(),
                truncated = graph.is_truncated,
                "Retrieved knowledge graph"
            );
            Ok(graph)
        })
        .await
    }

    async fn embed_nodes(&self, algorithm: &str) -> Result<NodeEmbeddings> {
        match algorithm {
            "node2vec" => Err(Error::NotImplemented(
                "node2vec node embedding is registered but not implemented".to_string(),
            )),
            other => Err(Error::InvalidArgument(format!(
                "Unsupported embedding algorithm: {other} (available: {})",
                NODE_EMBED_ALGORITHMS.join(", ")
            ))),
        }
    }

    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }

    async fn drop_storage(&self) -> Result<()> {
        self.ensure_ready().await?;
        self.db.drop_graph(&self.graph_name).await?;
        self.ready.store(false, Ordering::Release);
        info!(graph = %self.graph_name, "Dropped graph storage");
        Ok(())
    }
}
