//! Scenarios against a real PostgreSQL with Apache AGE and pgvector.
//!
//! Connection settings come from `POSTGRES_*` environment variables or a
//! `.env` file. Run with `cargo test -- --ignored`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;

use lightrag_pg::config::VectorDbOptions;
use lightrag_pg::namespace::{
    DOC_STATUS, GRAPH_STORE_CHUNK_ENTITY_RELATION, KV_STORE_FULL_DOCS,
    KV_STORE_LLM_RESPONSE_CACHE, VECTOR_STORE_CHUNKS,
};
use lightrag_pg::storage::{
    CacheEntry, DocProcessingStatus, DocStatus, FullDoc, KvRecord, PropertyMap, VectorHit,
    VectorRecord,
};
use lightrag_pg::{
    ClientManager, DocStatusStorage, GlobalConfig, GraphStorage, HashEmbedding, KvStorage,
    PgDocStatusStorage, PgGraphStorage, PgKvStorage, PgVectorStorage, PostgresDb, VectorStorage,
};

fn global(threshold: f64) -> GlobalConfig {
    GlobalConfig {
        vector_db_storage_cls_kwargs: VectorDbOptions {
            cosine_better_than_threshold: Some(threshold),
        },
        ..GlobalConfig::new()
    }
}

async fn connect(manager: &ClientManager, workspace: &str) -> Arc<PostgresDb> {
    manager
        .acquire(Some(workspace), &GlobalConfig::new())
        .await
        .expect("PostgreSQL connection")
}

fn props(pairs: serde_json::Value) -> PropertyMap {
    pairs.as_object().cloned().unwrap_or_default()
}

fn doc(content: &str) -> KvRecord {
    KvRecord::FullDoc(FullDoc {
        content: content.to_string(),
    })
}

// ============================================================================
// KV Storage
// ============================================================================

#[tokio::test]
#[ignore] // Requires PostgreSQL with Apache AGE and pgvector
async fn test_kv_upsert_is_last_write_wins() {
    let manager = ClientManager::new();
    let db = connect(&manager, "it_kv_lww").await;
    let store = PgKvStorage::new(KV_STORE_FULL_DOCS, Arc::clone(&db)).unwrap();

    store
        .upsert(HashMap::from([("doc-1".to_string(), doc("first"))]))
        .await
        .unwrap();
    store
        .upsert(HashMap::from([("doc-1".to_string(), doc("second"))]))
        .await
        .unwrap();

    assert_eq!(store.get_by_id("doc-1").await.unwrap(), Some(doc("second")));

    let ids = vec!["missing".to_string(), "doc-1".to_string()];
    assert_eq!(
        store.get_by_ids(&ids).await.unwrap(),
        vec![None, Some(doc("second"))]
    );

    store.drop_storage().await.unwrap();
    manager.release(db).await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL with Apache AGE and pgvector
async fn test_kv_workspaces_are_isolated() {
    let manager = ClientManager::new();
    let db_a = connect(&manager, "it_kv_a").await;
    let db_b = connect(&manager, "it_kv_b").await;
    assert!(db_a.shares_pool_with(&db_b));

    let a = PgKvStorage::new(KV_STORE_FULL_DOCS, Arc::clone(&db_a)).unwrap();
    let b = PgKvStorage::new(KV_STORE_FULL_DOCS, Arc::clone(&db_b)).unwrap();
    a.upsert(HashMap::from([("shared".to_string(), doc("from a"))]))
        .await
        .unwrap();

    assert_eq!(b.get_by_id("shared").await.unwrap(), None);
    let unseen = b
        .filter_keys(&HashSet::from(["shared".to_string()]))
        .await
        .unwrap();
    assert!(unseen.contains("shared"));
    assert!(a
        .filter_keys(&HashSet::from(["shared".to_string()]))
        .await
        .unwrap()
        .is_empty());

    a.drop_storage().await.unwrap();
    b.drop_storage().await.unwrap();
    manager.release(db_a).await;
    manager.release(db_b).await;
    assert_eq!(manager.ref_count().await, 0);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL with Apache AGE and pgvector
async fn test_cache_keeps_one_row_per_mode() {
    let manager = ClientManager::new();
    let db = connect(&manager, "it_cache").await;
    let store = PgKvStorage::new(KV_STORE_LLM_RESPONSE_CACHE, Arc::clone(&db)).unwrap();

    let entry = |answer: &str| CacheEntry {
        original_prompt: "who mentors Bob?".into(),
        return_value: answer.into(),
    };
    store
        .upsert(HashMap::from([(
            "q1".to_string(),
            KvRecord::Cache(BTreeMap::from([("hybrid".to_string(), entry("Alice"))])),
        )]))
        .await
        .unwrap();
    store
        .upsert(HashMap::from([(
            "q1".to_string(),
            KvRecord::Cache(BTreeMap::from([(
                "local".to_string(),
                entry("Alice, his professor"),
            )])),
        )]))
        .await
        .unwrap();

    let expected = BTreeMap::from([
        ("hybrid".to_string(), entry("Alice")),
        ("local".to_string(), entry("Alice, his professor")),
    ]);
    assert_eq!(
        store.get_by_id("q1").await.unwrap(),
        Some(KvRecord::Cache(expected))
    );
    assert_eq!(
        store.get_by_mode_and_id("local", "q1").await.unwrap(),
        Some(entry("Alice, his professor"))
    );
    assert_eq!(store.get_by_mode_and_id("naive", "q1").await.unwrap(), None);

    store.drop_storage().await.unwrap();
    manager.release(db).await;
}

// ============================================================================
// Vector Storage
// ============================================================================

#[tokio::test]
#[ignore] // Requires PostgreSQL with Apache AGE and pgvector
async fn test_vector_query_orders_and_thresholds() {
    let manager = ClientManager::new();
    let db = connect(&manager, "it_vector").await;
    let embedder = Arc::new(HashEmbedding::new(1024));
    let store =
        PgVectorStorage::new(VECTOR_STORE_CHUNKS, &global(0.2), embedder, Arc::clone(&db)).unwrap();

    let chunk = |content: &str, order: i32| VectorRecord::Chunk {
        tokens: content.split_whitespace().count() as i32,
        chunk_order_index: order,
        full_doc_id: "doc-1".into(),
        content: content.into(),
    };
    store
        .upsert(HashMap::from([
            ("c1".to_string(), chunk("alice teaches bob mathematics", 0)),
            ("c2".to_string(), chunk("alice teaches carol", 1)),
            ("c3".to_string(), chunk("volcanoes erupt lava", 2)),
        ]))
        .await
        .unwrap();

    let matches = store.query("alice teaches bob", 5).await.unwrap();
    let ids: Vec<_> = matches
        .iter()
        .map(|m| match &m.hit {
            VectorHit::Chunk { id } => id.as_str(),
            other => panic!("unexpected hit {other:?}"),
        })
        .collect();
    assert_eq!(ids.first(), Some(&"c1"));
    assert!(!ids.contains(&"c3"));
    assert!(matches.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    assert!(matches.iter().all(|m| m.similarity > 0.2));

    assert_eq!(store.query("alice teaches bob", 1).await.unwrap().len(), 1);

    store.delete(&["c1".to_string()]).await.unwrap();
    let after = store.query("alice teaches bob", 5).await.unwrap();
    assert!(after
        .iter()
        .all(|m| m.hit != VectorHit::Chunk { id: "c1".into() }));

    store.drop_storage().await.unwrap();
    manager.release(db).await;
}

// ============================================================================
// Doc Status Storage
// ============================================================================

#[tokio::test]
#[ignore] // Requires PostgreSQL with Apache AGE and pgvector
async fn test_doc_status_counts_and_unknown_chunk_count() {
    let manager = ClientManager::new();
    let db = connect(&manager, "it_doc_status").await;
    let store = PgDocStatusStorage::new(DOC_STATUS, Arc::clone(&db)).unwrap();

    let status = |status: DocStatus, chunks: Option<i32>| DocProcessingStatus {
        content: "body".into(),
        content_summary: "summary".into(),
        content_length: 4,
        status,
        chunks_count: chunks,
        created_at: None,
        updated_at: None,
    };
    store
        .upsert(HashMap::from([
            ("d1".to_string(), status(DocStatus::Pending, None)),
            ("d2".to_string(), status(DocStatus::Pending, None)),
            ("d3".to_string(), status(DocStatus::Processed, Some(7))),
        ]))
        .await
        .unwrap();

    let counts = store.get_status_counts().await.unwrap();
    assert_eq!(counts.get(&DocStatus::Pending), Some(&2));
    assert_eq!(counts.get(&DocStatus::Processed), Some(&1));
    assert_eq!(counts.get(&DocStatus::Failed), None);

    let pending = store.get_docs_by_status(DocStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending["d1"].chunks_count, Some(-1));

    let processed = store.get_by_id("d3").await.unwrap().unwrap();
    assert_eq!(processed.chunks_count, Some(7));
    assert!(processed.created_at.is_some());

    store.drop_storage().await.unwrap();
    manager.release(db).await;
}

// ============================================================================
// Graph Storage
// ============================================================================

async fn graph_store(db: Arc<PostgresDb>, graph_name: &str) -> PgGraphStorage {
    let config = GlobalConfig {
        graph_name: Some(graph_name.to_string()),
        ..GlobalConfig::new()
    };
    PgGraphStorage::new(GRAPH_STORE_CHUNK_ENTITY_RELATION, &config, db).unwrap()
}

#[tokio::test]
#[ignore] // Requires PostgreSQL with Apache AGE and pgvector
async fn test_graph_nodes_and_edges() {
    let manager = ClientManager::new();
    let db = connect(&manager, "it_graph").await;
    let graph = graph_store(Arc::clone(&db), "it_graph_basic").await;

    graph
        .upsert_node("Alice", props(json!({"role": "teacher"})))
        .await
        .unwrap();
    graph
        .upsert_node("Bob", props(json!({"role": "student"})))
        .await
        .unwrap();
    graph
        .upsert_edge("Alice", "Bob", props(json!({"since": "2024"})))
        .await
        .unwrap();

    assert!(graph.has_node("Alice").await.unwrap());
    assert!(!graph.has_node("Carol").await.unwrap());
    assert!(graph.has_edge("Alice", "Bob").await.unwrap());
    assert!(graph.has_edge("Bob", "Alice").await.unwrap());

    let alice = graph.get_node("Alice").await.unwrap().unwrap();
    assert_eq!(alice["node_id"], json!("Alice"));
    assert_eq!(alice["role"], json!("teacher"));
    let bob = graph.get_node("Bob").await.unwrap().unwrap();
    assert_eq!(bob["role"], json!("student"));

    let edge = graph.get_edge("Alice", "Bob").await.unwrap().unwrap();
    assert_eq!(edge["since"], json!("2024"));
    assert_eq!(graph.get_edge("Alice", "Nobody").await.unwrap(), None);

    assert_eq!(graph.node_degree("Alice").await.unwrap(), 1);
    assert_eq!(graph.edge_degree("Alice", "Bob").await.unwrap(), 1);
    assert_eq!(
        graph.get_node_edges("Alice").await.unwrap(),
        vec![("Alice".to_string(), "Bob".to_string())]
    );
    assert_eq!(
        graph.get_all_labels().await.unwrap(),
        vec!["Alice".to_string(), "Bob".to_string()]
    );

    graph
        .remove_edges(&[("Alice".to_string(), "Bob".to_string())])
        .await
        .unwrap();
    assert!(!graph.has_edge("Alice", "Bob").await.unwrap());
    assert!(!graph.has_edge("Bob", "Alice").await.unwrap());
    assert!(graph.has_node("Alice").await.unwrap());
    assert!(graph.has_node("Bob").await.unwrap());
    assert_eq!(graph.node_degree("Alice").await.unwrap(), 0);

    graph.drop_storage().await.unwrap();
    manager.release(db).await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL with Apache AGE and pgvector
async fn test_graph_upsert_merges_instead_of_duplicating() {
    let manager = ClientManager::new();
    let db = connect(&manager, "it_graph").await;
    let graph = graph_store(Arc::clone(&db), "it_graph_merge").await;
    graph.upsert_node("北京", PropertyMap::new()).await.unwrap();

    for description in ["v1", "v2"] {
        graph
            .upsert_node("O'Brien \"the\" $$ editor", props(json!({"description": description})))
            .await
            .unwrap();
        graph
            .upsert_edge(
                "O'Brien \"the\" $$ editor",
                "北京",
                props(json!({"description": description})),
            )
            .await
            .unwrap();
    }

    let node = graph
        .get_node("O'Brien \"the\" $$ editor")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node["description"], json!("v2"));
    assert_eq!(graph.get_all_labels().await.unwrap().len(), 2);
    assert_eq!(
        graph
            .node_degree("O'Brien \"the\" $$ editor")
            .await
            .unwrap(),
        1
    );

    graph.drop_storage().await.unwrap();
    manager.release(db).await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL with Apache AGE and pgvector
async fn test_graph_delete_node_detaches_edges() {
    let manager = ClientManager::new();
    let db = connect(&manager, "it_graph").await;
    let graph = graph_store(Arc::clone(&db), "it_graph_delete").await;

    for name in ["A", "B", "C"] {
        graph.upsert_node(name, PropertyMap::new()).await.unwrap();
    }
    graph.upsert_edge("A", "B", PropertyMap::new()).await.unwrap();
    graph.upsert_edge("B", "C", PropertyMap::new()).await.unwrap();

    graph.delete_node("B").await.unwrap();
    assert!(!graph.has_node("B").await.unwrap());
    assert!(!graph.has_edge("A", "B").await.unwrap());
    assert_eq!(graph.node_degree("A").await.unwrap(), 0);

    graph
        .remove_edges(&[("A".to_string(), "C".to_string())])
        .await
        .unwrap();
    graph
        .remove_nodes(&["A".to_string(), "C".to_string()])
        .await
        .unwrap();
    assert!(graph.get_all_labels().await.unwrap().is_empty());

    graph.drop_storage().await.unwrap();
    manager.release(db).await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL with Apache AGE and pgvector
async fn test_graph_subgraph_respects_depth() {
    let manager = ClientManager::new();
    let db = connect(&manager, "it_graph").await;
    let graph = graph_store(Arc::clone(&db), "it_graph_subgraph").await;

    for name in ["A", "B", "C", "D", "Lonely"] {
        graph.upsert_node(name, PropertyMap::new()).await.unwrap();
    }
    graph.upsert_edge("A", "B", PropertyMap::new()).await.unwrap();
    graph.upsert_edge("B", "C", PropertyMap::new()).await.unwrap();
    graph.upsert_edge("C", "D", PropertyMap::new()).await.unwrap();

    let near = graph.get_knowledge_graph("A", 1).await.unwrap();
    let ids: HashSet<_> = near.nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, HashSet::from(["A", "B"]));
    assert!(!near.is_truncated);

    let lonely = graph.get_knowledge_graph("Lonely", 2).await.unwrap();
    assert_eq!(lonely.nodes.len(), 1);
    assert!(lonely.edges.is_empty());

    let everything = graph.get_knowledge_graph("*", 3).await.unwrap();
    assert_eq!(everything.nodes.len(), 5);
    assert!(everything
        .edges
        .iter()
        .any(|e| e.source == "C" && e.target == "D"));

    graph.drop_storage().await.unwrap();
    manager.release(db).await;
}
