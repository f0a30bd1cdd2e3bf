//! Integration tests for lightrag_pg library
//!
//! These tests verify the public API and module interactions. Tests that
//! need a live database live in `live/` and are ignored by default.

mod live;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use lightrag_pg::{
    config::{PostgresOverrides, DEFAULT_HOST, DEFAULT_PORT},
    embedding::cosine_similarity,
    error::{DecodeError, Error},
    make_namespace,
    namespace::{sanitize_identifier, NamespaceKind},
    storage::postgres::agtype::{decode, AgValue},
    storage::postgres::cypher::{decode_graph_label, encode_graph_label},
    storage::{CacheEntry, FullDoc, KvRecord},
    DuplicateKeyPolicy, EmbeddingFunc, GlobalConfig, HashEmbedding, JsonKvStorage, KvStorage,
    PostgresConfig, RetryPolicy,
};

fn no_env(_: &str) -> Option<String> {
    None
}

fn full_doc(content: &str) -> KvRecord {
    KvRecord::FullDoc(FullDoc {
        content: content.to_string(),
    })
}

fn json_config(dir: &std::path::Path) -> GlobalConfig {
    GlobalConfig {
        working_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

// ============================================================================
// Namespace Tests
// ============================================================================

#[test]
fn test_prefixed_namespaces_resolve_to_their_kind() {
    let cases = [
        ("full_docs", NamespaceKind::FullDocs),
        ("text_chunks", NamespaceKind::TextChunks),
        ("llm_response_cache", NamespaceKind::LlmResponseCache),
        ("entities", NamespaceKind::Entities),
        ("relationships", NamespaceKind::Relationships),
        ("chunks", NamespaceKind::Chunks),
        ("chunk_entity_relation", NamespaceKind::ChunkEntityRelation),
        ("doc_status", NamespaceKind::DocStatus),
    ];
    for (base, kind) in cases {
        let namespace = make_namespace("tenant|a/", base);
        assert_eq!(namespace, format!("tenant_a_{base}"));
        assert_eq!(NamespaceKind::resolve(&namespace).unwrap(), kind);
    }
}

#[test]
fn test_workspace_names_are_sql_safe() {
    assert_eq!(sanitize_identifier("acme corp"), "acme_corp");
    assert_eq!(sanitize_identifier("1st"), "g_1st");
}

// ============================================================================
// Config Tests
// ============================================================================

#[test]
fn test_postgres_config_defaults_with_credentials() {
    let global = PostgresOverrides {
        user: Some("rag".into()),
        password: Some("secret".into()),
        ..Default::default()
    };
    let config =
        PostgresConfig::resolve_with(None, &global, &PostgresOverrides::default(), no_env).unwrap();

    assert_eq!(config.host, DEFAULT_HOST);
    assert_eq!(config.port, DEFAULT_PORT);
    assert_eq!(config.workspace, "default");
    assert_eq!(config.max_connections, 12);
    assert_eq!(config.min_connections, 1);
    assert_eq!(config.duplicate_key_policy, DuplicateKeyPolicy::Log);
    assert!(!format!("{config:?}").contains("secret"));
}

#[test]
fn test_postgres_config_requires_credentials() {
    let err = PostgresConfig::resolve_with(
        Some("ws"),
        &PostgresOverrides::default(),
        &PostgresOverrides::default(),
        no_env,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_call_time_workspace_beats_every_other_source() {
    let global = PostgresOverrides {
        user: Some("rag".into()),
        password: Some("secret".into()),
        workspace: Some("from_global".into()),
        ..Default::default()
    };
    let file = PostgresOverrides {
        workspace: Some("from_file".into()),
        ..Default::default()
    };
    let env = |key: &str| (key == "POSTGRES_WORKSPACE").then(|| "from_env".to_string());

    let config = PostgresConfig::resolve_with(Some("call-time"), &global, &file, env).unwrap();
    assert_eq!(config.workspace, "call_time");

    let config = PostgresConfig::resolve_with(None, &global, &file, env).unwrap();
    assert_eq!(config.workspace, "from_global");
}

#[test]
fn test_global_config_from_yaml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    std::fs::write(
        &path,
        "lightrag:\n  working_dir: ./rag\n  embedding_batch_num: 8\n  vector_db_storage_cls_kwargs:\n    cosine_better_than_threshold: 0.3\n",
    )
    .unwrap();

    let config = GlobalConfig::load_from_file(&path).unwrap();
    assert_eq!(config.embedding_batch_num, 8);
    assert_eq!(config.cosine_better_than_threshold().unwrap(), 0.3);
}

#[test]
fn test_missing_threshold_is_config_error() {
    let err = GlobalConfig::default().cosine_better_than_threshold().unwrap_err();
    assert!(err.to_string().contains("cosine_better_than_threshold"));
}

// ============================================================================
// Graph Codec Tests
// ============================================================================

#[test]
fn test_graph_label_round_trip() {
    let samples = [
        "Alice",
        "",
        "O'Brien",
        "he said \"hi\" twice",
        "C:\\path\\to",
        "MATCH (n) DETACH DELETE n",
        "$$; DROP TABLE LIGHTRAG_DOC_FULL; --",
        "Ñandú",
        "北京大学",
        "line\nbreak\ttab",
    ];
    for sample in samples {
        let encoded = encode_graph_label(sample);
        assert!(encoded
            .chars()
            .all(|c| c == 'x' || c.is_ascii_hexdigit()));
        assert_eq!(decode_graph_label(&encoded).unwrap(), sample);
    }
}

#[test]
fn test_graph_label_decode_error_is_typed() {
    assert!(matches!(
        decode_graph_label("xabc"),
        Err(DecodeError::Hex(_))
    ));
}

#[test]
fn test_agtype_path_decodes_to_vertices_and_edges() {
    let raw = r#"[{"id": 1, "label": "Entity", "properties": {"node_id": "x41"}}::vertex, {"id": 9, "label": "DIRECTED", "end_id": 2, "start_id": 1, "properties": {}}::edge, {"id": 2, "label": "Entity", "properties": {"node_id": "x42"}}::vertex]::path"#;
    let value = decode(raw).unwrap();

    let mut vertices = Vec::new();
    let mut edges = Vec::new();
    value.collect_graph(&mut vertices, &mut edges);
    assert_eq!(vertices.len(), 2);
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].start_id, vertices[0].id);
}

#[test]
fn test_agtype_scalars() {
    assert_eq!(decode("true").unwrap().as_bool(), Some(true));
    assert_eq!(decode("3").unwrap().as_i64(), Some(3));
    assert!(matches!(decode("").unwrap(), AgValue::Null));
    assert!(decode(r#"{"a": "unterminated}"#).is_err());
}

// ============================================================================
// Embedding Tests
// ============================================================================

#[tokio::test]
async fn test_hash_embedding_batch_matches_single() {
    let embedder = HashEmbedding::new(64);
    let texts = vec!["graph storage".to_string(), "vector search".to_string()];
    let batch = embedder.embed(&texts).await.unwrap();

    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].len(), embedder.dimension());
    assert_eq!(batch[1], embedder.embed_one("vector search"));
    assert!((cosine_similarity(&batch[0], &batch[0]) - 1.0).abs() < 1e-5);
}

// ============================================================================
// Retry Policy Tests
// ============================================================================

#[test]
fn test_graph_retry_policy_backoff() {
    let policy = RetryPolicy::graph_mutation();
    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.delay_for(1), Duration::from_secs(4));
    assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    assert_eq!(policy.delay_for(4), Duration::from_secs(8));
    assert_eq!(policy.delay_for(10), Duration::from_secs(10));
}

// ============================================================================
// JSON KV Storage Tests
// ============================================================================

#[tokio::test]
async fn test_json_kv_last_write_wins_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let config = json_config(dir.path());

    let store = JsonKvStorage::new("full_docs", &config).unwrap();
    store
        .upsert(HashMap::from([("doc-1".to_string(), full_doc("first"))]))
        .await
        .unwrap();
    store
        .upsert(HashMap::from([("doc-1".to_string(), full_doc("second"))]))
        .await
        .unwrap();
    store.index_done_callback().await.unwrap();

    let reopened = JsonKvStorage::new("full_docs", &config).unwrap();
    assert_eq!(reopened.len().await, 1);
    assert_eq!(
        reopened.get_by_id("doc-1").await.unwrap(),
        Some(full_doc("second"))
    );
}

#[tokio::test]
async fn test_json_kv_filter_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonKvStorage::new("full_docs", &json_config(dir.path())).unwrap();
    store
        .upsert(HashMap::from([("a".to_string(), full_doc("A"))]))
        .await
        .unwrap();

    let candidates: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let unseen = store.filter_keys(&candidates).await.unwrap();
    assert_eq!(unseen, HashSet::from(["b".to_string(), "c".to_string()]));
    assert!(store.filter_keys(&HashSet::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_json_kv_cache_holds_several_modes() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonKvStorage::new("llm_response_cache", &json_config(dir.path())).unwrap();

    let modes = BTreeMap::from([
        (
            "hybrid".to_string(),
            CacheEntry {
                original_prompt: "who teaches Bob?".into(),
                return_value: "Alice".into(),
            },
        ),
        (
            "local".to_string(),
            CacheEntry {
                original_prompt: "who teaches Bob?".into(),
                return_value: "Alice, a professor".into(),
            },
        ),
    ]);
    store
        .upsert(HashMap::from([("q1".to_string(), KvRecord::Cache(modes))]))
        .await
        .unwrap();

    let Some(KvRecord::Cache(found)) = store.get_by_id("q1").await.unwrap() else {
        panic!("expected cache record");
    };
    assert_eq!(found.len(), 2);
    assert_eq!(found["local"].return_value, "Alice, a professor");
}

#[tokio::test]
async fn test_json_kv_rejects_foreign_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonKvStorage::new("llm_response_cache", &json_config(dir.path())).unwrap();
    let err = store
        .upsert(HashMap::from([("doc".to_string(), full_doc("x"))]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

// ============================================================================
// Error Tests
// ============================================================================

#[test]
fn test_error_variants_display() {
    let errors = vec![
        Error::Config("missing user".into()),
        Error::Connection {
            target: "localhost:5432/postgres".into(),
            detail: "refused".into(),
        },
        Error::GraphQuery {
            query: "MATCH (n) RETURN n".into(),
            detail: "syntax error".into(),
        },
        Error::Embedding("count mismatch".into()),
        Error::UnsupportedNamespace("sessions".into()),
        Error::InvalidArgument("bad arg".into()),
        Error::NotImplemented("node2vec".into()),
        Error::Serialization("json error".into()),
    ];
    for err in errors {
        assert!(!err.to_string().is_empty());
    }
}

#[test]
fn test_only_graph_errors_are_retryable() {
    let graph = Error::GraphQuery {
        query: "q".into(),
        detail: "lock".into(),
    };
    assert!(graph.is_graph_query());
    assert!(!Error::Config("x".into()).is_graph_query());
}
