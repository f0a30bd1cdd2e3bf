use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use pgvector::Vector;
use tokio_postgres::Row;
use tracing::{debug, info};

use super::db::PostgresDb;
use super::schema::{TABLE_VDB_ENTITY, TABLE_VDB_RELATION};
use crate::config::GlobalConfig;
use crate::embedding::EmbeddingFunc;
use crate::error::{Error, Result};
use crate::metrics;
use crate::namespace::{Namespace, NamespaceKind};
use crate::storage::{VectorHit, VectorMatch, VectorRecord, VectorStorage};

const STORE: &str = "vector";

const UPSERT_CHUNK: &str = "INSERT INTO LIGHTRAG_DOC_CHUNKS
        (workspace, id, tokens, chunk_order_index, full_doc_id, content, content_vector)
     VALUES ($1, $2, $3, $4, $5, $6, $7)
     ON CONFLICT (workspace, id) DO UPDATE
        SET tokens = EXCLUDED.tokens,
            chunk_order_index = EXCLUDED.chunk_order_index,
            full_doc_id = EXCLUDED.full_doc_id,
            content = EXCLUDED.content,
            content_vector = EXCLUDED.content_vector,
            update_time = CURRENT_TIMESTAMP";

const UPSERT_ENTITY: &str = "INSERT INTO LIGHTRAG_VDB_ENTITY
        (workspace, id, entity_name, content, content_vector)
     VALUES ($1, $2, $3, $4, $5)
     ON CONFLICT (workspace, id) DO UPDATE
        SET entity_name = EXCLUDED.entity_name,
            content = EXCLUDED.content,
            content_vector = EXCLUDED.content_vector,
            update_time = CURRENT_TIMESTAMP";

const UPSERT_RELATIONSHIP: &str = "INSERT INTO LIGHTRAG_VDB_RELATION
        (workspace, id, source_id, target_id, content, content_vector)
     VALUES ($1, $2, $3, $4, $5, $6)
     ON CONFLICT (workspace, id) DO UPDATE
        SET source_id = EXCLUDED.source_id,
            target_id = EXCLUDED.target_id,
            content = EXCLUDED.content,
            content_vector = EXCLUDED.content_vector,
            update_time = CURRENT_TIMESTAMP";

/// Similarity search over one table. `$1` workspace, `$2` query vector,
/// `$3` threshold, `$4` limit.
fn query_sql(kind: NamespaceKind) -> Result<&'static str> {
    let sql = match kind {
        NamespaceKind::Entities => {
            "SELECT entity_name, distance FROM
                (SELECT entity_name, 1 - (content_vector <=> $2) AS distance
                 FROM LIGHTRAG_VDB_ENTITY WHERE workspace = $1) AS candidates
             WHERE distance > $3 ORDER BY distance DESC LIMIT $4"
        }
        NamespaceKind::Relationships => {
            "SELECT source_id AS src_id, target_id AS tgt_id, distance FROM
                (SELECT source_id, target_id, 1 - (content_vector <=> $2) AS distance
                 FROM LIGHTRAG_VDB_RELATION WHERE workspace = $1) AS candidates
             WHERE distance > $3 ORDER BY distance DESC LIMIT $4"
        }
        NamespaceKind::Chunks => {
            "SELECT id, distance FROM
                (SELECT id, 1 - (content_vector <=> $2) AS distance
                 FROM LIGHTRAG_DOC_CHUNKS WHERE workspace = $1) AS candidates
             WHERE distance > $3 ORDER BY distance DESC LIMIT $4"
        }
        other => return Err(Error::UnsupportedNamespace(other.to_string())),
    };
    Ok(sql)
}

fn hit_from_row(kind: NamespaceKind, row: &Row) -> VectorHit {
    match kind {
        NamespaceKind::Entities => VectorHit::Entity {
            entity_name: row.get::<_, Option<String>>("entity_name").unwrap_or_default(),
        },
        NamespaceKind::Relationships => VectorHit::Relationship {
            src_id: row.get::<_, Option<String>>("src_id").unwrap_or_default(),
            tgt_id: row.get::<_, Option<String>>("tgt_id").unwrap_or_default(),
        },
        _ => VectorHit::Chunk { id: row.get("id") },
    }
}

/// Split `items` into consecutive batches of at most `size`.
fn batches<T>(items: &[T], size: usize) -> impl Iterator<Item = &[T]> {
    items.chunks(size.max(1))
}

/// pgvector-backed store for chunk, entity and relationship embeddings.
pub struct PgVectorStorage {
    db: Arc<PostgresDb>,
    namespace: Namespace,
    table: &'static str,
    embedding_func: Arc<dyn EmbeddingFunc>,
    batch_size: usize,
    cosine_better_than_threshold: f64,
}

impl PgVectorStorage {
    /// Fails with [`Error::Config`] when no similarity threshold is configured.
    pub fn new(
        namespace: &str,
        global_config: &GlobalConfig,
        embedding_func: Arc<dyn EmbeddingFunc>,
        db: Arc<PostgresDb>,
    ) -> Result<Self> {
        let cosine_better_than_threshold = global_config.cosine_better_than_threshold()?;
        let namespace = Namespace::parse(namespace)?;
        if !namespace.kind().is_vector() {
            return Err(Error::UnsupportedNamespace(namespace.name().to_string()));
        }
        let table = namespace.table()?;
        Ok(Self {
            db,
            namespace,
            table,
            embedding_func,
            batch_size: global_config.embedding_batch_num.max(1),
            cosine_better_than_threshold,
        })
    }

    pub fn cosine_better_than_threshold(&self) -> f64 {
        self.cosine_better_than_threshold
    }

    /// Embed all contents, one concurrent request per batch, in input order.
    async fn embed_contents(&self, contents: &[String]) -> Result<Vec<Vec<f32>>> {
        let requests = batches(contents, self.batch_size).map(|batch| async move {
            let vectors = self.embedding_func.embed(batch).await?;
            if vectors.len() != batch.len() {
                return Err(Error::Embedding(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    vectors.len()
                )));
            }
            Ok(vectors)
        });
        let embeddings: Vec<Vec<f32>> = try_join_all(requests).await?.into_iter().flatten().collect();
        if let Some(pos) = embeddings.iter().position(Vec::is_empty) {
            return Err(Error::Embedding(format!("empty embedding at position {pos}")));
        }
        Ok(embeddings)
    }

    async fn upsert_one(&self, id: &str, record: &VectorRecord, vector: Vector) -> Result<()> {
        let workspace = self.db.workspace();
        match record {
            VectorRecord::Chunk {
                tokens,
                chunk_order_index,
                full_doc_id,
                content,
            } => {
                self.db
                    .execute(
                        UPSERT_CHUNK,
                        &[
                            &workspace,
                            &id,
                            tokens,
                            chunk_order_index,
                            full_doc_id,
                            content,
                            &vector,
                        ],
                        true,
                    )
                    .await?;
            }
            VectorRecord::Entity {
                entity_name,
                content,
            } => {
                self.db
                    .execute(
                        UPSERT_ENTITY,
                        &[&workspace, &id, entity_name, content, &vector],
                        true,
                    )
                    .await?;
            }
            VectorRecord::Relationship {
                src_id,
                tgt_id,
                content,
            } => {
                self.db
                    .execute(
                        UPSERT_RELATIONSHIP,
                        &[&workspace, &id, src_id, tgt_id, content, &vector],
                        true,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStorage for PgVectorStorage {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn upsert(&self, data: HashMap<String, VectorRecord>) -> Result<()> {
        metrics::observe(STORE, "upsert", async {
            info!(namespace = %self.namespace, "Inserting {} to {}", data.len(), self.namespace);
            if data.is_empty() {
                return Ok(());
            }

            let items: Vec<(&String, &VectorRecord)> = data.iter().collect();
            for (id, record) in &items {
                if record.kind() != self.namespace.kind() {
                    return Err(Error::InvalidArgument(format!(
                        "{id}: {} record cannot be stored in namespace {}",
                        record.kind(),
                        self.namespace
                    )));
                }
            }

            let contents: Vec<String> = items
                .iter()
                .map(|(_, record)| record.content().to_string())
                .collect();
            let embeddings = self.embed_contents(&contents).await?;

            for ((id, record), embedding) in items.into_iter().zip(embeddings) {
                self.upsert_one(id, record, Vector::from(embedding)).await?;
            }
            Ok(())
        })
        .await
    }

    async fn query(&self, query: &str, top_k: usize) -> Result<Vec<VectorMatch>> {
        metrics::observe(STORE, "query", async {
            let sql = query_sql(self.namespace.kind())?;
            let mut embeddings = self.embedding_func.embed(&[query.to_string()]).await?;
            if embeddings.is_empty() {
                return Err(Error::Embedding("no embedding returned for query".to_string()));
            }
            let embedding = Vector::from(embeddings.swap_remove(0));
            let limit = i64::try_from(top_k).unwrap_or(i64::MAX);

            let rows = self
                .db
                .query(
                    sql,
                    &[
                        &self.db.workspace(),
                        &embedding,
                        &self.cosine_better_than_threshold,
                        &limit,
                    ],
                )
                .await?;

            let kind = self.namespace.kind();
            Ok(rows
                .iter()
                .map(|row| VectorMatch {
                    hit: hit_from_row(kind, row),
                    similarity: row.get("distance"),
                })
                .collect())
        })
        .await
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        metrics::observe(STORE, "delete", async {
            if ids.is_empty() {
                return Ok(());
            }
            let sql = format!(
                "DELETE FROM {} WHERE workspace = $1 AND id = ANY($2)",
                self.table
            );
            self.db
                .execute(&sql, &[&self.db.workspace(), &ids], false)
                .await?;
            debug!(namespace = %self.namespace, "Deleted {} vectors", ids.len());
            Ok(())
        })
        .await
    }

    async fn delete_entity(&self, entity_name: &str) -> Result<()> {
        metrics::observe(STORE, "delete_entity", async {
            let sql =
                format!("DELETE FROM {TABLE_VDB_ENTITY} WHERE workspace = $1 AND entity_name = $2");
            self.db
                .execute(&sql, &[&self.db.workspace(), &entity_name], false)
                .await?;
            debug!(entity = entity_name, "Deleted entity vector");
            Ok(())
        })
        .await
    }

    async fn delete_entity_relation(&self, entity_name: &str) -> Result<()> {
        metrics::observe(STORE, "delete_entity_relation", async {
            let sql = format!(
                "DELETE FROM {TABLE_VDB_RELATION} WHERE workspace = $1 \
                 AND (source_id = $2 OR target_id = $2)"
            );
            self.db
                .execute(&sql, &[&self.db.workspace(), &entity_name], false)
                .await?;
            debug!(entity = entity_name, "Deleted relations of entity");
            Ok(())
        })
        .await
    }

    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }

    async fn drop_storage(&self) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE workspace = $1", self.table);
        self.db.execute(&sql, &[&self.db.workspace()], false).await?;
        info!(namespace = %self.namespace, workspace = self.db.workspace(), "Dropped vector data");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VectorDbOptions;
    use crate::embedding::HashEmbedding;

    fn config_with_threshold(threshold: Option<f64>) -> GlobalConfig {
        GlobalConfig {
            embedding_batch_num: 2,
            vector_db_storage_cls_kwargs: VectorDbOptions {
                cosine_better_than_threshold: threshold,
            },
            ..Default::default()
        }
    }

    fn db() -> Arc<PostgresDb> {
        Arc::new(PostgresDb::unconnected("ws"))
    }

    #[tokio::test]
    async fn missing_threshold_is_config_error_at_construction() {
        let err = PgVectorStorage::new(
            "entities",
            &config_with_threshold(None),
            Arc::new(HashEmbedding::new(16)),
            db(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("cosine_better_than_threshold")));
    }

    #[tokio::test]
    async fn rejects_non_vector_namespace() {
        let err = PgVectorStorage::new(
            "full_docs",
            &config_with_threshold(Some(0.2)),
            Arc::new(HashEmbedding::new(16)),
            db(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::UnsupportedNamespace(_)));
    }

    #[tokio::test]
    async fn prefixed_namespace_keeps_its_table() {
        let store = PgVectorStorage::new(
            "tenant_relationships",
            &config_with_threshold(Some(0.2)),
            Arc::new(HashEmbedding::new(16)),
            db(),
        )
        .unwrap();
        assert_eq!(store.namespace().kind(), NamespaceKind::Relationships);
        assert_eq!(store.table, TABLE_VDB_RELATION);
        assert_eq!(store.cosine_better_than_threshold(), 0.2);
    }

    #[tokio::test]
    async fn upsert_rejects_mismatched_record_before_embedding() {
        let store = PgVectorStorage::new(
            "entities",
            &config_with_threshold(Some(0.2)),
            Arc::new(HashEmbedding::new(16)),
            db(),
        )
        .unwrap();
        let mut data = HashMap::new();
        data.insert(
            "rel-1".to_string(),
            VectorRecord::Relationship {
                src_id: "Alice".into(),
                tgt_id: "Bob".into(),
                content: "knows".into(),
            },
        );
        let err = store.upsert(data).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn embed_contents_keeps_input_order_across_batches() {
        let embedder = Arc::new(HashEmbedding::new(16));
        let store = PgVectorStorage::new(
            "chunks",
            &config_with_threshold(Some(0.2)),
            embedder.clone(),
            db(),
        )
        .unwrap();
        let contents: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        let embeddings = store.embed_contents(&contents).await.unwrap();
        assert_eq!(embeddings.len(), 5);
        for (content, embedding) in contents.iter().zip(&embeddings) {
            assert_eq!(embedding, &embedder.embed_one(content));
        }
    }

    #[test]
    fn batches_respect_size_and_order() {
        let items: Vec<u32> = (0..7).collect();
        let out: Vec<&[u32]> = batches(&items, 3).collect();
        assert_eq!(out, vec![&[0, 1, 2][..], &[3, 4, 5][..], &[6][..]]);
    }

    #[test]
    fn zero_batch_size_is_treated_as_one() {
        let items = [1, 2];
        assert_eq!(batches(&items, 0).count(), 2);
    }

    #[test]
    fn query_sql_filters_and_orders_by_similarity() {
        for kind in [
            NamespaceKind::Entities,
            NamespaceKind::Relationships,
            NamespaceKind::Chunks,
        ] {
            let sql = query_sql(kind).unwrap();
            assert!(sql.contains(kind.table().unwrap()));
            assert!(sql.contains("1 - (content_vector <=> $2)"));
            assert!(sql.contains("WHERE distance > $3 ORDER BY distance DESC LIMIT $4"));
            assert!(sql.contains("workspace = $1"));
        }
    }

    #[test]
    fn query_sql_rejects_non_vector_namespaces() {
        assert!(matches!(
            query_sql(NamespaceKind::FullDocs),
            Err(Error::UnsupportedNamespace(_))
        ));
    }
}
