use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::Row;
use tracing::info;

use super::db::PostgresDb;
use crate::error::{Error, Result};
use crate::metrics;
use crate::namespace::{Namespace, NamespaceKind};
use crate::storage::{CacheEntry, FullDoc, KvRecord, KvStorage, TextChunk};

const STORE: &str = "kv";

const SELECT_FULL_DOC: &str =
    "SELECT id, COALESCE(content, '') AS content FROM LIGHTRAG_DOC_FULL";
const SELECT_TEXT_CHUNK: &str = "SELECT id, tokens, COALESCE(content, '') AS content, \
     chunk_order_index, full_doc_id FROM LIGHTRAG_DOC_CHUNKS";
const SELECT_CACHE: &str = "SELECT id, mode, COALESCE(original_prompt, '') AS original_prompt, \
     COALESCE(return_value, '') AS return_value FROM LIGHTRAG_LLM_CACHE";

const UPSERT_DOC_FULL: &str = "INSERT INTO LIGHTRAG_DOC_FULL (id, content, workspace)
     VALUES ($1, $2, $3)
     ON CONFLICT (workspace, id) DO UPDATE
        SET content = EXCLUDED.content, update_time = CURRENT_TIMESTAMP";

const UPSERT_TEXT_CHUNK: &str = "INSERT INTO LIGHTRAG_DOC_CHUNKS
        (workspace, id, tokens, chunk_order_index, full_doc_id, content)
     VALUES ($1, $2, $3, $4, $5, $6)
     ON CONFLICT (workspace, id) DO UPDATE
        SET tokens = EXCLUDED.tokens,
            chunk_order_index = EXCLUDED.chunk_order_index,
            full_doc_id = EXCLUDED.full_doc_id,
            content = EXCLUDED.content,
            update_time = CURRENT_TIMESTAMP";

const UPSERT_CACHE: &str = "INSERT INTO LIGHTRAG_LLM_CACHE
        (workspace, id, original_prompt, return_value, mode)
     VALUES ($1, $2, $3, $4, $5)
     ON CONFLICT (workspace, mode, id) DO UPDATE
        SET original_prompt = EXCLUDED.original_prompt,
            return_value = EXCLUDED.return_value,
            update_time = CURRENT_TIMESTAMP";

/// KV store for full documents, text chunks and the LLM response cache.
pub struct PgKvStorage {
    db: Arc<PostgresDb>,
    namespace: Namespace,
    table: &'static str,
}

impl PgKvStorage {
    pub fn new(namespace: &str, db: Arc<PostgresDb>) -> Result<Self> {
        let namespace = Namespace::parse(namespace)?;
        if !namespace.kind().is_kv() {
            return Err(Error::UnsupportedNamespace(namespace.name().to_string()));
        }
        let table = namespace.table()?;
        Ok(Self {
            db,
            namespace,
            table,
        })
    }

    pub fn workspace(&self) -> &str {
        self.db.workspace()
    }

    fn select_sql(&self) -> &'static str {
        match self.namespace.kind() {
            NamespaceKind::TextChunks => SELECT_TEXT_CHUNK,
            NamespaceKind::LlmResponseCache => SELECT_CACHE,
            _ => SELECT_FULL_DOC,
        }
    }

    /// Rows to records, keyed by id. Cache rows for one id are merged by mode.
    fn collect_records(&self, rows: &[Row]) -> HashMap<String, KvRecord> {
        let mut records = HashMap::new();
        for row in rows {
            let id: String = row.get("id");
            match self.namespace.kind() {
                NamespaceKind::LlmResponseCache => {
                    let mode: String = row.get("mode");
                    let entry = CacheEntry {
                        original_prompt: row.get("original_prompt"),
                        return_value: row.get("return_value"),
                    };
                    let slot = records
                        .entry(id)
                        .or_insert_with(|| KvRecord::Cache(BTreeMap::new()));
                    if let KvRecord::Cache(modes) = slot {
                        modes.insert(mode, entry);
                    }
                }
                NamespaceKind::TextChunks => {
                    let record = KvRecord::TextChunk(TextChunk {
                        tokens: row.get::<_, Option<i32>>("tokens").unwrap_or_default(),
                        chunk_order_index: row
                            .get::<_, Option<i32>>("chunk_order_index")
                            .unwrap_or_default(),
                        full_doc_id: row
                            .get::<_, Option<String>>("full_doc_id")
                            .unwrap_or_default(),
                        content: row.get("content"),
                    });
                    records.insert(id, record);
                }
                _ => {
                    records.insert(
                        id,
                        KvRecord::FullDoc(FullDoc {
                            content: row.get("content"),
                        }),
                    );
                }
            }
        }
        records
    }

    /// Cached answer for one `(mode, id)`; `None` outside the cache namespace.
    pub async fn get_by_mode_and_id(&self, mode: &str, id: &str) -> Result<Option<CacheEntry>> {
        if self.namespace.kind() != NamespaceKind::LlmResponseCache {
            return Ok(None);
        }
        let sql = format!("{SELECT_CACHE} WHERE workspace = $1 AND mode = $2 AND id = $3");
        let row = self
            .db
            .query_opt(&sql, &[&self.db.workspace(), &mode, &id])
            .await?;
        Ok(row.map(|row| CacheEntry {
            original_prompt: row.get("original_prompt"),
            return_value: row.get("return_value"),
        }))
    }

    async fn upsert_one(&self, id: &str, record: &KvRecord) -> Result<()> {
        let workspace = self.db.workspace();
        match record {
            KvRecord::FullDoc(doc) => {
                self.db
                    .execute(UPSERT_DOC_FULL, &[&id, &doc.content, &workspace], true)
                    .await?;
            }
            KvRecord::TextChunk(chunk) => {
                self.db
                    .execute(
                        UPSERT_TEXT_CHUNK,
                        &[
                            &workspace,
                            &id,
                            &chunk.tokens,
                            &chunk.chunk_order_index,
                            &chunk.full_doc_id,
                            &chunk.content,
                        ],
                        true,
                    )
                    .await?;
            }
            KvRecord::Cache(modes) => {
                for (mode, entry) in modes {
                    self.db
                        .execute(
                            UPSERT_CACHE,
                            &[
                                &workspace,
                                &id,
                                &entry.original_prompt,
                                &entry.return_value,
                                mode,
                            ],
                            true,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KvStorage for PgKvStorage {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<KvRecord>> {
        metrics::observe(STORE, "get_by_id", async {
            let sql = format!("{} WHERE workspace = $1 AND id = $2", self.select_sql());
            let rows = self.db.query(&sql, &[&self.db.workspace(), &id]).await?;
            Ok(self.collect_records(&rows).remove(id))
        })
        .await
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<KvRecord>>> {
        metrics::observe(STORE, "get_by_ids", async {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let sql = format!("{} WHERE workspace = $1 AND id = ANY($2)", self.select_sql());
            let rows = self.db.query(&sql, &[&self.db.workspace(), &ids]).await?;
            let records = self.collect_records(&rows);
            // ids may repeat
            Ok(ids.iter().map(|id| records.get(id).cloned()).collect())
        })
        .await
    }

    async fn filter_keys(&self, keys: &HashSet<String>) -> Result<HashSet<String>> {
        metrics::observe(STORE, "filter_keys", async {
            if keys.is_empty() {
                return Ok(HashSet::new());
            }
            let candidates: Vec<&str> = keys.iter().map(String::as_str).collect();
            let sql = format!(
                "SELECT id FROM {} WHERE workspace = $1 AND id = ANY($2)",
                self.table
            );
            let rows = self
                .db
                .query(&sql, &[&self.db.workspace(), &candidates])
                .await?;
            let existing: HashSet<String> = rows.iter().map(|row| row.get("id")).collect();
            Ok(keys.difference(&existing).cloned().collect())
        })
        .await
    }

    async fn upsert(&self, data: HashMap<String, KvRecord>) -> Result<()> {
        metrics::observe(STORE, "upsert", async {
            info!(namespace = %self.namespace, "Inserting {} to {}", data.len(), self.namespace);
            for record in data.values() {
                if record.kind() != self.namespace.kind() {
                    return Err(Error::InvalidArgument(format!(
                        "{} record cannot be stored in namespace {}",
                        record.kind(),
                        self.namespace
                    )));
                }
            }
            for (id, record) in &data {
                self.upsert_one(id, record).await?;
            }
            Ok(())
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
        info!(namespace = %self.namespace, workspace = self.db.workspace(), "Dropped KV data");
        Ok(())
    }
}
