use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::{info, warn};

use super::db::PostgresDb;
use super::schema::TABLE_DOC_STATUS;
use crate::error::{Error, Result};
use crate::metrics;
use crate::namespace::{Namespace, NamespaceKind};
use crate::storage::{DocProcessingStatus, DocStatus, DocStatusStorage};

const STORE: &str = "doc_status";

/// Stored when the chunk count is not known yet.
pub const CHUNKS_COUNT_UNKNOWN: i32 = -1;

const SELECT_DOC_STATUS: &str = "SELECT id, content, content_summary, content_length, \
     chunks_count, status, created_at, updated_at FROM LIGHTRAG_DOC_STATUS";

const UPSERT_DOC_STATUS: &str = "INSERT INTO LIGHTRAG_DOC_STATUS
        (workspace, id, content, content_summary, content_length, chunks_count, status)
     VALUES ($1, $2, $3, $4, $5, $6, $7)
     ON CONFLICT (workspace, id) DO UPDATE
        SET content = EXCLUDED.content,
            content_summary = EXCLUDED.content_summary,
            content_length = EXCLUDED.content_length,
            chunks_count = EXCLUDED.chunks_count,
            status = EXCLUDED.status,
            updated_at = CURRENT_TIMESTAMP";

const STATUS_COUNTS: &str = "SELECT status, COUNT(1) AS count FROM LIGHTRAG_DOC_STATUS \
     WHERE workspace = $1 GROUP BY status";

/// Parse a stored status, warning on values this crate does not know.
fn parse_status(id: &str, raw: Option<&str>) -> Option<DocStatus> {
    let raw = raw.unwrap_or_default();
    match raw.parse() {
        Ok(status) => Some(status),
        Err(_) => {
            warn!(id, value = raw, "Skipping document with unknown status");
            None
        }
    }
}

fn record_from_row(row: &Row) -> Option<(String, DocProcessingStatus)> {
    let id: String = row.get("id");
    let status = parse_status(&id, row.get("status"))?;
    let record = DocProcessingStatus {
        content: row.get::<_, Option<String>>("content").unwrap_or_default(),
        content_summary: row
            .get::<_, Option<String>>("content_summary")
            .unwrap_or_default(),
        content_length: row.get::<_, Option<i32>>("content_length").unwrap_or_default(),
        status,
        chunks_count: row.get("chunks_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    };
    Some((id, record))
}

/// Per-document processing state in `LIGHTRAG_DOC_STATUS`.
pub struct PgDocStatusStorage {
    db: Arc<PostgresDb>,
    namespace: Namespace,
}

impl PgDocStatusStorage {
    pub fn new(namespace: &str, db: Arc<PostgresDb>) -> Result<Self> {
        let namespace = Namespace::parse(namespace)?;
        if namespace.kind() != NamespaceKind::DocStatus {
            return Err(Error::UnsupportedNamespace(namespace.name().to_string()));
        }
        Ok(Self { db, namespace })
    }

    /// Rows matching `filter` in this workspace. `$1` is always the workspace.
    async fn select(
        &self,
        filter: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<HashMap<String, DocProcessingStatus>> {
        let sql = format!("{SELECT_DOC_STATUS} WHERE workspace = $1 AND {filter}");
        let rows = self.db.query(&sql, params).await?;
        Ok(rows.iter().filter_map(record_from_row).collect())
    }
}

#[async_trait]
impl DocStatusStorage for PgDocStatusStorage {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<DocProcessingStatus>> {
        metrics::observe(STORE, "get_by_id", async {
            let mut found = self
                .select("id = $2", &[&self.db.workspace(), &id])
                .await?;
            Ok(found.remove(id))
        })
        .await
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<HashMap<String, DocProcessingStatus>> {
        metrics::observe(STORE, "get_by_ids", async {
            if ids.is_empty() {
                return Ok(HashMap::new());
            }
            self.select("id = ANY($2)", &[&self.db.workspace(), &ids])
                .await
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
                "SELECT id FROM {TABLE_DOC_STATUS} WHERE workspace = $1 AND id = ANY($2)"
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

    async fn get_status_counts(&self) -> Result<HashMap<DocStatus, i64>> {
        metrics::observe(STORE, "get_status_counts", async {
            let rows = self.db.query(STATUS_COUNTS, &[&self.db.workspace()]).await?;
            let mut counts = HashMap::new();
            for row in &rows {
                let raw: Option<String> = row.get("status");
                if let Some(status) = parse_status("*", raw.as_deref()) {
                    *counts.entry(status).or_insert(0) += row.get::<_, i64>("count");
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn get_docs_by_status(
        &self,
        status: DocStatus,
    ) -> Result<HashMap<String, DocProcessingStatus>> {
        metrics::observe(STORE, "get_docs_by_status", async {
            self.select("status = $2", &[&self.db.workspace(), &status.as_str()])
                .await
        })
        .await
    }

    async fn upsert(&self, data: HashMap<String, DocProcessingStatus>) -> Result<()> {
        metrics::observe(STORE, "upsert", async {
            info!(namespace = %self.namespace, "Inserting {} to {}", data.len(), self.namespace);
            for (id, doc) in &data {
                let chunks_count = doc.chunks_count.unwrap_or(CHUNKS_COUNT_UNKNOWN);
                self.db
                    .execute(
                        UPSERT_DOC_STATUS,
                        &[
                            &self.db.workspace(),
                            id,
                            &doc.content,
                            &doc.content_summary,
                            &doc.content_length,
                            &chunks_count,
                            &doc.status.as_str(),
                        ],
                        true,
                    )
                    .await?;
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
            let sql = format!("DELETE FROM {TABLE_DOC_STATUS} WHERE workspace = $1 AND id = ANY($2)");
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
        let sql = format!("DELETE FROM {TABLE_DOC_STATUS} WHERE workspace = $1");
        self.db.execute(&sql, &[&self.db.workspace()], false).await?;
        info!(workspace = self.db.workspace(), "Dropped document status data");
        Ok(())
    }
}
