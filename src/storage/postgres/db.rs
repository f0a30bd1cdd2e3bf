//! Shared connection pool and the reference-counted client manager.

use std::fmt::Debug;
use std::sync::Arc;

use deadpool_postgres::{Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row, SimpleQueryMessage};
use tracing::{debug, error, info};

use super::agtype::GraphRecord;
use super::schema;
use crate::config::{DuplicateKeyPolicy, GlobalConfig, PostgresConfig};
use crate::error::{Error, Result};
use crate::metrics;
use crate::namespace::sanitize_identifier;

const AGE_SEARCH_PATH: &str = r#"SET search_path = ag_catalog, "$user", public"#;

/// Owns the pool; closing happens when the last handle goes away.
struct SharedPool {
    pool: Pool,
    target: String,
}

impl Drop for SharedPool {
    fn drop(&mut self) {
        if !self.pool.is_closed() {
            self.pool.close();
            debug!(db = %self.target, "PostgreSQL pool closed on drop");
        }
    }
}

/// Handle to the shared pool, bound to one workspace.
#[derive(Clone)]
pub struct PostgresDb {
    shared: Arc<SharedPool>,
    workspace: String,
    duplicate_key_policy: DuplicateKeyPolicy,
}

impl Debug for PostgresDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDb")
            .field("target", &self.shared.target)
            .field("workspace", &self.workspace)
            .field("duplicate_key_policy", &self.duplicate_key_policy)
            .finish()
    }
}

fn is_duplicate(err: &tokio_postgres::Error) -> bool {
    matches!(
        err.code(),
        Some(code) if *code == SqlState::UNIQUE_VIOLATION || *code == SqlState::DUPLICATE_TABLE
    )
}

fn is_existing_graph(err: &tokio_postgres::Error) -> bool {
    is_duplicate(err)
        || matches!(
            err.code(),
            Some(code) if *code == SqlState::DUPLICATE_SCHEMA || *code == SqlState::INVALID_SCHEMA_NAME
        )
}

impl PostgresDb {
    /// Build the pool and open `min_connections` connections. Failure here is
    /// returned to the caller, never retried.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let target = config.target();
        let connection_error = |detail: String| {
            error!(db = %target, "Failed to connect to PostgreSQL: {}", detail);
            Error::Connection {
                target: target.clone(),
                detail,
            }
        };

        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.database.clone());
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(config.max_connections));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| connection_error(format!("Failed to create pool: {e}")))?;

        let mut warm = Vec::with_capacity(config.min_connections);
        for _ in 0..config.min_connections {
            warm.push(pool.get().await.map_err(|e| connection_error(e.to_string()))?);
        }
        drop(warm);

        info!(db = %target, workspace = %config.workspace, "Connected to PostgreSQL");

        Ok(Self {
            shared: Arc::new(SharedPool { pool, target }),
            workspace: config.workspace.clone(),
            duplicate_key_policy: config.duplicate_key_policy,
        })
    }

    /// Pool that has not opened any connection yet.
    #[cfg(test)]
    pub(crate) fn unconnected(workspace: &str) -> Self {
        let mut cfg = Config::new();
        cfg.host = Some("127.0.0.1".to_string());
        cfg.port = Some(1);
        cfg.user = Some("test".to_string());
        cfg.password = Some("test".to_string());
        cfg.dbname = Some("postgres".to_string());
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .expect("pool config is valid");
        Self {
            shared: Arc::new(SharedPool {
                pool,
                target: "127.0.0.1:1/postgres".to_string(),
            }),
            workspace: sanitize_identifier(workspace),
            duplicate_key_policy: DuplicateKeyPolicy::default(),
        }
    }

    /// Same pool, different workspace.
    pub fn with_workspace(&self, workspace: &str) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            workspace: sanitize_identifier(workspace),
            duplicate_key_policy: self.duplicate_key_policy,
        }
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn target(&self) -> &str {
        &self.shared.target
    }

    pub fn duplicate_key_policy(&self) -> DuplicateKeyPolicy {
        self.duplicate_key_policy
    }

    pub fn shares_pool_with(&self, other: &PostgresDb) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.pool.is_closed()
    }

    pub fn close(&self) {
        self.shared.pool.close();
    }

    async fn client(&self) -> Result<Object> {
        self.shared.pool.get().await.map_err(|e| Error::Connection {
            target: self.shared.target.clone(),
            detail: e.to_string(),
        })
    }

    fn log_failure(&self, sql: &str, params: &[&(dyn ToSql + Sync)], err: &tokio_postgres::Error) {
        error!(
            workspace = %self.workspace,
            sql,
            params = ?params,
            "PostgreSQL statement failed: {}",
            err
        );
    }

    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        let client = self.client().await?;
        client.query(sql, params).await.map_err(|err| {
            self.log_failure(sql, params, &err);
            Error::Postgres(err)
        })
    }

    pub async fn query_opt(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Run a statement. Unique-key and duplicate-table conflicts succeed when
    /// `upsert` is set and otherwise follow the configured
    /// [`DuplicateKeyPolicy`], which is how a plain `INSERT` from outside the
    /// stores opts into failing on conflicts.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        upsert: bool,
    ) -> Result<u64> {
        let client = self.client().await?;
        match client.execute(sql, params).await {
            Ok(rows) => Ok(rows),
            Err(err) if is_duplicate(&err) => self.on_duplicate(err, upsert).map(|_| 0),
            Err(err) => {
                self.log_failure(sql, params, &err);
                Err(Error::Postgres(err))
            }
        }
    }

    fn on_duplicate(&self, err: tokio_postgres::Error, upsert: bool) -> Result<()> {
        if !self.duplicate_key_policy.tolerates(upsert) {
            return Err(Error::Postgres(err));
        }
        if upsert {
            debug!(workspace = %self.workspace, "Duplicate key on upsert, treated as success");
        } else {
            error!(workspace = %self.workspace, "Duplicate key ignored: {}", err);
        }
        Ok(())
    }

    /// `SELECT 1 FROM table LIMIT 1`, without error logging.
    pub(crate) async fn probe_table(&self, table: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .simple_query(&format!("SELECT 1 FROM {table} LIMIT 1"))
            .await
            .map(|_| ())
            .map_err(Error::Postgres)
    }

    /// Point the session at `ag_catalog` and create the graph if missing.
    pub async fn ensure_graph(&self, graph_name: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(AGE_SEARCH_PATH)
            .await
            .map_err(|e| Error::graph_query(AGE_SEARCH_PATH, e))?;

        let exists = client
            .query_opt("SELECT 1 FROM ag_catalog.ag_graph WHERE name = $1", &[&graph_name])
            .await
            .map_err(|e| Error::graph_query("SELECT ... FROM ag_catalog.ag_graph", e))?
            .is_some();
        if exists {
            return Ok(());
        }

        match client
            .execute("SELECT ag_catalog.create_graph($1)", &[&graph_name])
            .await
        {
            Ok(_) => {
                info!(graph = graph_name, "Created AGE graph");
                Ok(())
            }
            Err(err) if is_existing_graph(&err) => Ok(()),
            Err(err) => Err(Error::graph_query("SELECT ag_catalog.create_graph($1)", err)),
        }
    }

    pub async fn drop_graph(&self, graph_name: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute("SELECT ag_catalog.drop_graph($1, true)", &[&graph_name])
            .await
            .map(|_| info!(graph = graph_name, "Dropped AGE graph"))
            .map_err(|e| Error::graph_query("SELECT ag_catalog.drop_graph($1, true)", e))
    }

    /// Run a `cypher(...)` query over the text protocol and decode its rows.
    pub async fn graph_query(&self, sql: &str) -> Result<Vec<GraphRecord>> {
        let client = self.client().await?;
        client
            .batch_execute(AGE_SEARCH_PATH)
            .await
            .map_err(|e| Error::graph_query(sql, e))?;

        let messages = client
            .simple_query(sql)
            .await
            .map_err(|e| Error::graph_query(sql, e))?;

        Ok(messages
            .iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => Some(GraphRecord::from_row(row)),
                _ => None,
            })
            .collect())
    }

    /// Run a mutating `cypher(...)` statement.
    pub async fn graph_execute(&self, sql: &str, upsert: bool) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(AGE_SEARCH_PATH)
            .await
            .map_err(|e| Error::graph_query(sql, e))?;

        match client.simple_query(sql).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate(&err) => self
                .on_duplicate(err, upsert)
                .map_err(|e| Error::graph_query(sql, e)),
            Err(err) => Err(Error::graph_query(sql, err)),
        }
    }
}

#[derive(Default)]
struct Slot {
    db: Option<PostgresDb>,
    ref_count: usize,
}

/// Hands out one shared pool per process.
///
/// The first [`acquire`](ClientManager::acquire) builds the pool and ensures
/// the schema; the last [`release`](ClientManager::release) closes it.
#[derive(Default)]
pub struct ClientManager {
    slot: Mutex<Slot>,
}

static GLOBAL: Lazy<ClientManager> = Lazy::new(ClientManager::new);

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static ClientManager {
        &GLOBAL
    }

    pub async fn acquire(
        &self,
        namespace_prefix: Option<&str>,
        global_config: &GlobalConfig,
    ) -> Result<Arc<PostgresDb>> {
        let config = PostgresConfig::for_global(namespace_prefix, global_config)?;
        self.acquire_with(&config).await
    }

    pub async fn acquire_with(&self, config: &PostgresConfig) -> Result<Arc<PostgresDb>> {
        let mut slot = self.slot.lock().await;

        let db = match &slot.db {
            Some(db) => db.with_workspace(&config.workspace),
            None => {
                let db = PostgresDb::connect(config).await?;
                schema::ensure_tables(&db).await?;
                slot.db = Some(db.clone());
                slot.ref_count = 0;
                db
            }
        };

        slot.ref_count += 1;
        metrics::set_pool_refs(slot.ref_count);
        Ok(Arc::new(db))
    }

    /// Give a handle back. A handle from another pool is closed directly.
    pub async fn release(&self, db: Arc<PostgresDb>) {
        let mut slot = self.slot.lock().await;

        let owned = slot
            .db
            .as_ref()
            .is_some_and(|current| current.shares_pool_with(&db));
        if !owned {
            db.close();
            return;
        }

        slot.ref_count = slot.ref_count.saturating_sub(1);
        metrics::set_pool_refs(slot.ref_count);
        if slot.ref_count == 0 {
            if let Some(current) = slot.db.take() {
                current.close();
                info!("Closed PostgreSQL database connection pool");
            }
        }
    }

    pub async fn ref_count(&self) -> usize {
        self.slot.lock().await.ref_count
    }
}
