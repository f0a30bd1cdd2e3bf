//! Table definitions and startup schema checks.

use tracing::{error, info};

use super::db::PostgresDb;
use crate::error::Result;

pub const TABLE_DOC_FULL: &str = "LIGHTRAG_DOC_FULL";
pub const TABLE_DOC_CHUNKS: &str = "LIGHTRAG_DOC_CHUNKS";
pub const TABLE_VDB_ENTITY: &str = "LIGHTRAG_VDB_ENTITY";
pub const TABLE_VDB_RELATION: &str = "LIGHTRAG_VDB_RELATION";
pub const TABLE_LLM_CACHE: &str = "LIGHTRAG_LLM_CACHE";
pub const TABLE_DOC_STATUS: &str = "LIGHTRAG_DOC_STATUS";

/// Every table the stores need, with its DDL.
pub const TABLES: [(&str, &str); 6] = [
    (
        TABLE_DOC_FULL,
        "CREATE TABLE LIGHTRAG_DOC_FULL (
            id VARCHAR(255),
            workspace VARCHAR(255),
            doc_name VARCHAR(1024),
            content TEXT,
            meta JSONB,
            create_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            update_time TIMESTAMP,
            CONSTRAINT LIGHTRAG_DOC_FULL_PK PRIMARY KEY (workspace, id)
        )",
    ),
    (
        TABLE_DOC_CHUNKS,
        "CREATE TABLE LIGHTRAG_DOC_CHUNKS (
            id VARCHAR(255),
            workspace VARCHAR(255),
            full_doc_id VARCHAR(256),
            chunk_order_index INTEGER,
            tokens INTEGER,
            content TEXT,
            content_vector VECTOR,
            create_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            update_time TIMESTAMP,
            CONSTRAINT LIGHTRAG_DOC_CHUNKS_PK PRIMARY KEY (workspace, id)
        )",
    ),
    (
        TABLE_VDB_ENTITY,
        "CREATE TABLE LIGHTRAG_VDB_ENTITY (
            id VARCHAR(255),
            workspace VARCHAR(255),
            entity_name VARCHAR(255),
            content TEXT,
            content_vector VECTOR,
            create_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            update_time TIMESTAMP,
            CONSTRAINT LIGHTRAG_VDB_ENTITY_PK PRIMARY KEY (workspace, id)
        )",
    ),
    (
        TABLE_VDB_RELATION,
        "CREATE TABLE LIGHTRAG_VDB_RELATION (
            id VARCHAR(255),
            workspace VARCHAR(255),
            source_id VARCHAR(256),
            target_id VARCHAR(256),
            content TEXT,
            content_vector VECTOR,
            create_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            update_time TIMESTAMP,
            CONSTRAINT LIGHTRAG_VDB_RELATION_PK PRIMARY KEY (workspace, id)
        )",
    ),
    (
        TABLE_LLM_CACHE,
        "CREATE TABLE LIGHTRAG_LLM_CACHE (
            workspace VARCHAR(255) NOT NULL,
            id VARCHAR(255) NOT NULL,
            mode VARCHAR(32) NOT NULL,
            original_prompt TEXT,
            return_value TEXT,
            create_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            update_time TIMESTAMP,
            CONSTRAINT LIGHTRAG_LLM_CACHE_PK PRIMARY KEY (workspace, mode, id)
        )",
    ),
    (
        TABLE_DOC_STATUS,
        "CREATE TABLE LIGHTRAG_DOC_STATUS (
            workspace VARCHAR(255) NOT NULL,
            id VARCHAR(255) NOT NULL,
            content TEXT NULL,
            content_summary VARCHAR(255) NULL,
            content_length INT4 NULL,
            chunks_count INT4 NULL,
            status VARCHAR(64) NULL,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP NULL,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP NULL,
            CONSTRAINT LIGHTRAG_DOC_STATUS_PK PRIMARY KEY (workspace, id)
        )",
    ),
];

/// Create any missing table. A table that fails to create aborts startup.
pub async fn ensure_tables(db: &PostgresDb) -> Result<()> {
    for (table, ddl) in TABLES {
        if db.probe_table(table).await.is_ok() {
            continue;
        }

        info!(table, "Creating missing table");
        // A concurrent creator may win the race; that counts as success.
        match db.execute(ddl, &[], true).await {
            Ok(_) => info!(table, "Created table"),
            Err(err) => {
                error!(table, "Failed to create table: {}", err);
                return Err(err);
            }
        }
    }
    Ok(())
}
