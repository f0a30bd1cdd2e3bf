//! PostgreSQL backend: relational tables for KV, vectors (pgvector) and
//! document status, Apache AGE for the graph. All stores share one pool
//! handed out by [`ClientManager`].

pub mod agtype;
pub mod cypher;
pub mod db;
pub mod doc_status;
pub mod graph;
pub mod kv;
pub mod schema;
pub mod vector;

pub use db::{ClientManager, PostgresDb};
pub use doc_status::PgDocStatusStorage;
pub use graph::PgGraphStorage;
pub use kv::PgKvStorage;
pub use vector::PgVectorStorage;
