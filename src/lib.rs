//! LightRAG PostgreSQL Storage Library
//!
//! This library provides the persistence layer of a LightRAG deployment on a
//! single PostgreSQL database:
//! - Key-value storage for full documents, text chunks and the LLM response cache
//! - Vector similarity search over chunks, entities and relationships (pgvector)
//! - Per-document processing status tracking
//! - An entity/relationship property graph (Apache AGE)
//! - A shared, reference-counted connection pool with startup schema checks
//! - A file-backed JSON KV store for single-process use

pub mod config;
pub mod embedding;
pub mod error;
pub mod metrics;
pub mod namespace;
pub mod storage;

// Re-export common types
pub use config::{DuplicateKeyPolicy, GlobalConfig, PostgresConfig, PostgresOverrides};
pub use embedding::{EmbeddingFunc, HashEmbedding, OpenAiEmbedding};
pub use error::{DecodeError, Error, Result};
pub use namespace::{make_namespace, Namespace, NamespaceKind};
pub use storage::postgres::{
    ClientManager, PgDocStatusStorage, PgGraphStorage, PgKvStorage, PgVectorStorage, PostgresDb,
};
pub use storage::{
    DocStatusStorage, GraphStorage, JsonKvStorage, KvStorage, RetryPolicy, VectorStorage,
};
