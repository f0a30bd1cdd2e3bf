//! Configuration for the PostgreSQL storage layer
//!
//! Loads configuration from config.yml file:
//!
//! ```yaml
//! postgres:            # fallback below environment variables
//!   host: db.internal
//!   user: lightrag
//!   password: "${PG_PASSWORD}"
//! lightrag:            # global config handed to every store
//!   working_dir: ./rag_storage
//!   embedding_batch_num: 32
//!   vector_db_storage_cls_kwargs:
//!     cosine_better_than_threshold: 0.2
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::namespace::{sanitize_identifier, DEFAULT_WORKSPACE};

pub const CONFIG_FILE: &str = "config.yml";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DATABASE: &str = "postgres";
pub const DEFAULT_GRAPH_NAME: &str = "lightrag";
pub const DEFAULT_EMBEDDING_BATCH_NUM: usize = 32;
pub const DEFAULT_WORKING_DIR: &str = "./rag_storage";
pub const MAX_CONNECTIONS: usize = 12;
pub const MIN_CONNECTIONS: usize = 1;

/// What to do when a plain insert hits a unique-key or duplicate-table error.
///
/// Calls that explicitly ask for upsert semantics always treat the conflict
/// as success. The stores only issue conflict-free statements without that
/// flag, so the policy governs statements callers run themselves through
/// `PostgresDb::execute(sql, params, false)` or `graph_execute(sql, false)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateKeyPolicy {
    /// Log at error level and carry on.
    #[default]
    Log,
    /// Return the driver error to the caller.
    Fail,
}

impl DuplicateKeyPolicy {
    /// Whether a duplicate-key error is reported as success.
    pub fn tolerates(self, upsert: bool) -> bool {
        upsert || self == DuplicateKeyPolicy::Log
    }
}

impl FromStr for DuplicateKeyPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(DuplicateKeyPolicy::Log),
            "fail" => Ok(DuplicateKeyPolicy::Fail),
            other => Err(Error::Config(format!(
                "unknown duplicate key policy {other:?} (expected 'log' or 'fail')"
            ))),
        }
    }
}

/// Connection settings that may come from the global config object or the
/// `postgres:` section of config.yml. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostgresOverrides {
    pub host: Option<String>,
    #[serde(default, deserialize_with = "deserialize_string_or_number")]
    pub port: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub workspace: Option<String>,
    pub duplicate_key_policy: Option<String>,
}

/// Deserialize a value that can be either a string or a number
fn deserialize_string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let value: Option<serde_yaml::Value> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or number, got {:?}",
            other
        ))),
    }
}

/// Options forwarded to vector stores.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VectorDbOptions {
    pub cosine_better_than_threshold: Option<f64>,
}

/// Global configuration shared by every store instance.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default = "default_embedding_batch_num")]
    pub embedding_batch_num: usize,
    #[serde(default)]
    pub namespace_prefix: Option<String>,
    #[serde(default)]
    pub graph_name: Option<String>,
    #[serde(default)]
    pub vector_db_storage_cls_kwargs: VectorDbOptions,
    /// Highest-precedence connection settings (above environment variables).
    #[serde(default)]
    pub postgres: PostgresOverrides,
    /// `postgres:` section of the file this config was loaded from. `None`
    /// means the default config.yml lookup applies.
    #[serde(skip)]
    pub postgres_file: Option<PostgresOverrides>,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(DEFAULT_WORKING_DIR)
}

fn default_embedding_batch_num() -> usize {
    DEFAULT_EMBEDDING_BATCH_NUM
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            embedding_batch_num: DEFAULT_EMBEDDING_BATCH_NUM,
            namespace_prefix: None,
            graph_name: None,
            vector_db_storage_cls_kwargs: VectorDbOptions::default(),
            postgres: PostgresOverrides::default(),
            postgres_file: None,
        }
    }
}

/// YAML config structure
#[derive(Debug, Default, Deserialize)]
struct YamlConfig {
    postgres: Option<PostgresOverrides>,
    lightrag: Option<GlobalConfig>,
}

impl YamlConfig {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// config.yml, then ../config.yml, then nothing.
    fn load_default() -> Self {
        Self::load(CONFIG_FILE)
            .or_else(|_| Self::load(Path::new("..").join(CONFIG_FILE)))
            .unwrap_or_default()
    }
}

impl GlobalConfig {
    /// Load the `lightrag:` section of config.yml or use defaults.
    pub fn new() -> Self {
        load_dotenv();
        YamlConfig::load_default().lightrag.unwrap_or_default()
    }

    /// Load the `lightrag:` section from a specific file. Its `postgres:`
    /// section becomes the file layer of connection resolution.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = YamlConfig::load(path)?;
        let mut config = yaml.lightrag.unwrap_or_default();
        config.postgres_file = Some(yaml.postgres.unwrap_or_default());
        Ok(config)
    }

    /// The similarity threshold vector stores require at construction.
    pub fn cosine_better_than_threshold(&self) -> Result<f64> {
        self.vector_db_storage_cls_kwargs
            .cosine_better_than_threshold
            .ok_or_else(|| {
                Error::Config(
                    "cosine_better_than_threshold must be specified in vector_db_storage_cls_kwargs"
                        .to_string(),
                )
            })
    }

    /// Graph name: explicit setting, then the store namespace, then
    /// `AGE_GRAPH_NAME`, then the built-in default.
    pub fn graph_name_for(&self, namespace: &str) -> String {
        self.graph_name_with(namespace, |key| std::env::var(key).ok())
    }

    fn graph_name_with(&self, namespace: &str, env: impl Fn(&str) -> Option<String>) -> String {
        let raw = non_empty(self.graph_name.as_deref())
            .or_else(|| non_empty(Some(namespace)))
            .or_else(|| env("AGE_GRAPH_NAME").filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| DEFAULT_GRAPH_NAME.to_string());
        sanitize_identifier(&raw)
    }
}

/// Fully resolved connection settings.
#[derive(Clone, PartialEq)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub workspace: String,
    pub max_connections: usize,
    pub min_connections: usize,
    pub duplicate_key_policy: DuplicateKeyPolicy,
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("workspace", &self.workspace)
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("duplicate_key_policy", &self.duplicate_key_policy)
            .finish()
    }
}

impl PostgresConfig {
    /// Resolve settings with precedence: call-time workspace override, global
    /// config, environment, config.yml, defaults.
    pub fn resolve(namespace_prefix: Option<&str>, global: &PostgresOverrides) -> Result<Self> {
        load_dotenv();
        let file = YamlConfig::load_default().postgres.unwrap_or_default();
        Self::resolve_with(namespace_prefix, global, &file, |key| std::env::var(key).ok())
    }

    /// Resolve for a loaded [`GlobalConfig`], using the file it came from
    /// when it was loaded with [`GlobalConfig::load_from_file`].
    pub fn for_global(namespace_prefix: Option<&str>, global: &GlobalConfig) -> Result<Self> {
        load_dotenv();
        Self::for_global_with(namespace_prefix, global, |key| std::env::var(key).ok())
    }

    fn for_global_with(
        namespace_prefix: Option<&str>,
        global: &GlobalConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        match &global.postgres_file {
            Some(file) => Self::resolve_with(namespace_prefix, &global.postgres, file, env),
            None => {
                let file = YamlConfig::load_default().postgres.unwrap_or_default();
                Self::resolve_with(namespace_prefix, &global.postgres, &file, env)
            }
        }
    }

    /// Same as [`PostgresConfig::resolve`] with an explicit file section and
    /// environment lookup.
    pub fn resolve_with(
        namespace_prefix: Option<&str>,
        global: &PostgresOverrides,
        file: &PostgresOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let pick = |global: &Option<String>, key: &str, file: &Option<String>| {
            non_empty(global.as_deref())
                .or_else(|| env(key).filter(|v| !v.trim().is_empty()))
                .or_else(|| {
                    file.as_deref()
                        .map(|v| expand_placeholder(v, &env))
                        .filter(|v| !v.trim().is_empty())
                })
        };

        let host = pick(&global.host, "POSTGRES_HOST", &file.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match pick(&global.port, "POSTGRES_PORT", &file.port) {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid PostgreSQL port {raw:?}")))?,
            None => DEFAULT_PORT,
        };
        let user = pick(&global.user, "POSTGRES_USER", &file.user);
        let password = pick(&global.password, "POSTGRES_PASSWORD", &file.password);
        let database = pick(&global.database, "POSTGRES_DB", &file.database)
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());
        let workspace = non_empty(namespace_prefix)
            .or_else(|| pick(&global.workspace, "POSTGRES_WORKSPACE", &file.workspace))
            .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string());
        let duplicate_key_policy = match pick(
            &global.duplicate_key_policy,
            "POSTGRES_DUPLICATE_KEY_POLICY",
            &file.duplicate_key_policy,
        ) {
            Some(raw) => raw.parse()?,
            None => DuplicateKeyPolicy::default(),
        };

        let (Some(user), Some(password)) = (user, password) else {
            return Err(Error::Config(
                "Missing database user or password".to_string(),
            ));
        };

        Ok(Self {
            host,
            port,
            user,
            password,
            database,
            workspace: sanitize_identifier(&workspace),
            max_connections: MAX_CONNECTIONS,
            min_connections: MIN_CONNECTIONS,
            duplicate_key_policy,
        })
    }

    /// `host:port/database`, used in connection logs and errors.
    pub fn target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolve a `${VAR}` value from the environment; anything else is literal.
fn expand_placeholder(value: &str, env: &impl Fn(&str) -> Option<String>) -> String {
    if value.starts_with("${") && value.ends_with('}') {
        let var_name = &value[2..value.len() - 1];
        return env(var_name).unwrap_or_default();
    }
    value.to_string()
}

/// Load .env file into environment variables using dotenvy
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_filename("../.env");
    }
}
