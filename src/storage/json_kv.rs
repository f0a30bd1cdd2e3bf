//! File-backed KV storage.
//!
//! Keeps the whole namespace in memory and writes it to
//! `{working_dir}/kv_store_{namespace}.json` on [`KvStorage::index_done_callback`].
//! Upserts replace the record for an id, except cache records, which gain
//! the incoming modes and keep the others.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{KvRecord, KvStorage};
use crate::config::GlobalConfig;
use crate::error::{Error, Result};
use crate::namespace::Namespace;

pub struct JsonKvStorage {
    namespace: Namespace,
    file_path: PathBuf,
    data: RwLock<BTreeMap<String, KvRecord>>,
}

impl JsonKvStorage {
    pub fn new(namespace: &str, global_config: &GlobalConfig) -> Result<Self> {
        let namespace = Namespace::parse(namespace)?;
        if !namespace.kind().is_kv() {
            return Err(Error::UnsupportedNamespace(namespace.name().to_string()));
        }

        let file_path = global_config
            .working_dir
            .join(format!("kv_store_{}.json", namespace.name()));
        let data = load_json(&file_path)?;
        info!(namespace = %namespace, "Load KV {} with {} data", namespace, data.len());

        Ok(Self {
            namespace,
            file_path,
            data: RwLock::new(data),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    fn check_kind(&self, record: &KvRecord) -> Result<()> {
        if record.kind() != self.namespace.kind() {
            return Err(Error::InvalidArgument(format!(
                "{} record cannot be stored in namespace {}",
                record.kind(),
                self.namespace
            )));
        }
        Ok(())
    }
}

fn load_json(path: &Path) -> Result<BTreeMap<String, KvRecord>> {
    match fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(err.into()),
    }
}

/// Replace `path` with `bytes` while holding an exclusive lock on
/// `path.lock`. The data goes to `path.tmp` first and is renamed over `path`,
/// so a reader never sees a truncated file.
fn write_locked(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let lock_path = path.with_extension("json.lock");
    let lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    lock_file.lock_exclusive()?;

    let tmp_path = path.with_extension("json.tmp");
    let result = File::create(&tmp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp_path, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }

    let unlocked = lock_file.unlock();
    result?;
    unlocked?;
    Ok(())
}

#[async_trait]
impl KvStorage for JsonKvStorage {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<KvRecord>> {
        Ok(self.data.read().await.get(id).cloned())
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<KvRecord>>> {
        let data = self.data.read().await;
        Ok(ids.iter().map(|id| data.get(id).cloned()).collect())
    }

    async fn filter_keys(&self, keys: &HashSet<String>) -> Result<HashSet<String>> {
        let data = self.data.read().await;
        Ok(keys
            .iter()
            .filter(|key| !data.contains_key(*key))
            .cloned()
            .collect())
    }

    async fn upsert(&self, data: HashMap<String, KvRecord>) -> Result<()> {
        info!(namespace = %self.namespace, "Inserting {} to {}", data.len(), self.namespace);
        if data.is_empty() {
            return Ok(());
        }
        for record in data.values() {
            self.check_kind(record)?;
        }

        let mut stored = self.data.write().await;
        for (id, record) in data {
            match record {
                // One answer per (mode, id): new modes join the ones already cached.
                KvRecord::Cache(modes) => {
                    let slot = stored
                        .entry(id)
                        .or_insert_with(|| KvRecord::Cache(BTreeMap::new()));
                    if let KvRecord::Cache(existing) = slot {
                        existing.extend(modes);
                    }
                }
                other => {
                    stored.insert(id, other);
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        {
            let mut stored = self.data.write().await;
            for id in ids {
                stored.remove(id);
            }
        }
        self.index_done_callback().await
    }

    async fn index_done_callback(&self) -> Result<()> {
        let bytes = {
            let data = self.data.read().await;
            serde_json::to_vec_pretty(&*data)?
        };
        let path = self.file_path.clone();
        debug!(path = %path.display(), "Writing KV store");

        tokio::task::spawn_blocking(move || write_locked(&path, &bytes))
            .await
            .map_err(|err| Error::Io(std::io::Error::other(err)))?
    }

    async fn drop_storage(&self) -> Result<()> {
        self.data.write().await.clear();
        match fs::remove_file(&self.file_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
