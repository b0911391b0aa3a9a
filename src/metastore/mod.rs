//! Storage for simulations, emulations, policies, checkpoints and experiment executions.
//!
//! Records are kept as JSON documents grouped in collections. A backend only
//! implements [`RecordStore`]; every backend gets the typed [`Metastore`] API
//! on top of it.

use crate::error::{Error, Result};
use crate::experiment::ExperimentExecution;
use crate::game::StoppingGameConfig;
use crate::policy::{AlphaVectorsPolicy, MultiThresholdStoppingPolicy, Policy};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const SIMULATIONS: &str = "simulations";
const EMULATIONS: &str = "emulations";
const EXECUTIONS: &str = "experiment_executions";
const MULTI_THRESHOLD_POLICIES: &str = "multi_threshold_stopping_policies";
const ALPHA_VECTORS_POLICIES: &str = "alpha_vectors_policies";
const CHECKPOINTS: &str = "checkpoints";

/// Raw JSON document storage
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces a complete record
    fn put(&self, collection: &str, key: &str, record: &Value) -> Result<()>;

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    /// Allocates the next numeric id of a collection (ids start at 1)
    fn next_id(&self, collection: &str) -> Result<u64>;
}

/// Typed access used by the harness and by programs
pub trait Metastore: Send + Sync {
    fn get_simulation(&self, name: &str) -> Result<Option<StoppingGameConfig>>;
    fn save_simulation(&self, config: &StoppingGameConfig) -> Result<()>;
    /// Emulation definitions are stored as opaque JSON documents
    fn get_emulation(&self, name: &str) -> Result<Option<Value>>;
    fn save_emulation(&self, name: &str, config: &Value) -> Result<()>;
    fn save_experiment_execution(&self, execution: &ExperimentExecution) -> Result<u64>;
    fn get_experiment_execution(&self, id: u64) -> Result<Option<ExperimentExecution>>;
    fn save_multi_threshold_stopping_policy(&self, policy: &MultiThresholdStoppingPolicy) -> Result<u64>;
    fn get_multi_threshold_stopping_policy(&self, id: u64) -> Result<Option<MultiThresholdStoppingPolicy>>;
    fn save_alpha_vectors_policy(&self, policy: &AlphaVectorsPolicy) -> Result<u64>;
    fn get_alpha_vectors_policy(&self, id: u64) -> Result<Option<AlphaVectorsPolicy>>;
    /// Replaces the checkpoint stored under `key` with a complete snapshot
    fn save_checkpoint(&self, key: &str, policy: &MultiThresholdStoppingPolicy) -> Result<()>;
    fn get_checkpoint(&self, key: &str) -> Result<Option<MultiThresholdStoppingPolicy>>;
}

fn decode<T: DeserializeOwned>(value: Option<Value>, what: &str) -> Result<Option<T>> {
    value
        .map(|v| serde_json::from_value(v).map_err(|e| Error::serialization(format!("malformed {}: {}", what, e))))
        .transpose()
}

fn encode<T: Serialize>(record: &T) -> Result<Value> {
    Ok(serde_json::to_value(record)?)
}

impl<S: RecordStore> Metastore for S {
    fn get_simulation(&self, name: &str) -> Result<Option<StoppingGameConfig>> {
        let config: Option<StoppingGameConfig> = decode(self.get(SIMULATIONS, name)?, "simulation")?;
        if let Some(config) = &config {
            config
                .validate()
                .map_err(|e| Error::serialization(format!("malformed simulation `{}`: {}", name, e)))?;
        }
        Ok(config)
    }

    fn save_simulation(&self, config: &StoppingGameConfig) -> Result<()> {
        self.put(SIMULATIONS, &config.name, &encode(config)?)
    }

    fn get_emulation(&self, name: &str) -> Result<Option<Value>> {
        self.get(EMULATIONS, name)
    }

    fn save_emulation(&self, name: &str, config: &Value) -> Result<()> {
        self.put(EMULATIONS, name, config)
    }

    fn save_experiment_execution(&self, execution: &ExperimentExecution) -> Result<u64> {
        let id = self.next_id(EXECUTIONS)?;
        let mut execution = execution.clone();
        execution.id = Some(id);
        self.put(EXECUTIONS, &id.to_string(), &encode(&execution)?)?;
        Ok(id)
    }

    fn get_experiment_execution(&self, id: u64) -> Result<Option<ExperimentExecution>> {
        decode(self.get(EXECUTIONS, &id.to_string())?, "experiment execution")
    }

    fn save_multi_threshold_stopping_policy(&self, policy: &MultiThresholdStoppingPolicy) -> Result<u64> {
        let id = self.next_id(MULTI_THRESHOLD_POLICIES)?;
        let mut policy = policy.clone();
        policy.id = Some(id);
        self.put(MULTI_THRESHOLD_POLICIES, &id.to_string(), &policy.to_dict()?)?;
        Ok(id)
    }

    fn get_multi_threshold_stopping_policy(&self, id: u64) -> Result<Option<MultiThresholdStoppingPolicy>> {
        self.get(MULTI_THRESHOLD_POLICIES, &id.to_string())?
            .map(|d| MultiThresholdStoppingPolicy::from_dict(&d))
            .transpose()
    }

    fn save_alpha_vectors_policy(&self, policy: &AlphaVectorsPolicy) -> Result<u64> {
        let id = self.next_id(ALPHA_VECTORS_POLICIES)?;
        let mut policy = policy.clone();
        policy.id = Some(id);
        self.put(ALPHA_VECTORS_POLICIES, &id.to_string(), &policy.to_dict()?)?;
        Ok(id)
    }

    fn get_alpha_vectors_policy(&self, id: u64) -> Result<Option<AlphaVectorsPolicy>> {
        self.get(ALPHA_VECTORS_POLICIES, &id.to_string())?
            .map(|d| AlphaVectorsPolicy::from_dict(&d))
            .transpose()
    }

    fn save_checkpoint(&self, key: &str, policy: &MultiThresholdStoppingPolicy) -> Result<()> {
        self.put(CHECKPOINTS, key, &policy.to_dict()?)
    }

    fn get_checkpoint(&self, key: &str) -> Result<Option<MultiThresholdStoppingPolicy>> {
        self.get(CHECKPOINTS, key)?
            .map(|d| MultiThresholdStoppingPolicy::from_dict(&d))
            .transpose()
    }
}

/// Process-local metastore
#[derive(Debug, Default)]
pub struct InMemoryMetastore {
    records: Mutex<BTreeMap<(String, String), Value>>,
    ids: Mutex<BTreeMap<String, u64>>,
}

impl InMemoryMetastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a collection
    pub fn len(&self, collection: &str) -> usize {
        self.records.lock().keys().filter(|(c, _)| c == collection).count()
    }
}

impl RecordStore for InMemoryMetastore {
    fn put(&self, collection: &str, key: &str, record: &Value) -> Result<()> {
        self.records
            .lock()
            .insert((collection.to_string(), key.to_string()), record.clone());
        Ok(())
    }

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .records
            .lock()
            .get(&(collection.to_string(), key.to_string()))
            .cloned())
    }

    fn next_id(&self, collection: &str) -> Result<u64> {
        let mut ids = self.ids.lock();
        let id = ids.entry(collection.to_string()).or_insert(0);
        *id += 1;
        Ok(*id)
    }
}

/// One pretty-printed JSON file per record under `root/<collection>/<key>.json`.
///
/// Records are written to a temporary file in the same directory and renamed
/// into place, so readers never observe a partial record.
#[derive(Debug)]
pub struct JsonFileMetastore {
    root: PathBuf,
    ids: Mutex<()>,
}

impl JsonFileMetastore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            ids: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys are percent-encoded, so distinct keys map to distinct files
    fn record_path(&self, collection: &str, key: &str) -> PathBuf {
        self.root
            .join(collection)
            .join(format!("{}.json", urlencoding::encode(key)))
    }
}

static TEMP_FILES: AtomicU64 = AtomicU64::new(0);

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::serialization(format!("path has no parent: {}", path.display())))?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let unique = TEMP_FILES.fetch_add(1, Ordering::Relaxed);
    let temp_path = parent.join(format!(".tmp_{}_{}_{}", std::process::id(), unique, file_name));

    let mut file = fs::File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

impl RecordStore for JsonFileMetastore {
    fn put(&self, collection: &str, key: &str, record: &Value) -> Result<()> {
        let path = self.record_path(collection, key);
        atomic_write(&path, serde_json::to_string_pretty(record)?.as_bytes())
    }

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let path = self.record_path(collection, key);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        // a reserved id holds `null` until its record is written
        let value: Value = serde_json::from_str(&json)?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    fn next_id(&self, collection: &str) -> Result<u64> {
        let _guard = self.ids.lock();
        let dir = self.root.join(collection);
        fs::create_dir_all(&dir)?;
        let mut max_id = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                max_id = max_id.max(id);
            }
        }
        let id = max_id + 1;
        // reserve the id so concurrent writers do not reuse it
        atomic_write(&dir.join(format!("{}.json", id)), b"null")?;
        Ok(id)
    }
}
