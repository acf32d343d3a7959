//! Feature-store boundary and a file-backed implementation of it.
//!
//! A feature group version is one JSON file holding its column layout and
//! rows. Inserts upsert on `(city_name, base_time, forecast_hr)`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt::Debug,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::task::JoinHandle;

use crate::{error::StoreError, model::Batch};

/// Columns that identify a row inside a feature group.
pub const PRIMARY_KEY: &[&str] = &["city_name", "base_time", "forecast_hr"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Block `insert` until the rows are durable.
    pub wait_for_job: bool,
}

#[derive(Debug)]
enum JobState {
    Running(JoinHandle<Result<usize, StoreError>>),
    Finished(usize),
}

/// Handle to a submitted insert.
#[derive(Debug)]
pub struct InsertJob {
    id: u64,
    rows: usize,
    state: JobState,
}

impl InsertJob {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Rows submitted with the job.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            JobState::Running(handle) => handle.is_finished(),
            JobState::Finished(_) => true,
        }
    }

    /// Wait for the write and return how many rows the group now holds.
    pub async fn wait(self) -> Result<usize, StoreError> {
        match self.state {
            JobState::Finished(total) => Ok(total),
            JobState::Running(handle) => handle.await.map_err(|e| StoreError::Job {
                job_id: self.id,
                message: e.to_string(),
            })?,
        }
    }
}

#[async_trait]
pub trait FeatureStore: Send + Sync + Debug {
    async fn get_or_create_feature_group(
        &self,
        name: &str,
        version: u32,
    ) -> Result<Arc<dyn FeatureGroup>, StoreError>;
}

#[async_trait]
pub trait FeatureGroup: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn version(&self) -> u32;

    /// Upsert a batch. With `wait_for_job = false` this returns as soon as
    /// the job is queued.
    async fn insert(&self, batch: &Batch, options: WriteOptions) -> Result<InsertJob, StoreError>;
}

/// On-disk content of one feature group version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredGroup {
    pub name: String,
    pub version: u32,
    pub primary_key: Vec<String>,
    /// Empty until the first insert fixes the layout.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl StoredGroup {
    fn key_positions(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|k| self.columns.iter().position(|c| c == k))
            .collect()
    }

    /// Replace rows with a matching key, append the rest. Returns the row count.
    fn upsert(&mut self, rows: Vec<Vec<Value>>) -> usize {
        let positions = self.key_positions();
        let key_of = |row: &[Value]| -> Vec<Value> {
            positions
                .iter()
                .map(|&p| row.get(p).cloned().unwrap_or(Value::Null))
                .collect()
        };

        let mut index: HashMap<String, usize> = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| (Value::from(key_of(row.as_slice())).to_string(), i))
            .collect();

        for row in rows {
            let key = Value::from(key_of(row.as_slice())).to_string();
            match index.get(&key) {
                Some(&i) => self.rows[i] = row,
                None => {
                    index.insert(key, self.rows.len());
                    self.rows.push(row);
                }
            }
        }
        self.rows.len()
    }
}

/// Stores every feature group as `<root>/<name>_v<version>.json`.
#[derive(Debug)]
pub struct LocalFeatureStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    next_job: Arc<AtomicU64>,
}

impl LocalFeatureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
            next_job: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn group_path(&self, name: &str, version: u32) -> PathBuf {
        self.root.join(format!("{name}_v{version}.json"))
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        match self.locks.lock() {
            Ok(mut locks) => locks.entry(path.to_path_buf()).or_default().clone(),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(path.to_path_buf())
                .or_default()
                .clone(),
        }
    }
}

#[async_trait]
impl FeatureStore for LocalFeatureStore {
    async fn get_or_create_feature_group(
        &self,
        name: &str,
        version: u32,
    ) -> Result<Arc<dyn FeatureGroup>, StoreError> {
        let path = self.group_path(name, version);
        let lock = self.lock_for(&path);

        {
            let _guard = lock.lock().await;
            if !tokio::fs::try_exists(&path).await.map_err(|e| io(&path, e))? {
                tokio::fs::create_dir_all(&self.root)
                    .await
                    .map_err(|e| io(&self.root, e))?;
                let group = StoredGroup {
                    name: name.to_string(),
                    version,
                    primary_key: PRIMARY_KEY.iter().map(|k| k.to_string()).collect(),
                    ..StoredGroup::default()
                };
                write_group(&path, &group).await?;
                tracing::info!(group = name, version, path = %path.display(), "Created feature group");
            }
        }

        Ok(Arc::new(LocalFeatureGroup {
            name: name.to_string(),
            version,
            path,
            lock,
            next_job: self.next_job.clone(),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct LocalFeatureGroup {
    name: String,
    version: u32,
    path: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
    next_job: Arc<AtomicU64>,
}

#[async_trait]
impl FeatureGroup for LocalFeatureGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    async fn insert(&self, batch: &Batch, options: WriteOptions) -> Result<InsertJob, StoreError> {
        let columns: Vec<String> = batch.columns().iter().map(|c| c.to_string()).collect();

        {
            let _guard = self.lock.lock().await;
            let stored = read_group(&self.path).await?;
            check_layout(&stored, &columns)?;
        }

        let id = self.next_job.fetch_add(1, Ordering::SeqCst);
        let rows = batch.rows();
        let submitted = rows.len();
        let group = self.clone();

        tracing::info!(
            job_id = id,
            group = %self.name,
            version = self.version,
            rows = submitted,
            mode = %batch.mode(),
            "Submitted insert job"
        );

        let handle = tokio::spawn(async move {
            let result = group.upsert(columns, rows).await;
            match &result {
                Ok(total) => tracing::info!(job_id = id, total_rows = total, "Insert job finished"),
                Err(e) => tracing::warn!(job_id = id, error = %e, "Insert job failed"),
            }
            result
        });

        let state = if options.wait_for_job {
            let total = handle.await.map_err(|e| StoreError::Job {
                job_id: id,
                message: e.to_string(),
            })??;
            JobState::Finished(total)
        } else {
            JobState::Running(handle)
        };

        Ok(InsertJob {
            id,
            rows: submitted,
            state,
        })
    }
}

impl LocalFeatureGroup {
    async fn upsert(&self, columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;
        let mut stored = read_group(&self.path).await?;
        check_layout(&stored, &columns)?;
        if stored.columns.is_empty() {
            stored.columns = columns;
        }
        let total = stored.upsert(rows);
        write_group(&self.path, &stored).await?;
        Ok(total)
    }

    /// Current content of the group file.
    pub async fn read(&self) -> Result<StoredGroup, StoreError> {
        let _guard = self.lock.lock().await;
        read_group(&self.path).await
    }
}

fn check_layout(stored: &StoredGroup, columns: &[String]) -> Result<(), StoreError> {
    if stored.columns.is_empty() || stored.columns == columns {
        return Ok(());
    }
    Err(StoreError::SchemaMismatch {
        group: format!("{}_v{}", stored.name, stored.version),
        expected: stored.columns.clone(),
        found: columns.to_vec(),
    })
}

fn io(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn read_group(path: &Path) -> Result<StoredGroup, StoreError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Serde {
        path: path.display().to_string(),
        source,
    })
}

/// Write through a temp file so readers never see half a group.
async fn write_group(path: &Path, group: &StoredGroup) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(group).map_err(|source| StoreError::Serde {
        path: path.display().to_string(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await.map_err(|e| io(&tmp, e))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| io(path, e))
}
