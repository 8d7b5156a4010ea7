//! On-disk cache for id maps and schema metadata, plus session ids.
//!
//! Each target connection gets its own directory named by the hash of
//! its identity, so caches from different servers never collide. Two
//! kinds of entries exist per model: an id map (external key to target
//! key, a two-column CSV) and the introspected field definitions
//! (JSON). Files are created lazily, read on every run and never
//! invalidated automatically; staleness is an accepted risk.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::FlowError;
use crate::rpc::{ConnectionConfig, FieldDef};

pub struct CacheStore {
    dir: PathBuf,
    // Avoids re-reading id-map files within one run.
    id_maps: DashMap<String, Arc<HashMap<String, i64>>>,
}

impl CacheStore {
    /// Opens (creating if needed) the cache directory for one target
    /// connection under `root`.
    pub fn open(root: impl AsRef<Path>, config: &ConnectionConfig) -> Result<Self, FlowError> {
        let dir = root.as_ref().join(config.identity_hash());
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            id_maps: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn id_map_path(&self, model: &str) -> PathBuf {
        self.dir.join(format!("{model}.id_map.csv"))
    }

    fn fields_path(&self, model: &str) -> PathBuf {
        self.dir.join(format!("{model}.fields.json"))
    }

    /// Persists an id map for a model, replacing any previous entry.
    /// Empty maps are not written.
    pub fn save_id_map(&self, model: &str, map: &HashMap<String, i64>) -> Result<(), FlowError> {
        if map.is_empty() {
            return Ok(());
        }
        let path = self.id_map_path(model);
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["external_id", "target_id"])?;
        let mut entries: Vec<_> = map.iter().collect();
        entries.sort();
        for (key, id) in entries {
            writer.write_record([key.as_str(), id.to_string().as_str()])?;
        }
        writer.flush()?;
        self.id_maps
            .insert(model.to_string(), Arc::new(map.clone()));
        log::info!(
            "saved id map for model '{model}' to cache ({} entries)",
            map.len()
        );
        Ok(())
    }

    /// Loads an id map for a model. A missing file is a cache miss, not
    /// an error; an unreadable file degrades to a miss with a log entry.
    pub fn load_id_map(&self, model: &str) -> Option<Arc<HashMap<String, i64>>> {
        if let Some(hit) = self.id_maps.get(model) {
            return Some(hit.value().clone());
        }
        let path = self.id_map_path(model);
        if !path.exists() {
            log::debug!("no cached id map for model '{model}'");
            return None;
        }
        match read_id_map(&path) {
            Ok(map) => {
                log::info!(
                    "loaded id map for model '{model}' from cache ({} entries)",
                    map.len()
                );
                let map = Arc::new(map);
                self.id_maps.insert(model.to_string(), map.clone());
                Some(map)
            }
            Err(err) => {
                log::error!("failed to load cached id map for model '{model}': {err}");
                None
            }
        }
    }

    /// Persists introspected field definitions for a model.
    pub fn save_fields(
        &self,
        model: &str,
        fields: &HashMap<String, FieldDef>,
    ) -> Result<(), FlowError> {
        if fields.is_empty() {
            return Ok(());
        }
        let path = self.fields_path(model);
        let file = fs::File::create(&path)?;
        serde_json::to_writer_pretty(file, fields)
            .map_err(|err| FlowError::Cache(std::io::Error::other(err)))?;
        log::info!("saved schema metadata for model '{model}' to cache");
        Ok(())
    }

    /// Loads cached field definitions for a model, if present.
    pub fn load_fields(&self, model: &str) -> Option<HashMap<String, FieldDef>> {
        let path = self.fields_path(model);
        if !path.exists() {
            return None;
        }
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                log::error!("failed to open schema cache for model '{model}': {err}");
                return None;
            }
        };
        match serde_json::from_reader(file) {
            Ok(fields) => {
                log::info!("loaded schema metadata for model '{model}' from cache");
                Some(fields)
            }
            Err(err) => {
                log::error!("failed to parse schema cache for model '{model}': {err}");
                None
            }
        }
    }

    /// Working directory for a resumable session, created on first use.
    pub fn session_dir(&self, session_id: &str) -> Result<PathBuf, FlowError> {
        let dir = self.dir.join("sessions").join(session_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn read_id_map(path: &Path) -> Result<HashMap<String, i64>, FlowError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut map = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let key = record.get(0).unwrap_or_default();
        let id = record
            .get(1)
            .unwrap_or_default()
            .parse::<i64>()
            .map_err(|_| {
                FlowError::Cache(std::io::Error::other(format!(
                    "corrupt id map entry for key '{key}'"
                )))
            })?;
        map.insert(key.to_string(), id);
    }
    Ok(map)
}

/// Deterministic, order-independent identifier for a resumable run.
///
/// Domain terms are compared by their serialized form, which also gives
/// heterogeneous term lists a stable order instead of failing. Field
/// order does not matter either.
pub fn generate_session_id(model: &str, domain: &[Value], fields: &[String]) -> String {
    let mut terms: Vec<String> = domain.iter().map(Value::to_string).collect();
    terms.sort();
    let mut sorted_fields: Vec<&String> = fields.iter().collect();
    sorted_fields.sort();

    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    for term in &terms {
        hasher.update([0u8]);
        hasher.update(term.as_bytes());
    }
    for field in sorted_fields {
        hasher.update([1u8]);
        hasher.update(field.as_bytes());
    }
    let digest: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    digest[..16].to_string()
}
