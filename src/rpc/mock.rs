//! Scripted in-memory [`ObjectClient`] for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use super::{FieldDef, JsonMap, LoadMessage, LoadResult, ObjectClient, RpcError};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Create { model: String },
    Load { model: String, rows: usize, columns: usize },
    Write { model: String, ids: Vec<i64> },
    Search { model: String },
    FieldsGet { model: String },
    Resolve { keys: Vec<String> },
}

/// In-memory server with scripted faults and a call log.
#[derive(Default)]
pub(crate) struct MockServer {
    fields: HashMap<String, HashMap<String, FieldDef>>,
    external_registry: HashMap<String, i64>,
    /// Every `load` call fails with this fault.
    load_fault: Option<String>,
    /// `load` fails with this fault while the submitted chunk is larger
    /// than the limit.
    load_fault_above: Option<(usize, String)>,
    /// `load` responds with embedded messages instead of ids.
    load_messages: Vec<String>,
    /// `create` fails when any value equals the key.
    create_faults: HashMap<String, String>,
    /// `write` fails when the id set intersects these.
    write_fault_ids: HashSet<i64>,
    next_id: AtomicI64,
    calls: Mutex<Vec<Call>>,
    created: Mutex<Vec<(String, JsonMap)>>,
    written: Mutex<Vec<(String, Vec<i64>, JsonMap)>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: &str, fields: &[(&str, FieldDef)]) -> Self {
        let entry = self.fields.entry(model.to_string()).or_default();
        for (name, def) in fields {
            entry.insert(name.to_string(), def.clone());
        }
        self
    }

    pub fn with_external(mut self, key: &str, id: i64) -> Self {
        self.external_registry.insert(key.to_string(), id);
        self
    }

    pub fn with_load_fault(mut self, message: &str) -> Self {
        self.load_fault = Some(message.to_string());
        self
    }

    pub fn with_load_fault_above(mut self, limit: usize, message: &str) -> Self {
        self.load_fault_above = Some((limit, message.to_string()));
        self
    }

    pub fn with_load_messages(mut self, messages: &[&str]) -> Self {
        self.load_messages = messages.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_create_fault(mut self, value: &str, message: &str) -> Self {
        self.create_faults
            .insert(value.to_string(), message.to_string());
        self
    }

    pub fn with_write_fault_id(mut self, id: i64) -> Self {
        self.write_fault_ids.insert(id);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn created(&self) -> Vec<(String, JsonMap)> {
        self.created.lock().clone()
    }

    pub fn written(&self) -> Vec<(String, Vec<i64>, JsonMap)> {
        self.written.lock().clone()
    }

    pub fn resolve_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Resolve { keys } => Some(keys),
                _ => None,
            })
            .collect()
    }

    fn allocate(&self, count: usize) -> Vec<i64> {
        let start = self.next_id.fetch_add(count as i64, Ordering::Relaxed);
        (start..start + count as i64).collect()
    }
}

impl ObjectClient for MockServer {
    fn create(
        &self,
        model: &str,
        values: &JsonMap,
    ) -> impl Future<Output = Result<i64, RpcError>> + Send {
        async move {
            self.calls.lock().push(Call::Create {
                model: model.to_string(),
            });
            for value in values.values() {
                if let Some(text) = value.as_str() {
                    if let Some(fault) = self.create_faults.get(text) {
                        return Err(RpcError::Fault(fault.clone()));
                    }
                }
            }
            let id = self.allocate(1)[0];
            self.created.lock().push((model.to_string(), values.clone()));
            Ok(id)
        }
    }

    fn load(
        &self,
        model: &str,
        header: &[String],
        rows: &[Vec<String>],
    ) -> impl Future<Output = Result<LoadResult, RpcError>> + Send {
        async move {
            self.calls.lock().push(Call::Load {
                model: model.to_string(),
                rows: rows.len(),
                columns: header.len(),
            });
            if let Some(fault) = &self.load_fault {
                return Err(RpcError::Fault(fault.clone()));
            }
            if let Some((limit, fault)) = &self.load_fault_above {
                if rows.len() > *limit {
                    return Err(RpcError::Fault(fault.clone()));
                }
            }
            if !self.load_messages.is_empty() {
                return Ok(LoadResult {
                    ids: Vec::new(),
                    messages: self
                        .load_messages
                        .iter()
                        .map(|message| LoadMessage {
                            message: message.clone(),
                            ..Default::default()
                        })
                        .collect(),
                });
            }
            Ok(LoadResult {
                ids: self.allocate(rows.len()),
                messages: Vec::new(),
            })
        }
    }

    fn write(
        &self,
        model: &str,
        ids: &[i64],
        values: &JsonMap,
    ) -> impl Future<Output = Result<bool, RpcError>> + Send {
        async move {
            self.calls.lock().push(Call::Write {
                model: model.to_string(),
                ids: ids.to_vec(),
            });
            if ids.iter().any(|id| self.write_fault_ids.contains(id)) {
                return Err(RpcError::Fault("write rejected".to_string()));
            }
            self.written
                .lock()
                .push((model.to_string(), ids.to_vec(), values.clone()));
            Ok(true)
        }
    }

    fn search(
        &self,
        model: &str,
        _domain: &Value,
    ) -> impl Future<Output = Result<Vec<i64>, RpcError>> + Send {
        async move {
            self.calls.lock().push(Call::Search {
                model: model.to_string(),
            });
            Ok(Vec::new())
        }
    }

    fn fields_get(
        &self,
        model: &str,
    ) -> impl Future<Output = Result<HashMap<String, FieldDef>, RpcError>> + Send {
        async move {
            self.calls.lock().push(Call::FieldsGet {
                model: model.to_string(),
            });
            Ok(self.fields.get(model).cloned().unwrap_or_default())
        }
    }

    fn resolve_external_keys(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<HashMap<String, i64>, RpcError>> + Send {
        async move {
            self.calls.lock().push(Call::Resolve {
                keys: keys.to_vec(),
            });
            Ok(keys
                .iter()
                .filter_map(|key| self.external_registry.get(key).map(|id| (key.clone(), *id)))
                .collect())
        }
    }
}
