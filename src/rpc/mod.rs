//! Remote object-RPC surface.
//!
//! The engine consumes a small set of verbs on a business-object store:
//! `create`, bulk `load`, multi-id `write`, `search`, schema
//! introspection via `fields_get`, and an external-key lookup resolving
//! stable identifiers to target-side numeric keys. [`ObjectClient`] is
//! the seam; [`client::JsonRpcClient`] implements it over HTTP JSON-RPC
//! and the tests script it in memory.

pub mod client;
#[cfg(test)]
pub(crate) mod mock;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::FlowError;

/// JSON object payload for `create`/`write` values.
pub type JsonMap = serde_json::Map<String, Value>;

/// Connection settings for one target server. The (hostname, port,
/// database) triple is the connection's identity: caches from different
/// targets never collide because the cache directory is named after its
/// hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub database: String,
    pub login: String,
    pub password: String,
    #[serde(default)]
    pub https: bool,
}

impl ConnectionConfig {
    pub fn endpoint(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{}:{}/jsonrpc", self.hostname, self.port)
    }

    /// Stable hash of the connection identity, used as the cache
    /// directory name.
    pub fn identity_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.hostname.as_bytes());
        hasher.update(self.port.to_string().as_bytes());
        hasher.update(self.database.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Transport and server-side faults raised by RPC calls.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with an error payload; the embedded message is
    /// carried verbatim.
    #[error("server fault: {0}")]
    Fault(String),

    #[error("authentication failed for '{login}' on database '{database}'")]
    Authentication { login: String, database: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// True when the fault looks like a proxy or memory problem that a
    /// smaller payload may get past (gateway timeouts, 502s, out of
    /// memory). Those are retried with halved chunks before any
    /// per-record fallback.
    pub fn is_scalable_fault(&self) -> bool {
        if let RpcError::Transport(err) = self {
            if err.is_timeout() {
                return true;
            }
        }
        is_scalable_text(&self.to_string())
    }
}

pub(crate) fn is_scalable_text(text: &str) -> bool {
    let text = text.to_lowercase();
    ["memory", "502", "gateway", "proxy", "timeout"]
        .iter()
        .any(|needle| text.contains(needle))
}

/// Field type as reported by schema introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Char,
    Text,
    Html,
    Integer,
    Float,
    Monetary,
    Boolean,
    Date,
    Datetime,
    Selection,
    Binary,
    Many2one,
    Many2many,
    One2many,
    #[serde(other)]
    Other,
}

/// Field metadata returned by `fields_get`. Relation metadata may be
/// absent even for relational fields; the planner derives it by
/// convention when missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_field: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl FieldDef {
    pub fn scalar(kind: FieldKind) -> Self {
        Self {
            kind,
            relation: None,
            relation_table: None,
            relation_field: None,
            required: false,
        }
    }

    pub fn many2one(relation: &str) -> Self {
        Self {
            relation: Some(relation.to_string()),
            ..Self::scalar(FieldKind::Many2one)
        }
    }

    pub fn many2many(relation: &str) -> Self {
        Self {
            relation: Some(relation.to_string()),
            ..Self::scalar(FieldKind::Many2many)
        }
    }

    pub fn one2many(relation: &str, relation_field: &str) -> Self {
        Self {
            relation: Some(relation.to_string()),
            relation_field: Some(relation_field.to_string()),
            ..Self::scalar(FieldKind::One2many)
        }
    }
}

/// One diagnostic entry embedded in a bulk load response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadMessage {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<i64>,
}

/// Result of a bulk `load` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadResult {
    pub ids: Vec<i64>,
    pub messages: Vec<LoadMessage>,
}

impl LoadResult {
    /// The bit-exact success contract: a load is complete only when the
    /// response carries no messages and returned exactly one key per
    /// submitted row.
    pub fn is_complete(&self, submitted: usize) -> bool {
        self.messages.is_empty() && self.ids.len() == submitted
    }
}

/// The remote verbs the engine depends on. Implementations must be safe
/// for concurrent use; workers share handles through [`RpcPool`].
pub trait ObjectClient: Send + Sync {
    /// Creates one record, returning its target-side numeric key.
    fn create(
        &self,
        model: &str,
        values: &JsonMap,
    ) -> impl Future<Output = Result<i64, RpcError>> + Send;

    /// Bulk-creates records through the generic load path.
    fn load(
        &self,
        model: &str,
        header: &[String],
        rows: &[Vec<String>],
    ) -> impl Future<Output = Result<LoadResult, RpcError>> + Send;

    /// Applies the same values to every record in `ids`.
    fn write(
        &self,
        model: &str,
        ids: &[i64],
        values: &JsonMap,
    ) -> impl Future<Output = Result<bool, RpcError>> + Send;

    /// Returns the ids matching a search domain.
    fn search(
        &self,
        model: &str,
        domain: &Value,
    ) -> impl Future<Output = Result<Vec<i64>, RpcError>> + Send;

    /// Schema introspection for one model.
    fn fields_get(
        &self,
        model: &str,
    ) -> impl Future<Output = Result<HashMap<String, FieldDef>, RpcError>> + Send;

    /// Resolves stable external keys to target-side numeric keys. Keys
    /// unknown to the server are simply absent from the returned map.
    fn resolve_external_keys(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<HashMap<String, i64>, RpcError>> + Send;
}

/// Caller-owned set of connection handles, handed to workers round-robin.
///
/// The engine never opens connections itself; whoever drives a run
/// decides how many handles exist and passes the pool in.
pub struct RpcPool<C> {
    clients: Vec<Arc<C>>,
    cursor: AtomicUsize,
}

impl<C> RpcPool<C> {
    pub fn new(clients: Vec<C>) -> Result<Self, FlowError> {
        Self::from_shared(clients.into_iter().map(Arc::new).collect())
    }

    pub fn from_shared(clients: Vec<Arc<C>>) -> Result<Self, FlowError> {
        if clients.is_empty() {
            return Err(FlowError::Configuration(
                "connection pool must hold at least one client".to_string(),
            ));
        }
        Ok(Self {
            clients,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn single(client: C) -> Self {
        Self {
            clients: vec![Arc::new(client)],
            cursor: AtomicUsize::new(0),
        }
    }

    /// Next handle, round-robin. Plain rotation, no load balancing.
    pub fn get(&self) -> Arc<C> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        self.clients[index].clone()
    }

    pub fn size(&self) -> usize {
        self.clients.len()
    }
}
