//! HTTP JSON-RPC implementation of [`ObjectClient`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};

use super::{
    ConnectionConfig, FieldDef, JsonMap, LoadMessage, LoadResult, ObjectClient, RpcError, RpcPool,
};
use crate::error::FlowError;

/// Registry model resolving external keys to record ids.
const KEY_REGISTRY_MODEL: &str = "ir.model.data";

/// A connected JSON-RPC client. Cheap to share between workers; the
/// underlying HTTP client multiplexes connections and is safe for
/// concurrent use.
pub struct JsonRpcClient {
    http: reqwest::Client,
    endpoint: String,
    database: String,
    password: String,
    uid: i64,
    context: Option<JsonMap>,
    call_id: AtomicU64,
}

impl JsonRpcClient {
    /// Authenticates against the target server. A failed handshake is
    /// fatal for the run and leaves no trace in any cache.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, RpcError> {
        let http = reqwest::Client::new();
        let endpoint = config.endpoint();
        log::debug!("authenticating against {endpoint} as '{}'", config.login);

        let result = raw_call(
            &http,
            &endpoint,
            1,
            "common",
            "login",
            json!([config.database, config.login, config.password]),
        )
        .await?;

        let uid = result.as_i64().filter(|uid| *uid > 0).ok_or_else(|| {
            RpcError::Authentication {
                login: config.login.clone(),
                database: config.database.clone(),
            }
        })?;

        log::info!(
            "connected to {}:{} database '{}' (uid {uid})",
            config.hostname,
            config.port,
            config.database
        );

        Ok(Self {
            http,
            endpoint,
            database: config.database.clone(),
            password: config.password.clone(),
            uid,
            context: None,
            call_id: AtomicU64::new(2),
        })
    }

    /// Sets a context object sent with every call (for example to
    /// disable server-side change tracking during imports).
    pub fn with_context(mut self, context: JsonMap) -> Self {
        self.context = Some(context);
        self
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Value,
        mut kwargs: JsonMap,
    ) -> Result<Value, RpcError> {
        if let Some(context) = &self.context {
            kwargs
                .entry("context".to_string())
                .or_insert_with(|| Value::Object(context.clone()));
        }
        let id = self.call_id.fetch_add(1, Ordering::Relaxed);
        raw_call(
            &self.http,
            &self.endpoint,
            id,
            "object",
            "execute_kw",
            json!([
                self.database,
                self.uid,
                self.password,
                model,
                method,
                args,
                Value::Object(kwargs)
            ]),
        )
        .await
    }
}

impl RpcPool<JsonRpcClient> {
    /// Opens `size` authenticated connections against one target. A
    /// failed handshake is fatal for the run and leaves every cache
    /// untouched.
    pub async fn connect(config: &ConnectionConfig, size: usize) -> Result<Self, FlowError> {
        if size < 1 {
            return Err(FlowError::Configuration(
                "connection pool size must be a positive integer".to_string(),
            ));
        }
        let mut clients = Vec::with_capacity(size);
        for _ in 0..size {
            let client = JsonRpcClient::connect(config)
                .await
                .map_err(|err| FlowError::Connection(err.to_string()))?;
            clients.push(Arc::new(client));
        }
        Self::from_shared(clients)
    }
}

async fn raw_call(
    http: &reqwest::Client,
    endpoint: &str,
    id: u64,
    service: &str,
    method: &str,
    args: Value,
) -> Result<Value, RpcError> {
    let payload = json!({
        "jsonrpc": "2.0",
        "method": "call",
        "id": id,
        "params": { "service": service, "method": method, "args": args },
    });

    let response = http
        .post(endpoint)
        .json(&payload)
        .send()
        .await?
        .error_for_status()?;
    let body: Value = response.json().await?;

    if let Some(error) = body.get("error") {
        return Err(RpcError::Fault(extract_fault(error)));
    }
    Ok(body.get("result").cloned().unwrap_or(Value::Null))
}

/// Pulls the meaningful message out of a server error payload. Fault
/// bodies nest the human-readable text under `data.message`; anything
/// else falls back to the top-level message or the raw payload.
pub(crate) fn extract_fault(error: &Value) -> String {
    error
        .pointer("/data/message")
        .and_then(Value::as_str)
        .or_else(|| error.get("message").and_then(Value::as_str))
        .map(|message| message.trim().replace('\n', " "))
        .unwrap_or_else(|| error.to_string())
}

fn parse_load_result(value: Value) -> LoadResult {
    // Failed loads report `ids: false`, so both fields parse leniently.
    let ids = value
        .get("ids")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default();
    let messages = value
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .map(|entry| LoadMessage {
                    message: entry
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("batch load failed")
                        .to_string(),
                    field: entry
                        .get("field")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    record: entry.get("record").and_then(Value::as_i64),
                })
                .collect()
        })
        .unwrap_or_default();
    LoadResult { ids, messages }
}

impl ObjectClient for JsonRpcClient {
    fn create(
        &self,
        model: &str,
        values: &JsonMap,
    ) -> impl Future<Output = Result<i64, RpcError>> + Send {
        async move {
            let result = self
                .execute_kw(model, "create", json!([values]), JsonMap::new())
                .await?;
            result
                .as_i64()
                .or_else(|| result.get(0).and_then(Value::as_i64))
                .ok_or_else(|| {
                    RpcError::Malformed(format!("create on '{model}' returned no id: {result}"))
                })
        }
    }

    fn load(
        &self,
        model: &str,
        header: &[String],
        rows: &[Vec<String>],
    ) -> impl Future<Output = Result<LoadResult, RpcError>> + Send {
        async move {
            let result = self
                .execute_kw(model, "load", json!([header, rows]), JsonMap::new())
                .await?;
            Ok(parse_load_result(result))
        }
    }

    fn write(
        &self,
        model: &str,
        ids: &[i64],
        values: &JsonMap,
    ) -> impl Future<Output = Result<bool, RpcError>> + Send {
        async move {
            let result = self
                .execute_kw(model, "write", json!([ids, values]), JsonMap::new())
                .await?;
            Ok(result.as_bool().unwrap_or(true))
        }
    }

    fn search(
        &self,
        model: &str,
        domain: &Value,
    ) -> impl Future<Output = Result<Vec<i64>, RpcError>> + Send {
        async move {
            let result = self
                .execute_kw(model, "search", json!([domain]), JsonMap::new())
                .await?;
            result
                .as_array()
                .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
                .ok_or_else(|| {
                    RpcError::Malformed(format!("search on '{model}' returned no id list"))
                })
        }
    }

    fn fields_get(
        &self,
        model: &str,
    ) -> impl Future<Output = Result<HashMap<String, FieldDef>, RpcError>> + Send {
        async move {
            let mut kwargs = JsonMap::new();
            kwargs.insert(
                "attributes".to_string(),
                json!(["type", "relation", "relation_table", "relation_field", "required"]),
            );
            let result = self.execute_kw(model, "fields_get", json!([]), kwargs).await?;
            let entries = result.as_object().ok_or_else(|| {
                RpcError::Malformed(format!("fields_get on '{model}' returned no object"))
            })?;

            let mut schema = HashMap::with_capacity(entries.len());
            for (name, value) in entries {
                match serde_json::from_value::<FieldDef>(value.clone()) {
                    Ok(def) => {
                        schema.insert(name.clone(), def);
                    }
                    Err(err) => {
                        log::warn!("skipping unparsable field definition '{name}': {err}");
                    }
                }
            }
            Ok(schema)
        }
    }

    fn resolve_external_keys(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<HashMap<String, i64>, RpcError>> + Send {
        async move {
            // Full keys use 'module.identifier' form; anything without a
            // separator cannot be resolved remotely.
            let pairs: Vec<(&str, &str)> =
                keys.iter().filter_map(|key| key.split_once('.')).collect();
            let invalid = keys.len() - pairs.len();
            if invalid > 0 {
                log::warn!(
                    "skipping {invalid} external keys without a 'module.identifier' form"
                );
            }
            if pairs.is_empty() {
                return Ok(HashMap::new());
            }

            // Prefix-notation OR over per-key (module AND name) terms.
            let mut domain: Vec<Value> = Vec::with_capacity(pairs.len() * 3 + pairs.len() - 1);
            for _ in 1..pairs.len() {
                domain.push(json!("|"));
            }
            for (module, name) in &pairs {
                domain.push(json!("&"));
                domain.push(json!(["module", "=", module]));
                domain.push(json!(["name", "=", name]));
            }

            let result = self
                .execute_kw(
                    KEY_REGISTRY_MODEL,
                    "search_read",
                    json!([domain, ["module", "name", "res_id"]]),
                    JsonMap::new(),
                )
                .await?;
            let records = result.as_array().ok_or_else(|| {
                RpcError::Malformed("external key lookup returned no record list".to_string())
            })?;

            let mut resolved = HashMap::new();
            for record in records {
                let module = record.get("module").and_then(Value::as_str);
                let name = record.get("name").and_then(Value::as_str);
                let res_id = record.get("res_id").and_then(Value::as_i64);
                if let (Some(module), Some(name), Some(res_id)) = (module, name, res_id) {
                    resolved.insert(format!("{module}.{name}"), res_id);
                }
            }
            log::debug!("resolved {} of {} external keys remotely", resolved.len(), keys.len());
            Ok(resolved)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_extraction_prefers_nested_message() {
        let error = json!({
            "code": 200,
            "message": "Odoo Server Error",
            "data": { "message": "duplicate key value\nviolates constraint" }
        });
        assert_eq!(
            extract_fault(&error),
            "duplicate key value violates constraint"
        );

        let flat = json!({ "message": "  gateway timeout  " });
        assert_eq!(extract_fault(&flat), "gateway timeout");
    }

    #[test]
    fn load_result_parses_leniently() {
        let ok = parse_load_result(json!({ "ids": [5, 6], "messages": [] }));
        assert_eq!(ok.ids, vec![5, 6]);
        assert!(ok.is_complete(2));

        let failed = parse_load_result(json!({
            "ids": false,
            "messages": [{ "message": "missing required field", "record": 0 }]
        }));
        assert!(failed.ids.is_empty());
        assert_eq!(failed.messages[0].message, "missing required field");
        assert!(!failed.is_complete(2));
    }
}
