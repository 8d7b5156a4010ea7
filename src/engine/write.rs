//! Standalone batch write engine for pure update workloads.
//!
//! Rows carry the numeric id column plus the columns to update. Within
//! each batch, rows with identical value tuples collapse into a single
//! multi-id write call, exploiting the common case where many records
//! receive the same new values (a status flip across a cohort).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::dataset::{Dataset, FailRecord, number_batches};
use crate::engine::fail::{FailFile, clean_fault_message};
use crate::error::FlowError;
use crate::pool::{PoolEvent, WorkerPool};
use crate::rpc::{JsonMap, ObjectClient, RpcPool};

#[derive(Debug, Default)]
pub struct WriteOutcome {
    pub processed: usize,
    pub updated: usize,
    pub fail_records: Vec<FailRecord>,
    pub aborted: bool,
}

impl WriteOutcome {
    pub fn success(&self) -> bool {
        !self.aborted && self.fail_records.is_empty()
    }
}

struct WriteBatchReturn {
    seq: usize,
    updated: usize,
    fail_records: Vec<FailRecord>,
}

/// Runs the update path: group, write, expand failures. A batch whose
/// grouping step itself fails (missing or unparsable id column) is
/// reported as a whole-batch failure, never dropped.
pub async fn run_batch_write<C>(
    rpc: &RpcPool<C>,
    model: &str,
    dataset: &Dataset,
    batch_size: usize,
    max_connection: usize,
    fail_file: Option<&FailFile>,
) -> Result<WriteOutcome, FlowError>
where
    C: ObjectClient + 'static,
{
    let batches = number_batches(&dataset.rows, batch_size);
    let total_batches = batches.len();
    log::info!(
        "writing {} update rows to '{model}' in {total_batches} batches",
        dataset.rows.len()
    );

    let header = Arc::new(dataset.header.clone());
    let mut pool = WorkerPool::new(max_connection)?;
    let abort = pool.abort_flag();

    for (seq, batch) in batches {
        let client = rpc.get();
        let model = model.to_string();
        let header = header.clone();
        let abort = abort.clone();
        let accepted = pool.submit(async move {
            let mut updated = 0usize;
            let mut fail_records = Vec::new();
            match group_rows(&header, &batch) {
                Err(reason) => {
                    log::error!("batch {seq}: grouping failed: {reason}");
                    for row in &batch {
                        fail_records.push(FailRecord::new(row.clone(), reason.clone()));
                    }
                }
                Ok(groups) => {
                    log::debug!(
                        "batch {seq}: grouped {} rows into {} write calls",
                        batch.len(),
                        groups.len()
                    );
                    let row_by_id: HashMap<i64, &Vec<String>> = batch
                        .iter()
                        .filter_map(|row| {
                            id_of(&header, row).map(|id| (id, row))
                        })
                        .collect();
                    for (values, ids) in groups {
                        if abort.is_set() {
                            break;
                        }
                        match client.write(&model, &ids, &values).await {
                            Ok(_) => {
                                log::debug!(
                                    "batch {seq}: updated {} records with shared values",
                                    ids.len()
                                );
                                updated += ids.len();
                            }
                            Err(err) => {
                                let reason = clean_fault_message(&err.to_string());
                                log::error!(
                                    "batch {seq}: write for {} records failed: {reason}",
                                    ids.len()
                                );
                                for id in ids {
                                    if let Some(row) = row_by_id.get(&id) {
                                        fail_records
                                            .push(FailRecord::new((*row).clone(), reason.clone()));
                                    }
                                }
                            }
                        }
                    }
                }
            }
            WriteBatchReturn {
                seq,
                updated,
                fail_records,
            }
        });
        if !accepted {
            break;
        }
    }

    let mut outcome = WriteOutcome {
        processed: dataset.rows.len(),
        ..Default::default()
    };
    while let Some(event) = pool.next_event().await {
        match event {
            PoolEvent::Completed(result) => {
                outcome.updated += result.updated;
                if !result.fail_records.is_empty() {
                    if let Some(fail_file) = fail_file {
                        fail_file.append_all(&result.fail_records)?;
                    }
                    outcome.fail_records.extend(result.fail_records);
                }
                log::debug!("write batch {} drained", result.seq);
            }
            PoolEvent::Cancelled => {}
            PoolEvent::Failed(failure) => {
                log::error!("write worker failed: {}", failure.detail);
            }
        }
    }
    outcome.aborted = pool.is_aborted();
    Ok(outcome)
}

fn id_of(header: &[String], row: &[String]) -> Option<i64> {
    let index = header.iter().position(|c| c == "id")?;
    row.get(index)?.parse().ok()
}

/// Groups rows by their value tuple (id excluded) into one multi-id
/// write per distinct tuple. Any malformed row fails the whole batch.
fn group_rows(
    header: &[String],
    rows: &[Vec<String>],
) -> Result<Vec<(JsonMap, Vec<i64>)>, String> {
    let id_index = header
        .iter()
        .position(|c| c == "id")
        .ok_or_else(|| "source header has no 'id' column".to_string())?;

    let mut groups: BTreeMap<String, (JsonMap, Vec<i64>)> = BTreeMap::new();
    for row in rows {
        let raw = row
            .get(id_index)
            .ok_or_else(|| format!("row is shorter than the header ({} columns)", row.len()))?;
        let record_id: i64 = raw
            .parse()
            .map_err(|_| format!("invalid record id '{raw}'"))?;
        let mut values = JsonMap::new();
        for (i, column) in header.iter().enumerate() {
            if i == id_index {
                continue;
            }
            let cell = row.get(i).cloned().unwrap_or_default();
            values.insert(column.clone(), Value::String(cell));
        }
        groups
            .entry(canonical_key(&values))
            .or_insert_with(|| (values, Vec::new()))
            .1
            .push(record_id);
    }
    Ok(groups.into_values().collect())
}

/// Collapses `(id, values)` pairs into one multi-id write per distinct
/// payload. Shared with the pass-2 resolver.
pub(crate) fn group_updates(pairs: Vec<(i64, JsonMap)>) -> Vec<(JsonMap, Vec<i64>)> {
    let mut groups: BTreeMap<String, (JsonMap, Vec<i64>)> = BTreeMap::new();
    for (id, values) in pairs {
        groups
            .entry(canonical_key(&values))
            .or_insert_with(|| (values, Vec::new()))
            .1
            .push(id);
    }
    groups.into_values().collect()
}

/// Order-insensitive serialization of a value payload, used as the
/// grouping key.
fn canonical_key(values: &JsonMap) -> String {
    let ordered: BTreeMap<&String, &Value> = values.iter().collect();
    serde_json::to_string(&ordered).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::MockServer;
    use serde_json::json;

    fn dataset(rows: &[&[&str]]) -> Dataset {
        Dataset::new(
            vec!["id".to_string(), "status".to_string()],
            rows.iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
        )
    }

    #[tokio::test]
    async fn identical_values_collapse_into_one_write() {
        let server = Arc::new(MockServer::new());
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let data = dataset(&[&["1", "done"], &["2", "done"], &["3", "done"]]);

        let outcome = run_batch_write(&rpc, "res.task", &data, 100, 1, None)
            .await
            .unwrap();
        assert_eq!(outcome.updated, 3);
        assert!(outcome.success());

        let written = server.written();
        assert_eq!(written.len(), 1);
        let (model, ids, values) = &written[0];
        assert_eq!(model, "res.task");
        assert_eq!(ids, &vec![1, 2, 3]);
        assert_eq!(values.get("status"), Some(&json!("done")));
    }

    #[tokio::test]
    async fn distinct_values_write_separately() {
        let server = Arc::new(MockServer::new());
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let data = dataset(&[&["1", "done"], &["2", "open"], &["3", "done"]]);

        let outcome = run_batch_write(&rpc, "res.task", &data, 100, 1, None)
            .await
            .unwrap();
        assert_eq!(outcome.updated, 3);
        assert_eq!(server.written().len(), 2);
    }

    #[tokio::test]
    async fn missing_id_column_fails_the_whole_batch() {
        let server = Arc::new(MockServer::new());
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let data = Dataset::new(
            vec!["status".to_string()],
            vec![vec!["done".to_string()], vec!["open".to_string()]],
        );

        let outcome = run_batch_write(&rpc, "res.task", &data, 100, 1, None)
            .await
            .unwrap();
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.fail_records.len(), 2);
        assert!(!outcome.success());
        assert!(outcome.fail_records[0].reason.contains("no 'id' column"));
    }

    #[tokio::test]
    async fn failed_group_expands_to_per_row_records() {
        let server = Arc::new(MockServer::new().with_write_fault_id(2));
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let data = dataset(&[&["1", "done"], &["2", "done"], &["3", "open"]]);

        let outcome = run_batch_write(&rpc, "res.task", &data, 100, 1, None)
            .await
            .unwrap();
        // The "done" group fails (contains id 2); the "open" group lands.
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.fail_records.len(), 2);
        let failed_ids: Vec<&str> = outcome
            .fail_records
            .iter()
            .map(|r| r.row[0].as_str())
            .collect();
        assert_eq!(failed_ids, vec!["1", "2"]);
    }

    #[test]
    fn grouping_is_order_insensitive_in_values() {
        let mut a = JsonMap::new();
        a.insert("x".to_string(), json!("1"));
        a.insert("y".to_string(), json!("2"));
        let mut b = JsonMap::new();
        b.insert("y".to_string(), json!("2"));
        b.insert("x".to_string(), json!("1"));
        let groups = group_updates(vec![(1, a), (2, b)]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1, vec![1, 2]);
    }
}
