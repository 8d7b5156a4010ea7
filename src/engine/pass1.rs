//! Pass 1: bulk creation with per-record fallback.
//!
//! Every batch first attempts one multi-record load. Bulk verbs roll the
//! whole batch back on one bad row, so a failed batch falls back to one
//! create per row, isolating faults at the cost of throughput. Only
//! batches that actually contain a bad row pay that cost. Proxy- or
//! memory-shaped faults halve the chunk size and retry before any
//! fallback.
//!
//! Batches carry full-width source rows; deferred and ignored columns
//! are projected away at call time so fail records always match the
//! source header.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::dataset::{BatchState, FailRecord, base_field, number_batches};
use crate::engine::fail::{FailFile, clean_fault_message};
use crate::error::FlowError;
use crate::pool::{AbortFlag, PoolEvent, WorkerPool};
use crate::rpc::{JsonMap, LoadResult, ObjectClient, RpcPool, is_scalable_text};

/// Abort once this many fully-failed batches complete back to back.
const MAX_CONSECUTIVE_BATCH_FAILURES: usize = 50;

#[derive(Debug, Default)]
pub struct Pass1Outcome {
    /// External key to target key, one entry per created (or adopted)
    /// record. Duplicate external keys overwrite silently; last write
    /// wins by design.
    pub id_map: HashMap<String, i64>,
    pub fail_records: Vec<FailRecord>,
    pub batches: usize,
    pub aborted: bool,
}

struct BatchReturn {
    seq: usize,
    id_map: HashMap<String, i64>,
    fail_records: Vec<FailRecord>,
    state: BatchState,
    error_note: Option<String>,
}

/// Column projection applied when submitting rows to the bulk verb.
struct LoadProjection {
    header: Vec<String>,
    indices: Vec<usize>,
    max_index: usize,
}

fn build_projection(header: &[String], ignore: &HashSet<String>) -> LoadProjection {
    let indices: Vec<usize> = header
        .iter()
        .enumerate()
        .filter(|(_, column)| !ignore.contains(base_field(column)))
        .map(|(i, _)| i)
        .collect();
    let projected: Vec<String> = indices.iter().map(|&i| header[i].clone()).collect();
    let max_index = indices.iter().copied().max().unwrap_or(0);
    LoadProjection {
        header: projected,
        indices,
        max_index,
    }
}

/// Shared per-batch context.
struct BatchContext {
    model: String,
    header: Vec<String>,
    projection: LoadProjection,
    ignore: HashSet<String>,
    uid_index: usize,
    force_create: bool,
}

/// Runs pass 1 over full-width rows. Columns whose base name appears in
/// `ignore` (deferred fields plus operator exclusions) are filtered out
/// of every remote call. Builds the id map consumed by pass 2.
#[allow(clippy::too_many_arguments)]
pub async fn run_pass1<C>(
    rpc: &RpcPool<C>,
    model: &str,
    header: &[String],
    rows: &[Vec<String>],
    unique_id_field: &str,
    ignore: &[String],
    batch_size: usize,
    max_connection: usize,
    force_create: bool,
    fail_file: Option<&FailFile>,
) -> Result<Pass1Outcome, FlowError>
where
    C: ObjectClient + 'static,
{
    let ignore: HashSet<String> = ignore.iter().cloned().collect();
    if ignore.contains(unique_id_field) {
        return Err(FlowError::Configuration(format!(
            "unique id column '{unique_id_field}' was removed by the ignore list"
        )));
    }
    let uid_index = header
        .iter()
        .position(|column| base_field(column) == unique_id_field)
        .ok_or_else(|| {
            FlowError::Configuration(format!(
                "unique id column '{unique_id_field}' is missing from the source header"
            ))
        })?;

    let batches = number_batches(rows, batch_size);
    let total_batches = batches.len();
    log::info!(
        "pass 1/2: importing {} records into '{model}' in {total_batches} batches",
        rows.len()
    );

    let context = Arc::new(BatchContext {
        model: model.to_string(),
        header: header.to_vec(),
        projection: build_projection(header, &ignore),
        ignore,
        uid_index,
        force_create,
    });

    let mut pool = WorkerPool::new(max_connection)?;
    let abort = pool.abort_flag();

    for (seq, batch) in batches {
        let client = rpc.get();
        let context = context.clone();
        let abort = abort.clone();
        let accepted =
            pool.submit(async move { execute_load_batch(client, context, batch, seq, abort).await });
        if !accepted {
            break;
        }
    }

    let mut outcome = Pass1Outcome {
        batches: total_batches,
        ..Default::default()
    };
    let mut consecutive_failures = 0usize;
    let mut successful_batches = 0usize;
    let mut drained = 0usize;

    while let Some(event) = pool.next_event().await {
        match event {
            PoolEvent::Completed(result) => {
                drained += 1;
                if result.state.is_terminal_success() {
                    successful_batches += 1;
                    consecutive_failures = 0;
                } else {
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_BATCH_FAILURES {
                        log::error!(
                            "aborting import: {consecutive_failures} consecutive batches failed"
                        );
                        pool.abort();
                    }
                }
                if let Some(note) = &result.error_note {
                    log::warn!("batch {}: {}", result.seq, clean_fault_message(note));
                }
                outcome.id_map.extend(result.id_map);
                if !result.fail_records.is_empty() {
                    if let Some(fail_file) = fail_file {
                        fail_file.append_all(&result.fail_records)?;
                    }
                    outcome.fail_records.extend(result.fail_records);
                }
                log::debug!("batch {} drained ({drained}/{total_batches})", result.seq);
            }
            PoolEvent::Cancelled => {
                drained += 1;
            }
            PoolEvent::Failed(failure) => {
                drained += 1;
                log::error!("pass 1 worker failed: {}", failure.detail);
            }
        }
    }

    if total_batches > 0 && successful_batches == 0 {
        log::error!("aborting import: all processed batches failed");
        outcome.aborted = true;
    }
    outcome.aborted = outcome.aborted || pool.is_aborted();
    Ok(outcome)
}

async fn execute_load_batch<C: ObjectClient>(
    client: Arc<C>,
    context: Arc<BatchContext>,
    rows: Vec<Vec<String>>,
    seq: usize,
    abort: AbortFlag,
) -> BatchReturn {
    let mut fail_records = Vec::new();

    // Rows too short for the projected columns can never load; fail
    // them once, up front, so retries do not duplicate the records.
    let mut valid_rows = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() <= context.projection.max_index {
            fail_records.push(FailRecord::new(
                row,
                format!(
                    "malformed row: fewer columns than the header requires (at least {})",
                    context.projection.max_index + 1
                ),
            ));
        } else {
            valid_rows.push(row);
        }
    }

    if context.force_create {
        log::debug!("batch {seq}: create-only mode active");
        let (id_map, created_fails) =
            create_batch_individually(&*client, &context, &valid_rows, &abort).await;
        fail_records.extend(created_fails);
        let state = if id_map.is_empty() && !valid_rows.is_empty() {
            BatchState::FailedIndividual
        } else {
            BatchState::SucceededIndividual
        };
        return BatchReturn {
            seq,
            id_map,
            fail_records,
            state,
            error_note: None,
        };
    }

    let mut id_map = HashMap::new();
    let mut error_note = None;
    let mut fell_back = false;

    let mut position = 0usize;
    let mut chunk_size = valid_rows.len().max(1);
    while position < valid_rows.len() {
        if abort.is_set() {
            log::debug!("batch {seq}: abort requested, leaving remaining rows untouched");
            break;
        }
        let end = (position + chunk_size).min(valid_rows.len());
        let chunk = &valid_rows[position..end];
        let load_lines: Vec<Vec<String>> = chunk
            .iter()
            .map(|row| {
                context
                    .projection
                    .indices
                    .iter()
                    .map(|&i| row[i].clone())
                    .collect()
            })
            .collect();

        let failure = match client
            .load(&context.model, &context.projection.header, &load_lines)
            .await
        {
            Ok(result) if result.is_complete(load_lines.len()) => {
                for (row, id) in chunk.iter().zip(&result.ids) {
                    id_map.insert(row[context.uid_index].clone(), *id);
                }
                position = end;
                continue;
            }
            Ok(result) => {
                let reason = load_failure_reason(&result, load_lines.len());
                let scalable = is_scalable_text(&reason);
                (reason, scalable)
            }
            Err(err) => {
                let scalable = err.is_scalable_fault();
                (err.to_string(), scalable)
            }
        };

        let (reason, scalable) = failure;
        if scalable && chunk_size > 1 {
            chunk_size = (chunk_size / 2).max(1);
            log::warn!(
                "batch {seq}: transient fault ('{}'), reducing chunk size to {chunk_size} and retrying",
                clean_fault_message(&reason)
            );
            continue;
        }

        log::warn!(
            "batch {seq}: bulk load failed ('{}'), falling back to per-record create for {} records",
            clean_fault_message(&reason),
            chunk.len()
        );
        fell_back = true;
        error_note.get_or_insert(reason);
        let (chunk_ids, chunk_fails) =
            create_batch_individually(&*client, &context, chunk, &abort).await;
        id_map.extend(chunk_ids);
        fail_records.extend(chunk_fails);
        position = end;
    }

    let state = if !fell_back {
        BatchState::Succeeded
    } else if !id_map.is_empty() {
        BatchState::SucceededIndividual
    } else {
        BatchState::FailedIndividual
    };
    BatchReturn {
        seq,
        id_map,
        fail_records,
        state,
        error_note,
    }
}

/// Creates the chunk's rows one by one to isolate the bad ones. A single
/// bulk key lookup runs first so records that already exist on the
/// target are adopted into the id map instead of duplicated.
async fn create_batch_individually<C: ObjectClient>(
    client: &C,
    context: &BatchContext,
    rows: &[Vec<String>],
    abort: &AbortFlag,
) -> (HashMap<String, i64>, Vec<FailRecord>) {
    let mut id_map = HashMap::new();
    let mut fail_records = Vec::new();
    if rows.is_empty() {
        return (id_map, fail_records);
    }

    let keys: Vec<String> = rows
        .iter()
        .filter_map(|row| row.get(context.uid_index))
        .filter(|key| !key.is_empty())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let existing = match client.resolve_external_keys(&keys).await {
        Ok(map) => map,
        Err(err) => {
            log::debug!("existing-record lookup failed ({err}); creating all rows");
            HashMap::new()
        }
    };

    let header = &context.header;
    for row in rows {
        if abort.is_set() {
            break;
        }
        if row.len() != header.len() {
            fail_records.push(FailRecord::new(
                row.clone(),
                format!(
                    "malformed row: has {} columns, but header has {}",
                    row.len(),
                    header.len()
                ),
            ));
            continue;
        }
        let source_key = &row[context.uid_index];
        if let Some(&known) = existing.get(source_key) {
            log::debug!("record '{source_key}' already exists as {known}, adopting");
            id_map.insert(source_key.clone(), known);
            continue;
        }
        let values = row_to_values(context, row);
        match client.create(&context.model, &values).await {
            Ok(new_id) => {
                id_map.insert(source_key.clone(), new_id);
            }
            Err(err) => {
                fail_records.push(FailRecord::new(
                    row.clone(),
                    clean_fault_message(&err.to_string()),
                ));
            }
        }
    }
    (id_map, fail_records)
}

/// Create verbs take plain field values; suffixed reference columns,
/// ignored fields and the external key column itself cannot be
/// expressed there and are left out.
fn row_to_values(context: &BatchContext, row: &[String]) -> JsonMap {
    let mut values = JsonMap::new();
    for (i, column) in context.header.iter().enumerate() {
        if i == context.uid_index || column.contains('/') {
            continue;
        }
        let base = base_field(column);
        if base == "id" || base == ".id" || context.ignore.contains(base) {
            continue;
        }
        if let Some(cell) = row.get(i) {
            values.insert(base.to_string(), Value::String(cell.clone()));
        }
    }
    values
}

fn load_failure_reason(result: &LoadResult, submitted: usize) -> String {
    if let Some(first) = result.messages.first() {
        if first.message.is_empty() {
            "batch load failed".to_string()
        } else {
            first.message.clone()
        }
    } else {
        format!(
            "record count mismatch after load: submitted {submitted}, got {}",
            result.ids.len()
        )
    }
}
