//! Pass 2: deferred relation resolution and grouped writes.
//!
//! Consumes the id map built in pass 1. Deferred many-to-one fields
//! (self-references) resolve directly through that map and are applied
//! with grouped multi-id writes. Collection fields follow their planned
//! strategy: junction creates, a junction bulk load, or relational
//! commands inside a write call. Rows whose owning record failed in
//! pass 1 are skipped; a relation cannot be attached to a record that
//! does not exist.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rayon::prelude::*;
use serde_json::{Value, json};

use crate::cache::CacheStore;
use crate::dataset::{Dataset, FailRecord};
use crate::engine::fail::{FailFile, clean_fault_message};
use crate::engine::write::group_updates;
use crate::error::FlowError;
use crate::plan::{ImportPlan, RelationInfo, Strategy};
use crate::pool::{PoolEvent, WorkerPool};
use crate::rpc::{JsonMap, ObjectClient, RpcPool};

/// Junction rows are created in chunks of this size.
const JUNCTION_CHUNK_SIZE: usize = 50;

#[derive(Debug, Default)]
pub struct Pass2Outcome {
    pub updated: usize,
    pub fail_records: Vec<FailRecord>,
    pub aborted: bool,
}

/// Runs pass 2 for every deferred field of the plan.
#[allow(clippy::too_many_arguments)]
pub async fn run_pass2<C>(
    rpc: &RpcPool<C>,
    cache: &CacheStore,
    dataset: &Dataset,
    plan: &ImportPlan,
    id_map: &HashMap<String, i64>,
    batch_size: usize,
    max_connection: usize,
    fail_file: Option<&FailFile>,
) -> Result<Pass2Outcome, FlowError>
where
    C: ObjectClient + 'static,
{
    let mut outcome = Pass2Outcome::default();
    let Some(uid_index) = dataset.index_of_base(&plan.unique_id_field) else {
        return Err(FlowError::Configuration(format!(
            "unique id column '{}' is missing from the source header",
            plan.unique_id_field
        )));
    };

    let m2o_fields = plan.deferred_many2one();
    if !m2o_fields.is_empty() {
        log::info!(
            "pass 2/2: updating {} deferred relation fields on '{}'",
            m2o_fields.len(),
            plan.model
        );
        run_grouped_m2o_writes(
            rpc,
            dataset,
            plan,
            id_map,
            uid_index,
            &m2o_fields,
            batch_size,
            max_connection,
            fail_file,
            &mut outcome,
        )
        .await?;
    }

    for field in &plan.deferred {
        let Some(strategy) = plan.strategies.get(field) else {
            continue;
        };
        let Some(field_index) = dataset.index_of_base(field) else {
            continue;
        };
        match strategy {
            Strategy::WriteTuple(info) => {
                run_write_tuple(
                    rpc, cache, field, info, dataset, id_map, uid_index, field_index, fail_file,
                    &mut outcome,
                )
                .await?;
            }
            Strategy::DirectRelational(info) => {
                run_direct_relational(
                    rpc, cache, field, info, dataset, id_map, uid_index, field_index, batch_size,
                    max_connection, fail_file, &mut outcome,
                )
                .await?;
            }
            Strategy::WriteO2mTuple(_) => {
                run_write_o2m(
                    rpc, plan, field, dataset, id_map, uid_index, field_index, fail_file,
                    &mut outcome,
                )
                .await?;
            }
        }
    }
    Ok(outcome)
}

/// Resolves deferred many-to-one values through the id map and applies
/// them with grouped multi-id writes.
#[allow(clippy::too_many_arguments)]
async fn run_grouped_m2o_writes<C>(
    rpc: &RpcPool<C>,
    dataset: &Dataset,
    plan: &ImportPlan,
    id_map: &HashMap<String, i64>,
    uid_index: usize,
    fields: &[&str],
    batch_size: usize,
    max_connection: usize,
    fail_file: Option<&FailFile>,
    outcome: &mut Pass2Outcome,
) -> Result<(), FlowError>
where
    C: ObjectClient + 'static,
{
    let field_indices: Vec<(String, usize)> = fields
        .iter()
        .filter_map(|field| {
            dataset
                .index_of_base(field)
                .map(|index| (field.to_string(), index))
        })
        .collect();

    // Per-row resolution is pure; scan in parallel, merge in order.
    let per_row: Vec<(Option<(i64, JsonMap)>, Vec<FailRecord>)> = dataset
        .rows
        .par_iter()
        .map(|row| {
            let Some(source_key) = row.get(uid_index) else {
                return (None, Vec::new());
            };
            let Some(&db_id) = id_map.get(source_key) else {
                // Owner failed in pass 1; nothing to attach to.
                return (None, Vec::new());
            };
            let mut values = JsonMap::new();
            let mut fails = Vec::new();
            for (field, index) in &field_indices {
                let Some(raw) = row.get(*index) else { continue };
                if raw.is_empty() {
                    continue;
                }
                match id_map.get(raw) {
                    Some(&related) => {
                        values.insert(field.clone(), json!(related));
                    }
                    None => {
                        fails.push(FailRecord::new(
                            row.clone(),
                            format!("unresolved reference '{raw}' for field '{field}'"),
                        ));
                    }
                }
            }
            let pair = (!values.is_empty()).then_some((db_id, values));
            (pair, fails)
        })
        .collect();

    let mut pairs = Vec::new();
    for (pair, fails) in per_row {
        if let Some(pair) = pair {
            pairs.push(pair);
        }
        if !fails.is_empty() {
            if let Some(fail_file) = fail_file {
                fail_file.append_all(&fails)?;
            }
            outcome.fail_records.extend(fails);
        }
    }
    if pairs.is_empty() {
        log::info!("no valid relations found to update in pass 2");
        return Ok(());
    }

    // One write call per distinct payload, chunked to the batch size.
    let mut write_batches: Vec<(Vec<i64>, JsonMap)> = Vec::new();
    for (values, ids) in group_updates(pairs) {
        for chunk in ids.chunks(batch_size.max(1)) {
            write_batches.push((chunk.to_vec(), values.clone()));
        }
    }
    log::info!(
        "pass 2/2: {} grouped write calls for '{}'",
        write_batches.len(),
        plan.model
    );

    // Rebuilding original rows for failure reporting needs the inverse
    // id map and the source rows by external key.
    let inverse: HashMap<i64, &String> = id_map.iter().map(|(key, id)| (*id, key)).collect();
    let source_rows: HashMap<&str, &Vec<String>> = dataset
        .rows
        .iter()
        .filter_map(|row| row.get(uid_index).map(|key| (key.as_str(), row)))
        .collect();

    let mut pool = WorkerPool::new(max_connection)?;
    let model = plan.model.clone();
    for (ids, values) in write_batches {
        let client = rpc.get();
        let model = model.clone();
        let accepted = pool.submit(async move {
            let result = client.write(&model, &ids, &values).await;
            (ids, values, result)
        });
        if !accepted {
            break;
        }
    }
    while let Some(event) = pool.next_event().await {
        match event {
            PoolEvent::Completed((ids, values, result)) => match result {
                Ok(_) => {
                    log::debug!("updated {} records with shared relation values", ids.len());
                    outcome.updated += ids.len();
                }
                Err(err) => {
                    let reason = clean_fault_message(&err.to_string());
                    log::error!(
                        "grouped write of {:?} for {} records failed: {reason}",
                        values,
                        ids.len()
                    );
                    let mut expanded = Vec::new();
                    for id in ids {
                        if let Some(row) = inverse
                            .get(&id)
                            .and_then(|key| source_rows.get(key.as_str()))
                        {
                            expanded.push(FailRecord::new((*row).clone(), reason.clone()));
                        }
                    }
                    if let Some(fail_file) = fail_file {
                        fail_file.append_all(&expanded)?;
                    }
                    outcome.fail_records.extend(expanded);
                }
            },
            PoolEvent::Cancelled => {}
            PoolEvent::Failed(failure) => {
                log::error!("pass 2 worker failed: {}", failure.detail);
            }
        }
    }
    outcome.aborted = outcome.aborted || pool.is_aborted();
    Ok(())
}

/// Resolves external keys of a related model: cache first, then one
/// bulk remote lookup for the unique keys the cache did not cover. The
/// cache is never written here; that is pass 1's responsibility on its
/// own model.
async fn resolve_related<C: ObjectClient>(
    client: &C,
    cache: &CacheStore,
    related_model: &str,
    keys: &BTreeSet<String>,
) -> HashMap<String, i64> {
    let mut resolved = HashMap::new();
    if let Some(cached) = cache.load_id_map(related_model) {
        for key in keys {
            if let Some(&id) = cached.get(key) {
                resolved.insert(key.clone(), id);
            }
        }
    }
    let unresolved: Vec<String> = keys
        .iter()
        .filter(|key| !resolved.contains_key(*key))
        .cloned()
        .collect();
    if unresolved.is_empty() {
        return resolved;
    }
    log::warn!(
        "cache missed {} external keys for model '{related_model}'; falling back to remote \
         lookup (slow path)",
        unresolved.len()
    );
    match client.resolve_external_keys(&unresolved).await {
        Ok(remote) => resolved.extend(remote),
        Err(err) => {
            log::error!("remote key lookup for '{related_model}' failed: {err}");
        }
    }
    resolved
}

/// Link pairs for one collection field: owner row index, owner target
/// key, related external key.
fn collect_links(
    dataset: &Dataset,
    id_map: &HashMap<String, i64>,
    uid_index: usize,
    field_index: usize,
) -> (Vec<(usize, i64, String)>, BTreeSet<String>) {
    let mut links = Vec::new();
    let mut related_keys = BTreeSet::new();
    for (row_index, row) in dataset.rows.iter().enumerate() {
        let Some(source_key) = row.get(uid_index) else {
            continue;
        };
        let Some(&owner_id) = id_map.get(source_key) else {
            continue;
        };
        let Some(raw) = row.get(field_index) else {
            continue;
        };
        for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            related_keys.insert(key.to_string());
            links.push((row_index, owner_id, key.to_string()));
        }
    }
    (links, related_keys)
}

/// `WriteTuple`: one junction row per link, created individually in
/// chunks, salvaging what it can.
#[allow(clippy::too_many_arguments)]
async fn run_write_tuple<C>(
    rpc: &RpcPool<C>,
    cache: &CacheStore,
    field: &str,
    info: &RelationInfo,
    dataset: &Dataset,
    id_map: &HashMap<String, i64>,
    uid_index: usize,
    field_index: usize,
    fail_file: Option<&FailFile>,
    outcome: &mut Pass2Outcome,
) -> Result<(), FlowError>
where
    C: ObjectClient + 'static,
{
    log::info!("running write-tuple import for field '{field}'");
    let client = rpc.get();
    let (links, related_keys) = collect_links(dataset, id_map, uid_index, field_index);
    if links.is_empty() {
        return Ok(());
    }
    let resolved = resolve_related(&*client, cache, &info.relation, &related_keys).await;

    let mut creates: Vec<(usize, JsonMap)> = Vec::new();
    let mut fails = Vec::new();
    for (row_index, owner_id, related_key) in links {
        match resolved.get(&related_key) {
            Some(&related_id) => {
                let mut values = JsonMap::new();
                values.insert(info.owning_key.clone(), json!(owner_id));
                values.insert(info.related_key.clone(), json!(related_id));
                creates.push((row_index, values));
            }
            None => {
                fails.push(FailRecord::new(
                    dataset.rows[row_index].clone(),
                    format!("unresolved external key '{related_key}' for field '{field}'"),
                ));
            }
        }
    }

    let mut created = 0usize;
    for chunk in creates.chunks(JUNCTION_CHUNK_SIZE) {
        for (row_index, values) in chunk {
            match client.create(&info.relation_table, values).await {
                Ok(_) => created += 1,
                Err(err) => {
                    fails.push(FailRecord::new(
                        dataset.rows[*row_index].clone(),
                        format!(
                            "junction insert for field '{field}' failed: {}",
                            clean_fault_message(&err.to_string())
                        ),
                    ));
                }
            }
        }
        log::debug!("field '{field}': {created} junction rows created so far");
    }
    log::info!(
        "finished write-tuple for '{field}': {created} successful, {} failed",
        fails.len()
    );
    outcome.updated += created;
    if !fails.is_empty() {
        if let Some(fail_file) = fail_file {
            fail_file.append_all(&fails)?;
        }
        outcome.fail_records.extend(fails);
    }
    Ok(())
}

/// `DirectRelational`: assemble the junction rows and push them through
/// the generic bulk load path, one chunk per worker.
#[allow(clippy::too_many_arguments)]
async fn run_direct_relational<C>(
    rpc: &RpcPool<C>,
    cache: &CacheStore,
    field: &str,
    info: &RelationInfo,
    dataset: &Dataset,
    id_map: &HashMap<String, i64>,
    uid_index: usize,
    field_index: usize,
    batch_size: usize,
    max_connection: usize,
    fail_file: Option<&FailFile>,
    outcome: &mut Pass2Outcome,
) -> Result<(), FlowError>
where
    C: ObjectClient + 'static,
{
    log::info!("running direct relational import for field '{field}'");
    let resolver = rpc.get();
    let (links, related_keys) = collect_links(dataset, id_map, uid_index, field_index);
    if links.is_empty() {
        return Ok(());
    }
    let resolved = resolve_related(&*resolver, cache, &info.relation, &related_keys).await;

    let mut link_rows: Vec<(usize, Vec<String>)> = Vec::new();
    let mut fails = Vec::new();
    for (row_index, owner_id, related_key) in links {
        match resolved.get(&related_key) {
            Some(&related_id) => {
                link_rows.push((row_index, vec![owner_id.to_string(), related_id.to_string()]));
            }
            None => {
                fails.push(FailRecord::new(
                    dataset.rows[row_index].clone(),
                    format!("unresolved external key '{related_key}' for field '{field}'"),
                ));
            }
        }
    }

    let link_header: Arc<Vec<String>> =
        Arc::new(vec![info.owning_key.clone(), info.related_key.clone()]);
    let table = info.relation_table.clone();
    let mut pool = WorkerPool::new(max_connection)?;
    for chunk in link_rows.chunks(batch_size.max(1)) {
        let client = rpc.get();
        let table = table.clone();
        let header = link_header.clone();
        let chunk: Vec<(usize, Vec<String>)> = chunk.to_vec();
        let accepted = pool.submit(async move {
            let rows: Vec<Vec<String>> = chunk.iter().map(|(_, row)| row.clone()).collect();
            let result = client.load(&table, &header, &rows).await;
            (chunk, result)
        });
        if !accepted {
            break;
        }
    }

    while let Some(event) = pool.next_event().await {
        match event {
            PoolEvent::Completed((chunk, result)) => {
                let complete = matches!(&result, Ok(load) if load.is_complete(chunk.len()));
                if complete {
                    outcome.updated += chunk.len();
                    continue;
                }
                let reason = match result {
                    Ok(load) => load
                        .messages
                        .first()
                        .map(|m| m.message.clone())
                        .unwrap_or_else(|| "junction load failed".to_string()),
                    Err(err) => clean_fault_message(&err.to_string()),
                };
                log::error!(
                    "junction bulk load of {} rows into '{table}' failed: {reason}",
                    chunk.len()
                );
                for (row_index, _) in chunk {
                    fails.push(FailRecord::new(
                        dataset.rows[row_index].clone(),
                        format!("junction load for field '{field}' failed: {reason}"),
                    ));
                }
            }
            PoolEvent::Cancelled => {}
            PoolEvent::Failed(failure) => {
                log::error!("direct relational worker failed: {}", failure.detail);
            }
        }
    }
    outcome.aborted = outcome.aborted || pool.is_aborted();
    if !fails.is_empty() {
        if let Some(fail_file) = fail_file {
            fail_file.append_all(&fails)?;
        }
        outcome.fail_records.extend(fails);
    }
    Ok(())
}

/// `WriteO2mTuple`: the cell carries a JSON list of child value maps,
/// attached with create commands in a single write per parent.
#[allow(clippy::too_many_arguments)]
async fn run_write_o2m<C>(
    rpc: &RpcPool<C>,
    plan: &ImportPlan,
    field: &str,
    dataset: &Dataset,
    id_map: &HashMap<String, i64>,
    uid_index: usize,
    field_index: usize,
    fail_file: Option<&FailFile>,
    outcome: &mut Pass2Outcome,
) -> Result<(), FlowError>
where
    C: ObjectClient + 'static,
{
    log::info!("running one-to-many attach for field '{field}'");
    let client = rpc.get();
    let mut fails = Vec::new();
    let mut attached = 0usize;

    for row in &dataset.rows {
        let Some(source_key) = row.get(uid_index) else {
            continue;
        };
        let Some(&parent_id) = id_map.get(source_key) else {
            continue;
        };
        let Some(raw) = row.get(field_index) else {
            continue;
        };
        if raw.is_empty() {
            continue;
        }

        let children: Vec<JsonMap> = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => {
                let mut maps = Vec::with_capacity(items.len());
                let mut valid = true;
                for item in items {
                    match item {
                        Value::Object(map) => maps.push(map),
                        _ => {
                            valid = false;
                            break;
                        }
                    }
                }
                if !valid {
                    fails.push(FailRecord::new(
                        row.clone(),
                        format!("field '{field}' holds a list with non-object entries"),
                    ));
                    continue;
                }
                maps
            }
            Ok(_) => {
                fails.push(FailRecord::new(
                    row.clone(),
                    format!("field '{field}' does not hold a JSON list"),
                ));
                continue;
            }
            Err(err) => {
                log::error!("invalid child payload for parent '{source_key}': {err}");
                fails.push(FailRecord::new(
                    row.clone(),
                    format!("invalid JSON in field '{field}'"),
                ));
                continue;
            }
        };

        // (0, 0, values) creates and attaches one child per entry.
        let commands: Vec<Value> = children
            .into_iter()
            .map(|values| json!([0, 0, values]))
            .collect();
        let mut payload = JsonMap::new();
        payload.insert(field.to_string(), Value::Array(commands));
        match client.write(&plan.model, &[parent_id], &payload).await {
            Ok(_) => attached += 1,
            Err(err) => {
                fails.push(FailRecord::new(
                    row.clone(),
                    format!(
                        "child attach for field '{field}' failed: {}",
                        clean_fault_message(&err.to_string())
                    ),
                ));
            }
        }
    }

    log::info!(
        "finished one-to-many attach for '{field}': {attached} successful, {} failed",
        fails.len()
    );
    outcome.updated += attached;
    if !fails.is_empty() {
        if let Some(fail_file) = fail_file {
            fail_file.append_all(&fails)?;
        }
        outcome.fail_records.extend(fails);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanOptions, build_plan};
    use crate::rpc::mock::MockServer;
    use crate::rpc::{FieldDef, FieldKind};

    fn cache() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::rpc::ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 8069,
            database: "test".to_string(),
            login: "admin".to_string(),
            password: "admin".to_string(),
            https: false,
        };
        let store = CacheStore::open(dir.path(), &config).unwrap();
        (dir, store)
    }

    fn hierarchy_plan() -> ImportPlan {
        let mut schema = HashMap::new();
        schema.insert("name".to_string(), FieldDef::scalar(FieldKind::Char));
        schema.insert("parent_id".to_string(), FieldDef::many2one("res.category"));
        build_plan(
            "res.category",
            &[
                "id".to_string(),
                "name".to_string(),
                "parent_id/id".to_string(),
            ],
            &schema,
            &PlanOptions::default(),
        )
        .unwrap()
    }

    fn hierarchy_dataset() -> Dataset {
        Dataset::new(
            vec![
                "id".to_string(),
                "name".to_string(),
                "parent_id/id".to_string(),
            ],
            vec![
                vec!["p1".to_string(), "Parent".to_string(), "".to_string()],
                vec!["c1".to_string(), "Child 1".to_string(), "p1".to_string()],
                vec!["c2".to_string(), "Child 2".to_string(), "p1".to_string()],
                vec!["c3".to_string(), "Child 3".to_string(), "p1".to_string()],
            ],
        )
    }

    fn hierarchy_id_map() -> HashMap<String, i64> {
        let mut map = HashMap::new();
        map.insert("p1".to_string(), 10);
        map.insert("c1".to_string(), 11);
        map.insert("c2".to_string(), 12);
        map.insert("c3".to_string(), 13);
        map
    }

    #[tokio::test]
    async fn rows_sharing_a_payload_merge_into_one_write() {
        // Three children pointing at the same parent: exactly one
        // multi-id write call.
        let server = Arc::new(MockServer::new());
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let (_dir, cache) = cache();

        let outcome = run_pass2(
            &rpc,
            &cache,
            &hierarchy_dataset(),
            &hierarchy_plan(),
            &hierarchy_id_map(),
            100,
            1,
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.updated, 3);
        assert!(outcome.fail_records.is_empty());
        let written = server.written();
        assert_eq!(written.len(), 1);
        let (model, ids, values) = &written[0];
        assert_eq!(model, "res.category");
        assert_eq!(ids, &vec![11, 12, 13]);
        assert_eq!(values.get("parent_id"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn rows_with_failed_owners_are_skipped() {
        let server = Arc::new(MockServer::new());
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let (_dir, cache) = cache();

        let mut id_map = hierarchy_id_map();
        id_map.remove("c2");
        let outcome = run_pass2(
            &rpc,
            &cache,
            &hierarchy_dataset(),
            &hierarchy_plan(),
            &id_map,
            100,
            1,
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.updated, 2);
        let written = server.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].1, vec![11, 13]);
    }

    #[tokio::test]
    async fn unresolved_references_fail_only_that_field() {
        let server = Arc::new(MockServer::new());
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let (_dir, cache) = cache();

        let mut id_map = hierarchy_id_map();
        id_map.remove("p1");
        // Children still exist; their parent reference is unresolvable.
        id_map.insert("x".to_string(), 99);

        let dataset = Dataset::new(
            hierarchy_dataset().header,
            vec![vec![
                "c1".to_string(),
                "Child 1".to_string(),
                "p1".to_string(),
            ]],
        );
        let outcome = run_pass2(
            &rpc,
            &cache,
            &dataset,
            &hierarchy_plan(),
            &id_map,
            100,
            1,
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.fail_records.len(), 1);
        assert!(outcome.fail_records[0].reason.contains("unresolved reference"));
        assert!(server.written().is_empty());
    }

    #[tokio::test]
    async fn failed_group_write_expands_to_original_rows() {
        let server = Arc::new(MockServer::new().with_write_fault_id(12));
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let (_dir, cache) = cache();

        let outcome = run_pass2(
            &rpc,
            &cache,
            &hierarchy_dataset(),
            &hierarchy_plan(),
            &hierarchy_id_map(),
            100,
            1,
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.fail_records.len(), 3);
        let failed_keys: Vec<&str> = outcome
            .fail_records
            .iter()
            .map(|r| r.row[0].as_str())
            .collect();
        assert_eq!(failed_keys, vec!["c1", "c2", "c3"]);
    }

    fn m2m_plan() -> ImportPlan {
        let mut schema = HashMap::new();
        schema.insert("name".to_string(), FieldDef::scalar(FieldKind::Char));
        schema.insert(
            "category_ids".to_string(),
            FieldDef::many2many("res.partner.category"),
        );
        build_plan(
            "res.partner",
            &[
                "id".to_string(),
                "name".to_string(),
                "category_ids/id".to_string(),
            ],
            &schema,
            &PlanOptions::default(),
        )
        .unwrap()
    }

    fn m2m_dataset() -> Dataset {
        Dataset::new(
            vec![
                "id".to_string(),
                "name".to_string(),
                "category_ids/id".to_string(),
            ],
            vec![
                vec![
                    "r1".to_string(),
                    "Ada".to_string(),
                    "cat.a,cat.b".to_string(),
                ],
                vec!["r2".to_string(), "Grace".to_string(), "cat.a".to_string()],
            ],
        )
    }

    #[tokio::test]
    async fn cache_miss_triggers_one_lookup_for_unique_keys() {
        // Scenario: both rows reference cat.a; the remote lookup must
        // carry each unique unresolved key exactly once.
        let server = Arc::new(
            MockServer::new()
                .with_external("cat.a", 501)
                .with_external("cat.b", 502),
        );
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let (_dir, cache) = cache();

        let mut id_map = HashMap::new();
        id_map.insert("r1".to_string(), 21);
        id_map.insert("r2".to_string(), 22);

        let outcome = run_pass2(
            &rpc,
            &cache,
            &m2m_dataset(),
            &m2m_plan(),
            &id_map,
            100,
            1,
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.updated, 3);
        assert!(outcome.fail_records.is_empty());

        let lookups = server.resolve_calls();
        assert_eq!(lookups.len(), 1);
        assert_eq!(lookups[0], vec!["cat.a".to_string(), "cat.b".to_string()]);

        // One junction row per link, carrying both derived keys.
        let created = server.created();
        assert_eq!(created.len(), 3);
        assert!(created.iter().all(|(model, _)| model
            == "res_partner_res_partner_category_rel"));
        assert_eq!(created[0].1.get("res_partner_id"), Some(&json!(21)));
        assert_eq!(created[0].1.get("res_partner_category_id"), Some(&json!(501)));
    }

    #[tokio::test]
    async fn cached_related_ids_skip_the_remote_lookup() {
        let server = Arc::new(MockServer::new());
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let (_dir, cache) = cache();

        let mut related = HashMap::new();
        related.insert("cat.a".to_string(), 501);
        related.insert("cat.b".to_string(), 502);
        cache.save_id_map("res.partner.category", &related).unwrap();

        let mut id_map = HashMap::new();
        id_map.insert("r1".to_string(), 21);
        id_map.insert("r2".to_string(), 22);

        let outcome = run_pass2(
            &rpc,
            &cache,
            &m2m_dataset(),
            &m2m_plan(),
            &id_map,
            100,
            1,
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.updated, 3);
        assert!(server.resolve_calls().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_m2m_keys_become_fail_records() {
        let server = Arc::new(MockServer::new().with_external("cat.a", 501));
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let (_dir, cache) = cache();

        let mut id_map = HashMap::new();
        id_map.insert("r1".to_string(), 21);
        id_map.insert("r2".to_string(), 22);

        let outcome = run_pass2(
            &rpc,
            &cache,
            &m2m_dataset(),
            &m2m_plan(),
            &id_map,
            100,
            1,
            None,
        )
        .await
        .unwrap();

        // cat.b never resolves: two junction rows land, one fails.
        assert_eq!(outcome.updated, 2);
        assert_eq!(outcome.fail_records.len(), 1);
        assert!(outcome.fail_records[0].reason.contains("cat.b"));
    }

    #[tokio::test]
    async fn direct_relational_bulk_loads_the_junction_table() {
        let server = Arc::new(
            MockServer::new()
                .with_external("cat.a", 501)
                .with_external("cat.b", 502),
        );
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let (_dir, cache) = cache();

        let mut schema = HashMap::new();
        schema.insert("name".to_string(), FieldDef::scalar(FieldKind::Char));
        schema.insert(
            "category_ids".to_string(),
            FieldDef::many2many("res.partner.category"),
        );
        let plan = build_plan(
            "res.partner",
            &[
                "id".to_string(),
                "name".to_string(),
                "category_ids/id".to_string(),
            ],
            &schema,
            &PlanOptions {
                direct_relations: true,
                ..Default::default()
            },
        )
        .unwrap();

        let mut id_map = HashMap::new();
        id_map.insert("r1".to_string(), 21);
        id_map.insert("r2".to_string(), 22);

        let outcome = run_pass2(
            &rpc,
            &cache,
            &m2m_dataset(),
            &plan,
            &id_map,
            100,
            1,
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.updated, 3);
        // The junction rows go through load, not create.
        assert!(server.created().is_empty());
        let loads: Vec<(String, usize)> = server
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                crate::rpc::mock::Call::Load { model, rows, .. } => Some((model, rows)),
                _ => None,
            })
            .collect();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].0, "res_partner_res_partner_category_rel");
        assert_eq!(loads[0].1, 3);
    }

    fn o2m_plan() -> ImportPlan {
        let mut schema = HashMap::new();
        schema.insert("name".to_string(), FieldDef::scalar(FieldKind::Char));
        schema.insert(
            "line_ids".to_string(),
            FieldDef::one2many("res.order.line", "order_id"),
        );
        build_plan(
            "res.order",
            &["id".to_string(), "name".to_string(), "line_ids".to_string()],
            &schema,
            &PlanOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn o2m_children_attach_with_create_commands() {
        let server = Arc::new(MockServer::new());
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let (_dir, cache) = cache();

        let dataset = Dataset::new(
            vec!["id".to_string(), "name".to_string(), "line_ids".to_string()],
            vec![vec![
                "o1".to_string(),
                "Order".to_string(),
                r#"[{"product": "widget", "qty": "2"}, {"product": "gear", "qty": "1"}]"#
                    .to_string(),
            ]],
        );
        let mut id_map = HashMap::new();
        id_map.insert("o1".to_string(), 31);

        let outcome = run_pass2(
            &rpc,
            &cache,
            &dataset,
            &o2m_plan(),
            &id_map,
            100,
            1,
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.updated, 1);
        let written = server.written();
        assert_eq!(written.len(), 1);
        let (_, ids, values) = &written[0];
        assert_eq!(ids, &vec![31]);
        let commands = values.get("line_ids").unwrap().as_array().unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0][0], json!(0));
        assert_eq!(commands[0][2]["product"], json!("widget"));
    }

    #[tokio::test]
    async fn invalid_o2m_json_fails_that_row_only() {
        let server = Arc::new(MockServer::new());
        let rpc = RpcPool::from_shared(vec![server.clone()]).unwrap();
        let (_dir, cache) = cache();

        let dataset = Dataset::new(
            vec!["id".to_string(), "name".to_string(), "line_ids".to_string()],
            vec![
                vec![
                    "o1".to_string(),
                    "Bad".to_string(),
                    "not json".to_string(),
                ],
                vec![
                    "o2".to_string(),
                    "Good".to_string(),
                    r#"[{"product": "widget"}]"#.to_string(),
                ],
            ],
        );
        let mut id_map = HashMap::new();
        id_map.insert("o1".to_string(), 31);
        id_map.insert("o2".to_string(), 32);

        let outcome = run_pass2(
            &rpc,
            &cache,
            &dataset,
            &o2m_plan(),
            &id_map,
            100,
            1,
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.fail_records.len(), 1);
        assert!(outcome.fail_records[0].reason.contains("invalid JSON"));
        assert_eq!(server.written().len(), 1);
    }
}
