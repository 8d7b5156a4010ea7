//! Two-pass import engine.
//!
//! # Control flow
//!
//! 1. **Schema**: introspected field definitions are read from the
//!    cache, falling back to a `fields_get` call (cached afterwards).
//! 2. **Plan**: the header is validated and deferred fields get their
//!    resolution strategies.
//! 3. **Pre-sort**: when the plan contains a self-reference, rows are
//!    reordered so hierarchy roots are created before their children.
//! 4. **Pass 1**: batched bulk creation with per-record fallback,
//!    producing the external-key to target-key id map. The map is
//!    persisted to the cache as a byproduct.
//! 5. **Pass 2**: deferred relations resolve through the id map and are
//!    applied with grouped writes and junction strategies.
//!
//! All batch-level work runs on the bounded worker pool; the only
//! blocking point is the barrier between the passes, because pass 2
//! needs the complete id map. Recoverable failures accumulate in the
//! fail file; the run's success flag is false exactly when a record
//! reached a terminal failed state or a pass aborted.

pub mod fail;
pub mod pass1;
pub mod pass2;
pub mod write;

use std::path::PathBuf;

use crate::cache::{CacheStore, generate_session_id};
use crate::dataset::{Dataset, base_field};
use crate::error::FlowError;
use crate::plan::{PlanOptions, build_plan};
use crate::rpc::{ObjectClient, RpcPool};
use crate::sort::sort_for_self_reference;

pub use fail::{FailFile, fail_file_name, retry_fail_file_name};
pub use pass1::Pass1Outcome;
pub use pass2::Pass2Outcome;
pub use write::{WriteOutcome, run_batch_write};

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_WRITE_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Records per batch in pass 1; ids per write call in pass 2.
    pub batch_size: usize,
    /// Concurrent workers per pass. Each worker takes its own handle
    /// from the connection pool.
    pub max_connection: usize,
    /// Column holding the stable external identifier; inferred as `id`
    /// when absent.
    pub unique_id_field: Option<String>,
    /// Source columns to leave out of every remote call.
    pub ignore: Vec<String>,
    /// Use the junction bulk-load path for many-to-many fields.
    pub direct_relations: bool,
    /// Skip the bulk load entirely and create records one by one. Used
    /// when re-running previously failed records.
    pub force_create: bool,
    /// Where failed rows are written. Defaults into the session
    /// directory derived from (model, header).
    pub fail_file: Option<PathBuf>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_connection: num_cpus::get().min(4),
            unique_id_field: None,
            ignore: Vec::new(),
            direct_relations: false,
            force_create: false,
            fail_file: None,
        }
    }
}

/// Final accounting for one run.
#[derive(Debug, Clone)]
pub struct ImportReport {
    pub total_records: usize,
    pub created_records: usize,
    pub updated_relations: usize,
    pub failed_records: usize,
    /// False exactly when at least one record-level failure reached a
    /// terminal state or a pass aborted.
    pub success: bool,
    pub fail_file: Option<PathBuf>,
}

/// Orchestrates plan, pre-sort and the two passes against a
/// caller-owned connection pool.
pub struct ImportEngine<C: ObjectClient> {
    rpc: RpcPool<C>,
    cache: CacheStore,
    options: ImportOptions,
}

impl<C: ObjectClient + 'static> ImportEngine<C> {
    pub fn new(
        rpc: RpcPool<C>,
        cache: CacheStore,
        options: ImportOptions,
    ) -> Result<Self, FlowError> {
        if options.max_connection < 1 {
            return Err(FlowError::Configuration(
                "max_connection must be a positive integer".to_string(),
            ));
        }
        if options.batch_size < 1 {
            return Err(FlowError::Configuration(
                "batch_size must be a positive integer".to_string(),
            ));
        }
        Ok(Self {
            rpc,
            cache,
            options,
        })
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    /// Imports a dataset into `model`: create in pass 1, attach
    /// deferred relations in pass 2.
    pub async fn run(&self, model: &str, dataset: Dataset) -> Result<ImportReport, FlowError> {
        let total_records = dataset.len();
        log::info!(
            "starting import of {total_records} records into '{model}' \
             (workers: {}, batch size: {})",
            self.options.max_connection,
            self.options.batch_size
        );

        let schema = match self.cache.load_fields(model) {
            Some(schema) => schema,
            None => {
                let schema = self.rpc.get().fields_get(model).await?;
                if let Err(err) = self.cache.save_fields(model, &schema) {
                    log::warn!("could not cache schema metadata for '{model}': {err}");
                }
                schema
            }
        };

        let plan = build_plan(
            model,
            &dataset.header,
            &schema,
            &PlanOptions {
                unique_id_field: self.options.unique_id_field.clone(),
                direct_relations: self.options.direct_relations,
            },
        )?;
        log::info!(
            "import plan for '{model}': {} deferred fields, {} strategies",
            plan.deferred.len(),
            plan.strategies.len()
        );

        // Self-referencing hierarchies import in one pass only if
        // parents are created before their children.
        let dataset = match plan.deferred_many2one().first() {
            Some(&field) => {
                let id_column = dataset
                    .header
                    .iter()
                    .find(|c| base_field(c) == plan.unique_id_field)
                    .cloned();
                let parent_column = dataset
                    .header
                    .iter()
                    .find(|c| base_field(c) == field)
                    .cloned();
                match (id_column, parent_column) {
                    (Some(id_column), Some(parent_column)) => {
                        sort_for_self_reference(&dataset, &id_column, &parent_column)
                            .unwrap_or(dataset)
                    }
                    _ => dataset,
                }
            }
            None => dataset,
        };

        let fail_path = match &self.options.fail_file {
            Some(path) => path.clone(),
            None => {
                let session = generate_session_id(model, &[], &dataset.header);
                self.cache
                    .session_dir(&session)?
                    .join(fail_file_name(model))
            }
        };
        let fail_file = FailFile::create(&fail_path, &dataset.header)?;

        // Deferred fields are filtered out of pass 1 alongside any
        // operator exclusions; fail records keep the full source row.
        let mut pass1_ignore = plan.deferred.clone();
        pass1_ignore.extend(self.options.ignore.iter().cloned());
        let pass1 = pass1::run_pass1(
            &self.rpc,
            model,
            &dataset.header,
            &dataset.rows,
            &plan.unique_id_field,
            &pass1_ignore,
            self.options.batch_size,
            self.options.max_connection,
            self.options.force_create,
            Some(&fail_file),
        )
        .await?;
        log::info!(
            "pass 1 complete: {} created, {} failed",
            pass1.id_map.len(),
            pass1.fail_records.len()
        );
        if pass1.aborted {
            log::error!("import aborted during pass 1");
            return Ok(ImportReport {
                total_records,
                created_records: pass1.id_map.len(),
                updated_relations: 0,
                failed_records: pass1.fail_records.len(),
                success: false,
                fail_file: Some(fail_path),
            });
        }

        if let Err(err) = self.cache.save_id_map(model, &pass1.id_map) {
            log::warn!("could not cache id map for '{model}': {err}");
        }

        let mut updated_relations = 0;
        let mut pass2_failures = 0;
        let mut aborted = false;
        if plan.has_deferred() {
            let pass2 = pass2::run_pass2(
                &self.rpc,
                &self.cache,
                &dataset,
                &plan,
                &pass1.id_map,
                self.options.batch_size,
                self.options.max_connection,
                Some(&fail_file),
            )
            .await?;
            log::info!(
                "pass 2 complete: {} relations updated, {} failed",
                pass2.updated,
                pass2.fail_records.len()
            );
            updated_relations = pass2.updated;
            pass2_failures = pass2.fail_records.len();
            aborted = pass2.aborted;
        }

        let failed_records = pass1.fail_records.len() + pass2_failures;
        let success = !aborted && failed_records == 0;
        if success {
            log::info!("import of '{model}' finished successfully");
        } else {
            log::warn!(
                "import of '{model}' finished with {failed_records} failed records \
                 (see {})",
                fail_path.display()
            );
        }
        Ok(ImportReport {
            total_records,
            created_records: pass1.id_map.len(),
            updated_relations,
            failed_records,
            success,
            fail_file: Some(fail_path),
        })
    }

    /// Standalone update path: no creation, just grouped multi-id
    /// writes of the given value columns.
    pub async fn update(&self, model: &str, dataset: &Dataset) -> Result<ImportReport, FlowError> {
        let fail_path = match &self.options.fail_file {
            Some(path) => path.clone(),
            None => {
                let session = generate_session_id(model, &[], &dataset.header);
                self.cache
                    .session_dir(&session)?
                    .join(fail_file_name(model))
            }
        };
        let fail_file = FailFile::create(&fail_path, &dataset.header)?;

        let batch_size = if self.options.batch_size == DEFAULT_BATCH_SIZE {
            DEFAULT_WRITE_BATCH_SIZE
        } else {
            self.options.batch_size
        };
        let outcome = run_batch_write(
            &self.rpc,
            model,
            dataset,
            batch_size,
            self.options.max_connection,
            Some(&fail_file),
        )
        .await?;
        Ok(ImportReport {
            total_records: outcome.processed,
            created_records: 0,
            updated_relations: outcome.updated,
            failed_records: outcome.fail_records.len(),
            success: outcome.success(),
            fail_file: Some(fail_path),
        })
    }
}
