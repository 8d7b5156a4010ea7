//! Dependency and strategy planning.
//!
//! Before any record is sent, the source header is cross-referenced with
//! the remote schema to decide which fields cannot be set at creation
//! time and how each of them will be resolved in the second pass.

use std::collections::HashMap;

use crate::dataset::base_field;
use crate::error::FlowError;
use crate::rpc::{FieldDef, FieldKind};

/// Junction metadata carried by every deferral strategy. When schema
/// introspection does not report it, it is derived from the model and
/// field names by convention instead of failing the plan.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationInfo {
    /// Model on the related side.
    pub relation: String,
    /// Junction table backing the relation.
    pub relation_table: String,
    /// Owning-side key column in the junction table.
    pub owning_key: String,
    /// Related-side key column in the junction table.
    pub related_key: String,
}

/// How a deferred collection field is applied in pass 2.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Insert junction rows through individual create calls.
    WriteTuple(RelationInfo),
    /// Bulk-write the junction table through the generic load path.
    DirectRelational(RelationInfo),
    /// Attach child records with a single relational command inside a
    /// write call.
    WriteO2mTuple(RelationInfo),
}

impl Strategy {
    pub fn relation(&self) -> &RelationInfo {
        match self {
            Strategy::WriteTuple(info)
            | Strategy::DirectRelational(info)
            | Strategy::WriteO2mTuple(info) => info,
        }
    }
}

/// The immutable output of planning: which fields are deferred to pass 2
/// and how each one is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportPlan {
    pub model: String,
    pub unique_id_field: String,
    /// Deferred fields in header order. Fields without an entry in
    /// `strategies` are self-referencing many-to-one columns, resolved
    /// through grouped writes.
    pub deferred: Vec<String>,
    pub strategies: HashMap<String, Strategy>,
}

impl ImportPlan {
    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Deferred many-to-one fields (no collection strategy attached).
    pub fn deferred_many2one(&self) -> Vec<&str> {
        self.deferred
            .iter()
            .filter(|field| !self.strategies.contains_key(*field))
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Column holding the stable external identifier. When absent and
    /// deferral requires one, a literal `id` column is inferred.
    pub unique_id_field: Option<String>,
    /// Upgrade many-to-many fields to the high-throughput junction bulk
    /// load instead of individual junction creates.
    pub direct_relations: bool,
}

/// Builds the import plan for one model. Pure and deterministic: the
/// same schema and header always produce the same plan.
pub fn build_plan(
    model: &str,
    header: &[String],
    schema: &HashMap<String, FieldDef>,
    options: &PlanOptions,
) -> Result<ImportPlan, FlowError> {
    let unknown: Vec<&String> = header
        .iter()
        .filter(|column| {
            let base = base_field(column);
            base != "id" && base != ".id" && !schema.contains_key(base)
        })
        .collect();
    if !unknown.is_empty() {
        let listing: Vec<String> = unknown
            .iter()
            .map(|column| format!("  - '{column}' is not a valid field on model '{model}'"))
            .collect();
        return Err(FlowError::Validation(format!(
            "columns in the source header do not exist on model '{model}':\n{}",
            listing.join("\n")
        )));
    }

    let mut deferred: Vec<String> = Vec::new();
    let mut strategies = HashMap::new();
    for column in header {
        let base = base_field(column);
        let Some(def) = schema.get(base) else { continue };
        if deferred.iter().any(|f| f == base) {
            continue;
        }
        match def.kind {
            FieldKind::Many2one if def.relation.as_deref() == Some(model) => {
                log::debug!("field '{base}' self-references '{model}', deferring to pass 2");
                deferred.push(base.to_string());
            }
            FieldKind::Many2many => {
                let info = relation_info(model, base, def);
                let strategy = if options.direct_relations {
                    Strategy::DirectRelational(info)
                } else {
                    Strategy::WriteTuple(info)
                };
                log::debug!("field '{base}' is many-to-many, deferring to pass 2");
                deferred.push(base.to_string());
                strategies.insert(base.to_string(), strategy);
            }
            FieldKind::One2many => {
                log::debug!("field '{base}' is one-to-many, deferring to pass 2");
                deferred.push(base.to_string());
                strategies.insert(
                    base.to_string(),
                    Strategy::WriteO2mTuple(relation_info(model, base, def)),
                );
            }
            _ => {}
        }
    }

    let unique_id_field = match &options.unique_id_field {
        Some(field) => {
            if !header.iter().any(|column| base_field(column) == field) {
                return Err(FlowError::Configuration(format!(
                    "designated unique id column '{field}' is not in the source header"
                )));
            }
            field.clone()
        }
        None => {
            // Records are correlated across passes through this column,
            // so it is required even for single-pass runs.
            if !header.iter().any(|column| base_field(column) == "id") {
                return Err(FlowError::Configuration(format!(
                    "no unique id column designated and the source header has no 'id' column \
                     (model '{model}'); specify one explicitly"
                )));
            }
            "id".to_string()
        }
    };

    Ok(ImportPlan {
        model: model.to_string(),
        unique_id_field,
        deferred,
        strategies,
    })
}

fn flat(model: &str) -> String {
    model.replace('.', "_")
}

fn relation_info(model: &str, field: &str, def: &FieldDef) -> RelationInfo {
    let relation = def.relation.clone().unwrap_or_else(|| {
        // Heuristic for schemas that omit the related model: the field
        // name minus its plural id suffix.
        let guess = field
            .strip_suffix("_ids")
            .or_else(|| field.strip_suffix("_id"))
            .unwrap_or(field)
            .to_string();
        log::warn!(
            "field '{field}' on '{model}' has no relation metadata; assuming related model '{guess}'"
        );
        guess
    });
    let relation_table = def
        .relation_table
        .clone()
        .unwrap_or_else(|| format!("{}_{}_rel", flat(model), flat(&relation)));
    let owning_key = def
        .relation_field
        .clone()
        .unwrap_or_else(|| format!("{}_id", flat(model)));
    let related_key = format!("{}_id", flat(&relation));
    RelationInfo {
        relation,
        relation_table,
        owning_key,
        related_key,
    }
}
