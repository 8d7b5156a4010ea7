//! Pre-sort for self-referencing hierarchies.

use std::collections::HashSet;

use rayon::prelude::*;

use crate::dataset::Dataset;

/// Reorders rows so that hierarchy roots precede children.
///
/// Detection first: every non-empty value in `parent_column` must exist
/// as a value of `id_column` within the same row set, otherwise the
/// column merely looks parent-shaped and this is a no-op (`None`). When
/// genuine, rows with an empty parent value are stably moved in front of
/// all others without otherwise disturbing relative order.
///
/// This is one level of precedence, not a topological sort; deep chains
/// rely on the second pass resolving ids through the id map.
pub fn sort_for_self_reference(
    dataset: &Dataset,
    id_column: &str,
    parent_column: &str,
) -> Option<Dataset> {
    let id_index = dataset.column_index(id_column)?;
    let parent_index = dataset.column_index(parent_column)?;
    if dataset.rows.is_empty() {
        return None;
    }

    let ids: HashSet<&str> = dataset
        .rows
        .iter()
        .filter_map(|row| row.get(id_index))
        .map(String::as_str)
        .collect();

    let mut any_parent = false;
    for row in &dataset.rows {
        if row.get(parent_index).is_some_and(|v| !v.is_empty()) {
            any_parent = true;
            break;
        }
    }
    if !any_parent {
        return None;
    }

    let genuine = dataset.rows.par_iter().all(|row| {
        match row.get(parent_index) {
            None => true,
            Some(value) if value.is_empty() => true,
            Some(value) => ids.contains(value.as_str()),
        }
    });
    if !genuine {
        log::debug!(
            "column '{parent_column}' does not self-reference '{id_column}' within this row set; \
             skipping pre-sort"
        );
        return None;
    }

    let mut roots = Vec::with_capacity(dataset.rows.len());
    let mut children = Vec::new();
    for row in &dataset.rows {
        if row.get(parent_index).is_none_or(|v| v.is_empty()) {
            roots.push(row.clone());
        } else {
            children.push(row.clone());
        }
    }
    log::info!(
        "pre-sorted {} rows for self-referencing hierarchy on '{parent_column}' ({} roots)",
        dataset.rows.len(),
        roots.len()
    );
    roots.extend(children);
    Some(Dataset::new(dataset.header.clone(), roots))
}
