//! Schema reconciliation between source and target tables
//!
//! Periodically diffs the column catalogs of one table on each side and
//! converges the target with ALTER statements. Within a pass, additions run
//! before drops and drops before type modifications, so a rename expressed
//! as drop-plus-add never races a column lookup elsewhere. Each ALTER runs
//! as its own transaction on the target.

use crate::apply::DbHandle;
use crate::errors::BridgeResult;
use crate::render::{Renderer, map_type};
use std::collections::HashMap;
use tracing::{error, info};

/// Compute the ordered ALTER statements that converge `target_cols` to
/// `source_cols`. Pure planning: no database access, deterministic output
/// order (ADDs, then DROPs, then MODIFYs, each in source/target catalog
/// order). Type comparison happens after the dialect mapping, so `integer`
/// on the source matches an `int` already on the target.
pub fn plan_alters(
    renderer: &Renderer,
    table: &str,
    source_cols: &[(String, String)],
    target_cols: &[(String, String)],
) -> Vec<String> {
    let source_by_name: HashMap<&str, &str> = source_cols
        .iter()
        .map(|(name, ty)| (name.as_str(), ty.as_str()))
        .collect();
    let target_by_name: HashMap<&str, &str> = target_cols
        .iter()
        .map(|(name, ty)| (name.as_str(), ty.as_str()))
        .collect();

    let mut statements = Vec::new();

    for (name, declared) in source_cols {
        if !target_by_name.contains_key(name.as_str()) {
            statements.push(renderer.add_column(table, name, declared));
        }
    }

    for (name, _) in target_cols {
        if !source_by_name.contains_key(name.as_str()) {
            statements.push(renderer.drop_column(table, name));
        }
    }

    for (name, declared) in source_cols {
        if let Some(&target_type) = target_by_name.get(name.as_str())
            && map_type(declared) != map_type(target_type)
        {
            statements.push(renderer.modify_column(table, name, declared));
        }
    }

    statements
}

/// One reconciliation pass for a replication pair's table. Fetches both
/// column catalogs, plans the ALTERs, and executes them on the target.
/// A rejected ALTER logs and does not stop the rest of the pass. Returns
/// the number of statements applied; an unchanged pair applies zero.
pub async fn reconcile_table(
    source: &mut dyn DbHandle,
    target: &mut dyn DbHandle,
    renderer: &Renderer,
    table_source: &str,
    table_dest: &str,
) -> BridgeResult<usize> {
    let source_cols = source.table_columns(table_source).await?;
    let target_cols = target.table_columns(table_dest).await?;

    let plan = plan_alters(renderer, table_dest, &source_cols, &target_cols);
    let mut applied = 0;
    for sql in &plan {
        match target.execute(sql).await {
            Ok(_) => {
                info!("Schema change applied: {sql}");
                applied += 1;
            }
            Err(e) => error!("Schema change rejected by target: {sql}: {e}"),
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Dialect;

    fn cols(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, t)| (n.to_string(), t.to_string()))
            .collect()
    }

    #[test]
    fn adds_missing_column() {
        let renderer = Renderer::new(Dialect::Postgresql);
        let source = cols(&[
            ("id", "integer"),
            ("name", "character varying"),
            ("age", "integer"),
        ]);
        let target = cols(&[("id", "integer"), ("name", "character varying")]);

        let plan = plan_alters(&renderer, "t", &source, &target);
        assert_eq!(plan, vec!["ALTER TABLE t ADD COLUMN age int;"]);
    }

    #[test]
    fn second_pass_on_converged_tables_is_empty() {
        let renderer = Renderer::new(Dialect::Postgresql);
        let source = cols(&[("id", "integer"), ("age", "integer")]);
        // what information_schema reports after the ADD landed
        let converged = cols(&[("id", "integer"), ("age", "integer")]);
        assert!(plan_alters(&renderer, "t", &source, &converged).is_empty());
    }

    #[test]
    fn mapped_type_names_compare_equal() {
        let renderer = Renderer::new(Dialect::Mysql);
        // source says "integer", a mysql target already reports "int"
        let source = cols(&[("id", "integer"), ("name", "character varying")]);
        let target = cols(&[("id", "int"), ("name", "varchar")]);
        assert!(plan_alters(&renderer, "t", &source, &target).is_empty());
    }

    #[test]
    fn modify_emits_dialect_syntax_after_mapping() {
        let renderer = Renderer::new(Dialect::Mysql);
        let source = cols(&[("id", "integer")]);
        let target = cols(&[("id", "bigint")]);
        let plan = plan_alters(&renderer, "t", &source, &target);
        assert_eq!(plan, vec!["ALTER TABLE t MODIFY id int;"]);
    }

    #[test]
    fn adds_precede_drops_precede_modifies() {
        let renderer = Renderer::new(Dialect::Postgresql);
        let source = cols(&[("id", "bigint"), ("email", "character varying")]);
        let target = cols(&[("id", "integer"), ("nickname", "character varying")]);

        let plan = plan_alters(&renderer, "t", &source, &target);
        assert_eq!(
            plan,
            vec![
                "ALTER TABLE t ADD COLUMN email varchar;",
                "ALTER TABLE t DROP COLUMN nickname;",
                "ALTER TABLE t ALTER COLUMN id TYPE bigint;",
            ]
        );
    }

    #[test]
    fn multiple_adds_keep_source_catalog_order() {
        let renderer = Renderer::new(Dialect::Postgresql);
        let source = cols(&[("a", "integer"), ("b", "integer"), ("c", "integer")]);
        let target = cols(&[("b", "integer")]);
        let plan = plan_alters(&renderer, "t", &source, &target);
        assert_eq!(
            plan,
            vec![
                "ALTER TABLE t ADD COLUMN a int;",
                "ALTER TABLE t ADD COLUMN c int;",
            ]
        );
    }
}
