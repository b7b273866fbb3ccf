//! Change-capture DDL: the change-log table and the three AFTER-row
//! triggers installed on a synced table.
//!
//! Each trigger stamps the row with the session write-tag. The tag lives in
//! the `_sync_source_tag` table, populated only inside the adapter's write
//! transaction; any other writer leaves it empty, so their rows fall back to
//! the literal `external`.

use super::{quote_ident, CHANGE_LOG_TABLE, EXTERNAL_TAG, SOURCE_TAG_TABLE};
use crate::config::ColumnMapping;

/// Statements that create the change-log table, its scan index, the session
/// tag table, and (re)create the three row triggers for `table`.
///
/// Triggers are dropped first so a mapping change refreshes the captured
/// column set.
pub fn cdc_statements(table: &str, mapping: &ColumnMapping) -> Vec<String> {
    let quoted = quote_ident(table);
    let mut statements = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {CHANGE_LOG_TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                op TEXT NOT NULL,
                row_snapshot TEXT NOT NULL,
                source_tag TEXT,
                changed_at TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{CHANGE_LOG_TABLE}_scan
             ON {CHANGE_LOG_TABLE} (table_name, processed, id)"
        ),
        format!("CREATE TABLE IF NOT EXISTS {SOURCE_TAG_TABLE} (tag TEXT NOT NULL)"),
    ];

    for suffix in ["sync_insert", "sync_update", "sync_delete"] {
        statements.push(format!(
            "DROP TRIGGER IF EXISTS {}",
            quote_ident(&format!("{table}_{suffix}"))
        ));
    }

    let full_snapshot = snapshot_expr("NEW", mapping.column_names());
    let pk_snapshot_old = snapshot_expr("OLD", std::iter::once(mapping.primary_key_column()));

    statements.push(trigger_statement(
        table,
        "sync_insert",
        &format!("AFTER INSERT ON {quoted}"),
        "INSERT",
        &full_snapshot,
    ));
    statements.push(trigger_statement(
        table,
        "sync_update",
        &format!("AFTER UPDATE ON {quoted}"),
        "UPDATE",
        &full_snapshot,
    ));
    statements.push(trigger_statement(
        table,
        "sync_delete",
        &format!("AFTER DELETE ON {quoted}"),
        "DELETE",
        &pk_snapshot_old,
    ));

    statements
}

fn trigger_statement(
    table: &str,
    suffix: &str,
    event: &str,
    op: &str,
    snapshot: &str,
) -> String {
    format!(
        "CREATE TRIGGER {name} {event}
         BEGIN
            INSERT INTO {CHANGE_LOG_TABLE} (table_name, op, row_snapshot, source_tag, changed_at, processed)
            VALUES (
                '{table_lit}',
                '{op}',
                {snapshot},
                COALESCE((SELECT tag FROM {SOURCE_TAG_TABLE} LIMIT 1), '{EXTERNAL_TAG}'),
                strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                0
            );
         END",
        name = quote_ident(&format!("{table}_{suffix}")),
        table_lit = escape_literal(table),
    )
}

/// `json_object('id', NEW."id", 'name', NEW."name", ...)` for the given
/// row alias and columns.
fn snapshot_expr<'a>(alias: &str, columns: impl Iterator<Item = &'a str>) -> String {
    let pairs: Vec<String> = columns
        .map(|c| format!("'{}', {alias}.{}", escape_literal(c), quote_ident(c)))
        .collect();
    format!("json_object({})", pairs.join(", "))
}

fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> ColumnMapping {
        ColumnMapping::new(vec![('A', "id".into()), ('B', "name".into())]).expect("mapping")
    }

    #[test]
    fn generates_three_triggers_after_ddl() {
        let statements = cdc_statements("users", &mapping());
        let creates: Vec<&String> = statements
            .iter()
            .filter(|s| s.contains("CREATE TRIGGER"))
            .collect();
        assert_eq!(creates.len(), 3);
        assert!(creates[0].contains("AFTER INSERT ON \"users\""));
        assert!(creates[1].contains("AFTER UPDATE ON \"users\""));
        assert!(creates[2].contains("AFTER DELETE ON \"users\""));
    }

    #[test]
    fn delete_snapshot_is_primary_key_only() {
        let statements = cdc_statements("users", &mapping());
        let delete = statements
            .iter()
            .find(|s| s.contains("AFTER DELETE"))
            .expect("delete trigger");
        assert!(delete.contains("json_object('id', OLD.\"id\")"));
        assert!(!delete.contains("OLD.\"name\""));
    }

    #[test]
    fn unset_tag_defaults_to_external() {
        let statements = cdc_statements("users", &mapping());
        let insert = statements
            .iter()
            .find(|s| s.contains("AFTER INSERT"))
            .expect("insert trigger");
        assert!(insert.contains("COALESCE((SELECT tag FROM _sync_source_tag LIMIT 1), 'external')"));
    }
}
