//! Catalog queries against an open SQLite connection.
//!
//! Uses the table-valued pragma functions (`pragma_table_info(?1)` etc.) so
//! table names are bound as parameters instead of spliced into SQL.

use conduit_query::plan::{build_plan_tree, render_plan_text, PlanRow};
use conduit_query::{
    ColumnInfo, ExplainResult, ForeignKeyInfo, IndexInfo, SqlDialect, TableInfo, TriggerInfo,
    ViewInfo,
};
use rusqlite::{Connection, OptionalExtension};

pub(crate) fn table_names(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

fn create_statement(conn: &Connection, table: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .map(Option::flatten)
}

pub(crate) fn columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ColumnInfo>> {
    let autoincrement = create_statement(conn, table)?
        .map(|sql| sql.to_ascii_uppercase().contains("AUTOINCREMENT"))
        .unwrap_or(false);

    let mut stmt = conn.prepare(
        "SELECT name, \"type\", \"notnull\", dflt_value, pk \
         FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map([table], |row| {
            let pk: i64 = row.get(4)?;
            Ok(ColumnInfo {
                name: row.get(0)?,
                data_type: row.get(1)?,
                nullable: row.get::<_, i64>(2)? == 0,
                default_value: row.get(3)?,
                is_primary_key: pk > 0,
                is_auto_increment: pk > 0 && autoincrement,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Primary key columns in key order
pub(crate) fn primary_key(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk",
    )?;
    let names = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

pub(crate) fn indexes(conn: &Connection, table: &str) -> rusqlite::Result<Vec<IndexInfo>> {
    let mut list = conn.prepare("SELECT name, \"unique\", origin FROM pragma_index_list(?1)")?;
    let entries = list
        .query_map([table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? != 0,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let mut indexes = Vec::with_capacity(entries.len());
    for (name, unique, origin) in entries {
        // Expression indexes report NULL column names
        let columns = info
            .query_map([&name], |row| row.get::<_, Option<String>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        indexes.push(IndexInfo {
            name,
            columns,
            unique,
            primary: origin == "pk",
        });
    }
    Ok(indexes)
}

pub(crate) fn foreign_keys(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ForeignKeyInfo>> {
    let mut stmt = conn.prepare(
        "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete \
         FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
    )?;
    let rows = stmt
        .query_map([table], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut keys: Vec<(i64, ForeignKeyInfo)> = Vec::new();
    for (id, referenced, from, to, on_update, on_delete) in rows {
        match keys.last_mut() {
            Some((current, key)) if *current == id => {
                key.columns.push(from);
                key.referenced_columns.push(to.unwrap_or_default());
            }
            _ => keys.push((
                id,
                ForeignKeyInfo {
                    name: format!("fk_{}_{}", table, id),
                    columns: vec![from],
                    referenced_table: referenced,
                    referenced_columns: vec![to.unwrap_or_default()],
                    on_update,
                    on_delete,
                },
            )),
        }
    }
    Ok(keys.into_iter().map(|(_, key)| key).collect())
}

pub(crate) fn row_count(conn: &Connection, table: &str) -> rusqlite::Result<u64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}",
        SqlDialect::SQLITE.quote_identifier(table)
    );
    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

pub(crate) fn table_info(conn: &Connection, table: &str) -> rusqlite::Result<TableInfo> {
    Ok(TableInfo {
        name: table.to_string(),
        schema: Some("main".to_string()),
        columns: columns(conn, table)?,
        indexes: indexes(conn, table)?,
        foreign_keys: foreign_keys(conn, table)?,
        row_count: Some(row_count(conn, table)?),
    })
}

pub(crate) fn views(conn: &Connection) -> rusqlite::Result<Vec<ViewInfo>> {
    let mut stmt =
        conn.prepare("SELECT name, sql FROM sqlite_master WHERE type = 'view' ORDER BY name")?;
    let views = stmt
        .query_map([], |row| {
            Ok(ViewInfo {
                name: row.get(0)?,
                schema: Some("main".to_string()),
                definition: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(views)
}

pub(crate) fn view_definition(conn: &Connection, view: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'view' AND name = ?1",
        [view],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .map(Option::flatten)
}

pub(crate) fn triggers(conn: &Connection, table: Option<&str>) -> rusqlite::Result<Vec<TriggerInfo>> {
    let mut stmt = conn.prepare(
        "SELECT name, tbl_name, sql FROM sqlite_master \
         WHERE type = 'trigger' AND (?1 IS NULL OR tbl_name = ?1) \
         ORDER BY name",
    )?;
    let triggers = stmt
        .query_map([table], |row| {
            let definition: Option<String> = row.get(2)?;
            let (timing, event) = definition
                .as_deref()
                .map(trigger_timing_and_event)
                .unwrap_or((None, None));
            Ok(TriggerInfo {
                name: row.get(0)?,
                table: row.get(1)?,
                timing,
                event,
                definition,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(triggers)
}

/// Timing and event keywords from the trigger header (the part before `ON`)
fn trigger_timing_and_event(sql: &str) -> (Option<String>, Option<String>) {
    let upper = sql.to_ascii_uppercase();
    let header: Vec<&str> = upper
        .split_whitespace()
        .take_while(|token| *token != "ON")
        .collect();

    let timing = if header.contains(&"INSTEAD") {
        Some("INSTEAD OF")
    } else if header.contains(&"AFTER") {
        Some("AFTER")
    } else if header.contains(&"BEFORE") {
        Some("BEFORE")
    } else {
        None
    };
    let event = ["INSERT", "UPDATE", "DELETE"]
        .into_iter()
        .find(|event| header.contains(event));

    (timing.map(String::from), event.map(String::from))
}

pub(crate) fn explain(conn: &Connection, query: &str) -> rusqlite::Result<ExplainResult> {
    let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {}", query))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PlanRow {
                id: row.get(0)?,
                parent: row.get(1)?,
                detail: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(ExplainResult {
        plan: build_plan_tree(&rows),
        raw: render_plan_text(&rows),
    })
}
