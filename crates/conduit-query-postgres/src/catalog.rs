//! Catalog queries. Identifier columns are cast to `text` so they decode as `String`.

pub(crate) const USER_TABLES: &str = r#"
    SELECT t.table_schema::text, t.table_name::text
    FROM information_schema.tables t
    WHERE t.table_type = 'BASE TABLE'
      AND t.table_schema NOT IN ('pg_catalog', 'information_schema')
      AND t.table_schema NOT LIKE 'pg_toast%'
    ORDER BY t.table_schema, t.table_name
"#;

pub(crate) const COLUMNS: &str = r#"
    SELECT
        c.column_name::text,
        c.data_type::text,
        c.is_nullable = 'YES' AS nullable,
        c.column_default::text,
        EXISTS (
            SELECT 1
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON kcu.constraint_name = tc.constraint_name
             AND kcu.table_schema = tc.table_schema
             AND kcu.table_name = tc.table_name
            WHERE tc.constraint_type = 'PRIMARY KEY'
              AND tc.table_schema = c.table_schema
              AND tc.table_name = c.table_name
              AND kcu.column_name = c.column_name
        ) AS is_primary_key,
        (COALESCE(c.column_default, '') LIKE 'nextval(%' OR c.is_identity = 'YES') AS is_auto_increment
    FROM information_schema.columns c
    WHERE c.table_schema = $1 AND c.table_name = $2
    ORDER BY c.ordinal_position
"#;

/// `$1` is a quoted, schema-qualified relation name
pub(crate) const PRIMARY_KEY: &str = r#"
    SELECT a.attname::text
    FROM pg_index i
    JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
    WHERE i.indrelid = $1::text::regclass AND i.indisprimary
    ORDER BY array_position(i.indkey::int2[], a.attnum)
"#;

pub(crate) const INDEXES: &str = r#"
    SELECT
        ic.relname::text,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS columns,
        i.indisunique,
        i.indisprimary
    FROM pg_index i
    JOIN pg_class ic ON ic.oid = i.indexrelid
    WHERE i.indrelid = $1::text::regclass
    ORDER BY ic.relname
"#;

pub(crate) const FOREIGN_KEYS: &str = r#"
    SELECT
        con.conname::text,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS columns,
        ref.relname::text,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS referenced_columns,
        con.confupdtype::text,
        con.confdeltype::text
    FROM pg_constraint con
    JOIN pg_class ref ON ref.oid = con.confrelid
    WHERE con.contype = 'f' AND con.conrelid = $1::text::regclass
    ORDER BY con.conname
"#;

/// Planner estimate; exact counts are too slow on large tables
pub(crate) const ROW_ESTIMATE: &str = r#"
    SELECT GREATEST(c.reltuples, 0)::bigint
    FROM pg_class c
    WHERE c.oid = $1::text::regclass
"#;

pub(crate) const VIEWS: &str = r#"
    SELECT v.table_schema::text, v.table_name::text, v.view_definition::text
    FROM information_schema.views v
    WHERE v.table_schema NOT IN ('pg_catalog', 'information_schema')
    ORDER BY v.table_schema, v.table_name
"#;

pub(crate) const VIEW_DEFINITION: &str = "SELECT pg_get_viewdef($1::text::regclass, true)";

pub(crate) const ROUTINES: &str = r#"
    SELECT
        n.nspname::text,
        p.proname::text,
        CASE p.prokind WHEN 'p' THEN 'procedure' ELSE 'function' END,
        pg_get_function_result(p.oid),
        pg_get_function_arguments(p.oid),
        pg_get_functiondef(p.oid)
    FROM pg_proc p
    JOIN pg_namespace n ON n.oid = p.pronamespace
    WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
      AND p.prokind IN ('f', 'p')
    ORDER BY n.nspname, p.proname
"#;

pub(crate) const TRIGGERS: &str = r#"
    SELECT
        t.trigger_name::text,
        t.event_object_table::text,
        t.action_timing::text,
        t.event_manipulation::text,
        t.action_statement::text
    FROM information_schema.triggers t
    WHERE t.trigger_schema NOT IN ('pg_catalog', 'information_schema')
      AND ($1::text IS NULL OR t.event_object_table = $1::text)
    ORDER BY t.event_object_table, t.trigger_name
"#;

pub(crate) const USERS: &str = r#"
    SELECT
        r.rolname::text,
        r.rolsuper,
        r.rolcanlogin,
        ARRAY(
            SELECT g.rolname::text
            FROM pg_auth_members m
            JOIN pg_roles g ON g.oid = m.roleid
            WHERE m.member = r.oid
            ORDER BY g.rolname
        )
    FROM pg_roles r
    WHERE r.rolcanlogin AND r.rolname !~ '^pg_'
    ORDER BY r.rolname
"#;

pub(crate) const ROLES: &str = r#"
    SELECT
        r.rolname::text,
        r.rolsuper,
        r.rolcanlogin,
        ARRAY(
            SELECT u.rolname::text
            FROM pg_auth_members m
            JOIN pg_roles u ON u.oid = m.member
            WHERE m.roleid = r.oid
            ORDER BY u.rolname
        )
    FROM pg_roles r
    WHERE r.rolname !~ '^pg_'
    ORDER BY r.rolname
"#;

/// Referential action codes from `pg_constraint.confupdtype` / `confdeltype`
pub(crate) fn referential_action(code: &str) -> Option<String> {
    let action = match code {
        "a" => "NO ACTION",
        "r" => "RESTRICT",
        "c" => "CASCADE",
        "n" => "SET NULL",
        "d" => "SET DEFAULT",
        _ => return None,
    };
    Some(action.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referential_action() {
        assert_eq!(referential_action("c").as_deref(), Some("CASCADE"));
        assert_eq!(referential_action("a").as_deref(), Some("NO ACTION"));
        assert_eq!(referential_action("?"), None);
    }
}
