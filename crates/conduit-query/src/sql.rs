//! Statement classification and row-level statement builders shared by SQL adapters.

use crate::error::{DataError, Result};
use crate::types::DataRow;

/// Whether a statement reads rows or mutates state
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StatementKind {
    Read,
    Write,
}

/// Classify a statement by its leading keyword.
///
/// Leading whitespace, `--` line comments, `/* */` block comments and opening
/// parentheses are skipped before the keyword is compared against `read_keywords`.
pub fn classify_statement(sql: &str, read_keywords: &[&str]) -> StatementKind {
    let keyword = leading_keyword(sql).to_ascii_uppercase();
    if read_keywords.iter().any(|k| k.eq_ignore_ascii_case(&keyword)) {
        StatementKind::Read
    } else {
        StatementKind::Write
    }
}

fn leading_keyword(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = trimmed.strip_prefix("--") {
            rest = after.find('\n').map(|i| &after[i + 1..]).unwrap_or("");
        } else if let Some(after) = trimmed.strip_prefix("/*") {
            rest = after.find("*/").map(|i| &after[i + 2..]).unwrap_or("");
        } else {
            rest = trimmed;
            break;
        }
    }
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    &rest[..end]
}

/// Parameter placeholder syntax
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PlaceholderStyle {
    /// `?`
    QuestionMark,
    /// `$1`, `$2`, ...
    Numbered,
}

/// Identifier quoting and parameter style of one SQL backend
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SqlDialect {
    pub placeholder: PlaceholderStyle,
    pub quote: char,
}

impl SqlDialect {
    pub const SQLITE: SqlDialect = SqlDialect {
        placeholder: PlaceholderStyle::QuestionMark,
        quote: '"',
    };

    pub const POSTGRES: SqlDialect = SqlDialect {
        placeholder: PlaceholderStyle::Numbered,
        quote: '"',
    };

    pub const MYSQL: SqlDialect = SqlDialect {
        placeholder: PlaceholderStyle::QuestionMark,
        quote: '`',
    };

    pub fn quote_identifier(&self, name: &str) -> String {
        let doubled = format!("{0}{0}", self.quote);
        format!(
            "{q}{}{q}",
            name.replace(self.quote, &doubled),
            q = self.quote
        )
    }

    /// Placeholder for the 1-based parameter `index`
    pub fn placeholder(&self, index: usize) -> String {
        match self.placeholder {
            PlaceholderStyle::QuestionMark => "?".to_string(),
            PlaceholderStyle::Numbered => format!("${}", index),
        }
    }

    pub fn select_page(&self, table: &str, limit: usize, offset: usize) -> String {
        format!(
            "SELECT * FROM {} LIMIT {} OFFSET {}",
            self.quote_identifier(table),
            limit,
            offset
        )
    }

    pub fn count_rows(&self, table: &str) -> String {
        format!("SELECT COUNT(*) AS count FROM {}", self.quote_identifier(table))
    }

    pub fn insert(&self, table: &str, values: &DataRow) -> Result<(String, Vec<serde_json::Value>)> {
        if values.is_empty() {
            return Err(DataError::QueryFailed(format!(
                "insert into {} requires at least one column value",
                table
            )));
        }

        let entries = sorted(values);
        let columns: Vec<String> = entries
            .iter()
            .map(|(name, _)| self.quote_identifier(name))
            .collect();
        let placeholders: Vec<String> = (1..=entries.len()).map(|i| self.placeholder(i)).collect();

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote_identifier(table),
            columns.join(", "),
            placeholders.join(", ")
        );
        let params = entries.into_iter().map(|(_, v)| v.clone()).collect();
        Ok((sql, params))
    }

    pub fn update(
        &self,
        table: &str,
        primary_key: &DataRow,
        values: &DataRow,
    ) -> Result<(String, Vec<serde_json::Value>)> {
        if primary_key.is_empty() {
            return Err(DataError::QueryFailed(format!(
                "update of {} requires a primary key",
                table
            )));
        }
        if values.is_empty() {
            return Err(DataError::QueryFailed(format!(
                "update of {} requires at least one column value",
                table
            )));
        }

        let mut params = Vec::new();
        let mut assignments = Vec::new();
        for (name, value) in sorted(values) {
            params.push(value.clone());
            assignments.push(format!(
                "{} = {}",
                self.quote_identifier(name),
                self.placeholder(params.len())
            ));
        }
        let predicate = self.key_predicate(primary_key, &mut params);

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.quote_identifier(table),
            assignments.join(", "),
            predicate
        );
        Ok((sql, params))
    }

    pub fn delete(&self, table: &str, primary_key: &DataRow) -> Result<(String, Vec<serde_json::Value>)> {
        if primary_key.is_empty() {
            return Err(DataError::QueryFailed(format!(
                "delete from {} requires a primary key",
                table
            )));
        }

        let mut params = Vec::new();
        let predicate = self.key_predicate(primary_key, &mut params);
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.quote_identifier(table),
            predicate
        );
        Ok((sql, params))
    }

    fn key_predicate(&self, key: &DataRow, params: &mut Vec<serde_json::Value>) -> String {
        sorted(key)
            .into_iter()
            .map(|(name, value)| {
                params.push(value.clone());
                format!(
                    "{} = {}",
                    self.quote_identifier(name),
                    self.placeholder(params.len())
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

fn sorted(row: &DataRow) -> Vec<(&String, &serde_json::Value)> {
    let mut entries: Vec<_> = row.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}
