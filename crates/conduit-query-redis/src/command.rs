//! Command-line tokenizing and reply conversion.

use conduit_query::{DataRow, ResultColumn};
use serde_json::{Map, Value};

/// Split a command line into arguments, honoring single and double quotes.
///
/// Inside double quotes `\"`, `\\`, `\n`, `\r` and `\t` are unescaped; single
/// quotes are literal.
pub(crate) fn split_command(input: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => current.push('\n'),
                            Some('r') => current.push('\r'),
                            Some('t') => current.push('\t'),
                            Some(other) => current.push(other),
                            None => return Err("unterminated escape sequence".to_string()),
                        },
                        Some(other) => current.push(other),
                        None => return Err("unbalanced double quote".to_string()),
                    }
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(other) => current.push(other),
                        None => return Err("unbalanced single quote".to_string()),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        args.push(current);
    }
    Ok(args)
}

/// Parameter rendered as a command argument
pub(crate) fn param_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn text(bytes: &[u8]) -> Value {
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}

fn key_string(value: &redis::Value) -> String {
    match to_json(value) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Reply value as JSON
pub(crate) fn to_json(value: &redis::Value) -> Value {
    match value {
        redis::Value::Nil => Value::Null,
        redis::Value::Int(i) => Value::from(*i),
        redis::Value::BulkString(bytes) => text(bytes),
        redis::Value::SimpleString(s) => Value::String(s.clone()),
        redis::Value::Okay => Value::String("OK".to_string()),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        redis::Value::Map(pairs) => Value::Object(
            pairs
                .iter()
                .map(|(k, v)| (key_string(k), to_json(v)))
                .collect::<Map<String, Value>>(),
        ),
        redis::Value::Double(d) => serde_json::Number::from_f64(*d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        redis::Value::Boolean(b) => Value::Bool(*b),
        redis::Value::VerbatimString { text, .. } => Value::String(text.clone()),
        other => Value::String(format!("{:?}", other)),
    }
}

fn row(pairs: &[(&str, Value)]) -> DataRow {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// Tabular form of a reply: collections become one row per element,
/// maps one row per field, scalars a single `value` row
pub(crate) fn reply_rows(value: &redis::Value) -> (Vec<ResultColumn>, Vec<DataRow>) {
    match value {
        redis::Value::Array(items) | redis::Value::Set(items) => (
            vec![ResultColumn::named("index"), ResultColumn::named("value")],
            items
                .iter()
                .enumerate()
                .map(|(i, item)| row(&[("index", Value::from(i)), ("value", to_json(item))]))
                .collect(),
        ),
        redis::Value::Map(pairs) => (
            vec![ResultColumn::named("field"), ResultColumn::named("value")],
            pairs
                .iter()
                .map(|(k, v)| row(&[("field", Value::String(key_string(k))), ("value", to_json(v))]))
                .collect(),
        ),
        scalar => (
            vec![ResultColumn::named("value")],
            vec![row(&[("value", to_json(scalar))])],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_and_quoted() {
        assert_eq!(split_command("GET user:1").unwrap(), vec!["GET", "user:1"]);
        assert_eq!(
            split_command(r#"SET greeting "hello world""#).unwrap(),
            vec!["SET", "greeting", "hello world"]
        );
        assert_eq!(
            split_command(r#"SET k 'it''s'"#).unwrap(),
            vec!["SET", "k", "its"]
        );
        assert_eq!(
            split_command(r#"SET k "a\"b\n""#).unwrap(),
            vec!["SET", "k", "a\"b\n"]
        );
        assert_eq!(split_command(r#"SET k """#).unwrap(), vec!["SET", "k", ""]);
        assert!(split_command("   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_rejects_unbalanced_quotes() {
        assert!(split_command(r#"SET k "open"#).is_err());
        assert!(split_command("SET k 'open").is_err());
    }

    #[test]
    fn test_reply_rows() {
        let (columns, rows) = reply_rows(&redis::Value::Array(vec![
            redis::Value::BulkString(b"a".to_vec()),
            redis::Value::Int(2),
        ]));
        assert_eq!(columns.len(), 2);
        assert_eq!(rows[1]["value"], Value::from(2));
        assert_eq!(rows[0]["index"], Value::from(0));

        let (_, rows) = reply_rows(&redis::Value::Okay);
        assert_eq!(rows[0]["value"], Value::from("OK"));

        let (_, rows) = reply_rows(&redis::Value::Nil);
        assert_eq!(rows[0]["value"], Value::Null);
    }

    #[test]
    fn test_param_arg() {
        assert_eq!(param_arg(&Value::from("x")), "x");
        assert_eq!(param_arg(&Value::from(3)), "3");
        assert_eq!(param_arg(&serde_json::json!({"a": 1})), "{\"a\":1}");
    }
}
