//! Conversion between PostgreSQL wire values and JSON.

use bytes::BytesMut;
use serde_json::Value;
use std::error::Error;
use tokio_postgres::types::{to_sql_checked, Format, FromSql, IsNull, ToSql, Type};
use tokio_postgres::Row;

type BoxError = Box<dyn Error + Sync + Send>;

/// Parameter sent in text format so the server parses it for the declared type
#[derive(Debug)]
pub(crate) struct TextParam(Option<String>);

impl TextParam {
    pub(crate) fn from_json(value: &Value) -> Self {
        TextParam(match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        })
    }
}

impl ToSql for TextParam {
    fn to_sql(&self, _ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match &self.0 {
            Some(text) => {
                out.extend_from_slice(text.as_bytes());
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

/// `numeric` rendered as an exact decimal string
struct Numeric(String);

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode_numeric(raw).map(Numeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Decode the binary `numeric` format: base-10000 digit groups with a weight
/// (position of the first group relative to the decimal point) and a display scale.
pub(crate) fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() < 8 {
        return Err("numeric value is truncated".into());
    }
    let word = |i: usize| i16::from_be_bytes([raw[i], raw[i + 1]]);
    let ndigits = word(0).max(0) as usize;
    let weight = word(2) as i32;
    let sign = u16::from_be_bytes([raw[4], raw[5]]);
    let dscale = u16::from_be_bytes([raw[6], raw[7]]) as usize;

    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }
    if raw.len() < 8 + ndigits * 2 {
        return Err("numeric value is truncated".into());
    }
    let digits: Vec<i16> = (0..ndigits).map(|i| word(8 + i * 2)).collect();
    let digit = |i: i32| -> i16 {
        if i < 0 {
            0
        } else {
            digits.get(i as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit(0).to_string());
        for i in 1..=weight {
            out.push_str(&format!("{:04}", digit(i)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(i)));
            i += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

/// Extract one cell as JSON, keyed on the column's type name
pub(crate) fn extract_value(row: &Row, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_().name();

    match type_name {
        "bool" => get::<bool>(row, idx).map(Value::Bool),
        "int2" => get::<i16>(row, idx).map(Value::from),
        "int4" => get::<i32>(row, idx).map(Value::from),
        "int8" => get::<i64>(row, idx).map(Value::from),
        "oid" => get::<u32>(row, idx).map(Value::from),
        "char" => get::<i8>(row, idx).map(|c| Value::String((c as u8 as char).to_string())),
        "float4" => get::<f32>(row, idx)
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number),
        "float8" => get::<f64>(row, idx)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        "numeric" => get::<Numeric>(row, idx).map(|n| Value::String(n.0)),
        "timestamp" => get::<chrono::NaiveDateTime>(row, idx).map(|v| Value::String(v.to_string())),
        "timestamptz" => get::<chrono::DateTime<chrono::Utc>>(row, idx)
            .map(|v| Value::String(v.to_rfc3339())),
        "date" => get::<chrono::NaiveDate>(row, idx).map(|v| Value::String(v.to_string())),
        "time" => get::<chrono::NaiveTime>(row, idx).map(|v| Value::String(v.to_string())),
        "json" | "jsonb" => get::<Value>(row, idx),
        "uuid" => get::<uuid::Uuid>(row, idx).map(|v| Value::String(v.to_string())),
        "bytea" => get::<Vec<u8>>(row, idx).map(|v| Value::String(format!("\\x{}", hex::encode(v)))),
        "_text" | "_varchar" | "_name" => get::<Vec<String>>(row, idx).map(Value::from),
        "_int4" => get::<Vec<i32>>(row, idx).map(Value::from),
        "_int8" => get::<Vec<i64>>(row, idx).map(Value::from),
        // text, varchar, bpchar, name and anything else that decodes as a string
        _ => get::<String>(row, idx).map(Value::String),
    }
    .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(ndigits: i16, weight: i16, sign: u16, dscale: u16, digits: &[i16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ndigits.to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_decode_numeric() {
        assert_eq!(decode_numeric(&numeric(2, 0, 0, 2, &[123, 4500])).unwrap(), "123.45");
        assert_eq!(decode_numeric(&numeric(1, 1, 0, 0, &[1])).unwrap(), "10000");
        assert_eq!(decode_numeric(&numeric(1, -1, 0, 3, &[10])).unwrap(), "0.001");
        assert_eq!(decode_numeric(&numeric(1, -1, 0x4000, 1, &[5000])).unwrap(), "-0.5");
        assert_eq!(decode_numeric(&numeric(0, 0, 0, 0, &[])).unwrap(), "0");
        assert_eq!(decode_numeric(&numeric(0, 0, 0xC000, 0, &[])).unwrap(), "NaN");
    }

    #[test]
    fn test_decode_numeric_rejects_truncated_input() {
        assert!(decode_numeric(&[0, 1]).is_err());
        assert!(decode_numeric(&numeric(3, 0, 0, 0, &[1])).is_err());
    }

    #[test]
    fn test_text_params() {
        assert_eq!(TextParam::from_json(&Value::Null).0, None);
        assert_eq!(TextParam::from_json(&serde_json::json!(true)).0.as_deref(), Some("true"));
        assert_eq!(TextParam::from_json(&serde_json::json!(1.5)).0.as_deref(), Some("1.5"));
        assert_eq!(TextParam::from_json(&serde_json::json!("x")).0.as_deref(), Some("x"));
        assert_eq!(
            TextParam::from_json(&serde_json::json!({"k": [1]})).0.as_deref(),
            Some("{\"k\":[1]}")
        );
    }

    #[test]
    fn test_text_param_encoding() {
        let mut out = BytesMut::new();
        let param = TextParam::from_json(&serde_json::json!(42));
        assert!(matches!(param.to_sql(&Type::INT4, &mut out).unwrap(), IsNull::No));
        assert_eq!(&out[..], b"42");
        assert!(matches!(param.encode_format(&Type::INT4), Format::Text));

        let mut out = BytesMut::new();
        let null = TextParam::from_json(&Value::Null);
        assert!(matches!(null.to_sql(&Type::INT4, &mut out).unwrap(), IsNull::Yes));
    }
}
