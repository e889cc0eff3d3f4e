//! Source values to PostgreSQL literals for multi-row INSERT statements.

use crate::core::identifier::quote_literal_pg;
use crate::core::value::SqlValue;

/// Render `value` as a literal the target accepts for its mapped column type.
pub fn to_pg_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        SqlValue::I16(n) => n.to_string(),
        SqlValue::I32(n) => n.to_string(),
        SqlValue::I64(n) => n.to_string(),
        SqlValue::F32(f) => float_literal(f64::from(*f), "float4"),
        SqlValue::F64(f) => float_literal(*f, "float8"),
        SqlValue::Decimal(d) => format!("'{}'::numeric", d),
        SqlValue::Text(s) => quote_literal_pg(s),
        SqlValue::Bytes(b) => format!("'\\x{}'::bytea", hex::encode(b)),
        SqlValue::Uuid(u) => format!("'{}'::uuid", u),
        SqlValue::Date(d) => format!("'{}'::date", d.format("%Y-%m-%d")),
        SqlValue::Time(t) => format!("'{}'::time", t.format("%H:%M:%S%.6f")),
        SqlValue::DateTime(dt) => {
            format!("'{}'::timestamp", dt.format("%Y-%m-%dT%H:%M:%S%.6f"))
        }
        SqlValue::DateTimeOffset(dto) => {
            format!("'{}'::timestamptz", dto.format("%Y-%m-%dT%H:%M:%S%.6f%:z"))
        }
    }
}

fn float_literal(f: f64, cast: &str) -> String {
    if f.is_nan() {
        format!("'NaN'::{}", cast)
    } else if f.is_infinite() {
        let sign = if f.is_sign_positive() { "" } else { "-" };
        format!("'{}Infinity'::{}", sign, cast)
    } else {
        f.to_string()
    }
}

/// `(v1, v2, ...)` for one row.
pub fn row_literal(row: &[SqlValue]) -> String {
    let values: Vec<String> = row.iter().map(to_pg_literal).collect();
    format!("({})", values.join(", "))
}
