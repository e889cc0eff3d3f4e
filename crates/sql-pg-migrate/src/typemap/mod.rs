//! Source type to PostgreSQL type mapping.
//!
//! Each source dialect has a fixed mapping table. Mapping is total: any type
//! name missing from a table maps to [`DEFAULT_TEXT_TYPE`] with a warning.

mod mssql;
mod mysql;

use std::sync::Arc;

pub use mssql::MssqlMapper;
pub use mysql::MysqlMapper;

use crate::config::SourceType;
use crate::core::schema::{Column, DeclaredType};

/// Target type used for anything the mapping tables do not cover.
pub const DEFAULT_TEXT_TYPE: &str = "text";

/// Largest length PostgreSQL accepts for char/varchar.
pub(crate) const PG_MAX_CHAR_LENGTH: i32 = 10_485_760;

/// Result of mapping a source type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMapping {
    /// PostgreSQL type expression (e.g. `numeric(10,2)`).
    pub target_type: String,

    /// Whether values may lose information or behavior.
    pub is_lossy: bool,

    /// Why the mapping is lossy.
    pub warning: Option<String>,
}

impl TypeMapping {
    pub fn lossless(target_type: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            is_lossy: false,
            warning: None,
        }
    }

    pub fn lossy(target_type: impl Into<String>, warning: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            is_lossy: true,
            warning: Some(warning.into()),
        }
    }

    pub(crate) fn fallback(source_type: &str) -> Self {
        Self::lossy(
            DEFAULT_TEXT_TYPE,
            format!("unmapped source type '{}' stored as text", source_type),
        )
    }
}

/// Maps source type declarations to PostgreSQL type expressions.
pub trait TypeMapper: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Map a type name with its declared length, precision and scale.
    fn map_type(&self, data_type: &str, max_length: i32, precision: i32, scale: i32)
        -> TypeMapping;

    fn map_column(&self, col: &Column) -> TypeMapping {
        self.map_type(&col.data_type, col.max_length, col.precision, col.scale)
    }

    fn map_declared(&self, declared: &DeclaredType) -> TypeMapping {
        self.map_type(
            &declared.name,
            declared.max_length,
            declared.precision,
            declared.scale,
        )
    }
}

/// Mapper for a source engine.
pub fn mapper_for(source: SourceType) -> Arc<dyn TypeMapper> {
    match source {
        SourceType::Mssql => Arc::new(MssqlMapper),
        SourceType::Mysql => Arc::new(MysqlMapper),
    }
}

/// Parse a declared type such as `decimal(10,2) unsigned` or `varchar(50)`.
///
/// Numeric types take `(precision, scale)`; everything else takes a single
/// length. Non-numeric arguments (enum members) are ignored.
pub fn parse_declared_type(declaration: &str) -> DeclaredType {
    let lower = declaration.trim().to_lowercase();
    let (head, args) = match lower.find('(') {
        Some(open) => {
            let close = lower[open..].find(')').map(|c| open + c).unwrap_or(lower.len());
            let rest = lower.get(close + 1..).unwrap_or("");
            let head = format!("{}{}", lower[..open].trim(), rest);
            (head, &lower[open + 1..close])
        }
        None => (lower.clone(), ""),
    };

    let mut words = head.split_whitespace();
    let mut name = words.next().unwrap_or(DEFAULT_TEXT_TYPE).to_string();
    for word in words {
        match word {
            "unsigned" => name.push_str(" unsigned"),
            "precision" if name == "double" => name.push_str(" precision"),
            "varying" => name.push_str(" varying"),
            _ => {}
        }
    }

    let nums: Vec<i32> = args
        .split(',')
        .filter_map(|a| a.trim().parse::<i32>().ok())
        .collect();

    let base = name.split_whitespace().next().unwrap_or("");
    let is_numeric = matches!(
        base,
        "decimal" | "numeric" | "dec" | "fixed" | "float" | "double" | "real"
    );

    match (is_numeric, nums.as_slice()) {
        (true, [p]) => DeclaredType::new(name, 0, *p, 0),
        (true, [p, s, ..]) => DeclaredType::new(name, 0, *p, *s),
        (false, [len, ..]) => DeclaredType::new(name, *len, 0, 0),
        _ => DeclaredType::new(name, 0, 0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TYPES: &[&str] = &[
        "bit", "tinyint", "smallint", "int", "bigint", "decimal", "numeric", "money", "float",
        "real", "char", "nchar", "varchar", "nvarchar", "text", "ntext", "binary", "varbinary",
        "image", "timestamp", "rowversion", "date", "time", "datetime", "datetime2",
        "datetimeoffset", "uniqueidentifier", "xml", "json", "enum", "set", "blob", "year",
        "geometry", "sql_variant", "no_such_type", "",
    ];

    #[test]
    fn test_mapping_is_total_and_deterministic() {
        for source in [SourceType::Mssql, SourceType::Mysql] {
            let mapper = mapper_for(source);
            for ty in SAMPLE_TYPES {
                for (len, p, s) in [(0, 0, 0), (-1, 0, 0), (50, 10, 2), (i32::MAX, 38, 38)] {
                    let a = mapper.map_type(ty, len, p, s);
                    let b = mapper.map_type(ty, len, p, s);
                    assert!(!a.target_type.is_empty(), "{} {} mapped empty", mapper.name(), ty);
                    assert_eq!(a, b);
                }
            }
        }
    }

    #[test]
    fn test_parse_declared_type() {
        assert_eq!(
            parse_declared_type("decimal(10,2)"),
            DeclaredType::new("decimal", 0, 10, 2)
        );
        assert_eq!(
            parse_declared_type("varchar(50)"),
            DeclaredType::new("varchar", 50, 0, 0)
        );
        assert_eq!(
            parse_declared_type("int(10) unsigned"),
            DeclaredType::new("int unsigned", 10, 0, 0)
        );
        assert_eq!(
            parse_declared_type("enum('a','b')"),
            DeclaredType::new("enum", 0, 0, 0)
        );
        assert_eq!(
            parse_declared_type("DOUBLE PRECISION"),
            DeclaredType::new("double precision", 0, 0, 0)
        );
        assert_eq!(parse_declared_type("text").name, "text");
    }

    #[test]
    fn test_map_column_uses_declared_lengths() {
        let col = Column {
            name: "amount".into(),
            data_type: "decimal".into(),
            max_length: 0,
            precision: 10,
            scale: 2,
            is_nullable: false,
            is_identity: false,
            ordinal_pos: 1,
        };
        assert_eq!(MssqlMapper.map_column(&col).target_type, "numeric(10,2)");
        assert_eq!(MysqlMapper.map_column(&col).target_type, "numeric(10,2)");
    }
}
