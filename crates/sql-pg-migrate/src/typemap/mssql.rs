//! SQL Server to PostgreSQL mapping table.

use super::{TypeMapper, TypeMapping, PG_MAX_CHAR_LENGTH};

/// SQL Server to PostgreSQL type mapper.
///
/// Lengths are expected in bytes, as `sys.columns.max_length` reports them;
/// `nchar`/`nvarchar` byte lengths are halved to character counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlMapper;

impl TypeMapper for MssqlMapper {
    fn name(&self) -> &'static str {
        "mssql->postgres"
    }

    fn map_type(
        &self,
        data_type: &str,
        max_length: i32,
        precision: i32,
        scale: i32,
    ) -> TypeMapping {
        match data_type.trim().to_lowercase().as_str() {
            "bit" => TypeMapping::lossless("boolean"),

            "tinyint" => TypeMapping::lossless("smallint"),
            "smallint" => TypeMapping::lossless("smallint"),
            "int" => TypeMapping::lossless("integer"),
            "bigint" => TypeMapping::lossless("bigint"),

            "decimal" | "numeric" => {
                if precision > 0 {
                    TypeMapping::lossless(format!("numeric({},{})", precision, scale))
                } else {
                    TypeMapping::lossless("numeric")
                }
            }
            "money" => TypeMapping::lossless("numeric(19,4)"),
            "smallmoney" => TypeMapping::lossless("numeric(10,4)"),

            "float" => TypeMapping::lossless("double precision"),
            "real" => TypeMapping::lossless("real"),

            "char" => sized("char", max_length),
            "varchar" => sized("varchar", max_length),
            "nchar" => sized("char", utf16_chars(max_length)),
            "nvarchar" => sized("varchar", utf16_chars(max_length)),
            "text" | "ntext" => TypeMapping::lossless("text"),

            "binary" | "varbinary" | "image" => TypeMapping::lossless("bytea"),
            "timestamp" | "rowversion" => TypeMapping::lossy(
                "bytea",
                "rowversion values are copied as bytes and no longer auto-increment",
            ),

            "date" => TypeMapping::lossless("date"),
            "time" => TypeMapping::lossless("time"),
            "datetime" | "datetime2" | "smalldatetime" => TypeMapping::lossless("timestamp"),
            "datetimeoffset" => TypeMapping::lossless("timestamptz"),

            "uniqueidentifier" => TypeMapping::lossless("uuid"),
            "xml" => TypeMapping::lossless("xml"),

            "geometry" | "geography" | "hierarchyid" | "sql_variant" => TypeMapping::lossy(
                "text",
                format!("SQL Server type '{}' stored as text", data_type),
            ),

            _ => TypeMapping::fallback(data_type),
        }
    }
}

/// UTF-16 byte length to character count; -1 (MAX) passes through.
fn utf16_chars(max_length: i32) -> i32 {
    if max_length > 0 {
        (max_length / 2).max(1)
    } else {
        max_length
    }
}

fn sized(base: &str, length: i32) -> TypeMapping {
    if length > 0 && length <= PG_MAX_CHAR_LENGTH {
        TypeMapping::lossless(format!("{}({})", base, length))
    } else {
        TypeMapping::lossless("text")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(ty: &str, len: i32, p: i32, s: i32) -> String {
        MssqlMapper.map_type(ty, len, p, s).target_type
    }

    #[test]
    fn test_integer_types() {
        assert_eq!(map("int", 0, 0, 0), "integer");
        assert_eq!(map("bigint", 0, 0, 0), "bigint");
        assert_eq!(map("tinyint", 0, 0, 0), "smallint");
        assert_eq!(map("BIT", 0, 0, 0), "boolean");
    }

    #[test]
    fn test_decimal_preserves_precision_and_scale() {
        assert_eq!(map("decimal", 0, 10, 2), "numeric(10,2)");
        assert_eq!(map("numeric", 0, 18, 0), "numeric(18,0)");
        assert_eq!(map("money", 0, 0, 0), "numeric(19,4)");
    }

    #[test]
    fn test_unicode_lengths_are_halved() {
        assert_eq!(map("nvarchar", 100, 0, 0), "varchar(50)");
        assert_eq!(map("nchar", 20, 0, 0), "char(10)");
        assert_eq!(map("nvarchar", -1, 0, 0), "text");
        assert_eq!(map("varchar", 100, 0, 0), "varchar(100)");
        assert_eq!(map("varchar", -1, 0, 0), "text");
    }

    #[test]
    fn test_binary_and_rowversion_map_to_bytea() {
        assert_eq!(map("varbinary", -1, 0, 0), "bytea");
        assert_eq!(map("image", 0, 0, 0), "bytea");
        let rowversion = MssqlMapper.map_type("timestamp", 8, 0, 0);
        assert_eq!(rowversion.target_type, "bytea");
        assert!(rowversion.is_lossy);
    }

    #[test]
    fn test_temporal_and_special_types() {
        assert_eq!(map("datetime2", 0, 0, 0), "timestamp");
        assert_eq!(map("datetimeoffset", 0, 0, 0), "timestamptz");
        assert_eq!(map("uniqueidentifier", 0, 0, 0), "uuid");
    }

    #[test]
    fn test_unknown_type_falls_back_to_text() {
        let mapping = MssqlMapper.map_type("cursor", 0, 0, 0);
        assert_eq!(mapping.target_type, "text");
        assert!(mapping.warning.is_some());
    }
}
