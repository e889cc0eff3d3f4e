//! MySQL to PostgreSQL mapping table.

use super::{TypeMapper, TypeMapping, PG_MAX_CHAR_LENGTH};

/// MySQL to PostgreSQL type mapper.
///
/// Type names may carry an ` unsigned` suffix, which widens integer targets.
/// `tinyint` with length 1 is treated as boolean.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlMapper;

impl TypeMapper for MysqlMapper {
    fn name(&self) -> &'static str {
        "mysql->postgres"
    }

    fn map_type(
        &self,
        data_type: &str,
        max_length: i32,
        precision: i32,
        scale: i32,
    ) -> TypeMapping {
        let lower = data_type.trim().to_lowercase();
        let unsigned = lower.ends_with(" unsigned");
        let base = lower.trim_end_matches(" unsigned");

        match base {
            "tinyint" if max_length == 1 => TypeMapping::lossless("boolean"),
            "bool" | "boolean" => TypeMapping::lossless("boolean"),

            "tinyint" => TypeMapping::lossless("smallint"),
            "smallint" if unsigned => TypeMapping::lossless("integer"),
            "smallint" => TypeMapping::lossless("smallint"),
            "mediumint" => TypeMapping::lossless("integer"),
            "int" | "integer" if unsigned => TypeMapping::lossless("bigint"),
            "int" | "integer" => TypeMapping::lossless("integer"),
            "bigint" if unsigned => TypeMapping::lossless("numeric(20,0)"),
            "bigint" => TypeMapping::lossless("bigint"),

            "decimal" | "numeric" | "dec" | "fixed" => {
                if precision > 0 {
                    TypeMapping::lossless(format!("numeric({},{})", precision, scale))
                } else {
                    TypeMapping::lossless("numeric")
                }
            }

            "float" => TypeMapping::lossless("real"),
            "double" | "double precision" | "real" => TypeMapping::lossless("double precision"),

            "char" => sized("char", max_length),
            "varchar" => sized("varchar", max_length),
            "tinytext" | "text" | "mediumtext" | "longtext" => TypeMapping::lossless("text"),

            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
                TypeMapping::lossless("bytea")
            }
            "bit" if max_length <= 1 => TypeMapping::lossless("boolean"),
            "bit" => TypeMapping::lossless("bytea"),

            "date" => TypeMapping::lossless("date"),
            "time" => TypeMapping::lossless("time"),
            "datetime" | "timestamp" => TypeMapping::lossless("timestamp"),
            "year" => TypeMapping::lossless("smallint"),

            "json" => TypeMapping::lossless("jsonb"),

            "enum" => TypeMapping::lossy(
                "text",
                "MySQL ENUM stored as text; allowed values are not enforced",
            ),
            "set" => TypeMapping::lossy(
                "text",
                "MySQL SET stored as comma-separated text",
            ),

            "geometry" | "point" | "linestring" | "polygon" | "multipoint"
            | "multilinestring" | "multipolygon" | "geometrycollection" => TypeMapping::lossy(
                "text",
                format!("MySQL spatial type '{}' stored as text", data_type),
            ),

            _ => TypeMapping::fallback(data_type),
        }
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
        MysqlMapper.map_type(ty, len, p, s).target_type
    }

    #[test]
    fn test_boolean_detection() {
        assert_eq!(map("tinyint", 1, 3, 0), "boolean");
        assert_eq!(map("tinyint", 4, 3, 0), "smallint");
        assert_eq!(map("bit", 1, 0, 0), "boolean");
    }

    #[test]
    fn test_unsigned_widening() {
        assert_eq!(map("int unsigned", 0, 10, 0), "bigint");
        assert_eq!(map("smallint unsigned", 0, 5, 0), "integer");
        assert_eq!(map("bigint unsigned", 0, 20, 0), "numeric(20,0)");
        assert_eq!(map("int", 0, 10, 0), "integer");
    }

    #[test]
    fn test_strings_and_blobs() {
        assert_eq!(map("varchar", 45, 0, 0), "varchar(45)");
        assert_eq!(map("char", 3, 0, 0), "char(3)");
        assert_eq!(map("longtext", -1, 0, 0), "text");
        assert_eq!(map("mediumblob", 0, 0, 0), "bytea");
    }

    #[test]
    fn test_decimal_and_temporal() {
        assert_eq!(map("decimal", 0, 5, 2), "numeric(5,2)");
        assert_eq!(map("datetime", 0, 0, 0), "timestamp");
        assert_eq!(map("year", 0, 0, 0), "smallint");
        assert_eq!(map("json", 0, 0, 0), "jsonb");
    }

    #[test]
    fn test_enum_is_lossy() {
        let mapping = MysqlMapper.map_type("enum", 5, 0, 0);
        assert_eq!(mapping.target_type, "text");
        assert!(mapping.is_lossy);
    }
}
