//! PostgreSQL type OID mapping
//!
//! RowDescription needs a type OID per field; sqlx reports column types by
//! name, so a small lookup table bridges the two. Unknown types fall back
//! to TEXT, which clients render as-is.

/// OID for a PostgreSQL type name as reported by sqlx.
pub fn pg_type_oid(type_name: &str) -> i32 {
    match type_name.to_uppercase().as_str() {
        "BOOL" => 16,
        "BYTEA" => 17,
        "CHAR" | "\"CHAR\"" => 18,
        "NAME" => 19,
        "INT8" | "BIGINT" => 20,
        "INT2" | "SMALLINT" => 21,
        "INT4" | "INT" | "INTEGER" => 23,
        "TEXT" => 25,
        "OID" => 26,
        "JSON" => 114,
        "FLOAT4" | "REAL" => 700,
        "FLOAT8" | "DOUBLE PRECISION" => 701,
        "BPCHAR" => 1042,
        "VARCHAR" | "CHARACTER VARYING" => 1043,
        "DATE" => 1082,
        "TIME" => 1083,
        "TIMESTAMP" => 1114,
        "TIMESTAMPTZ" => 1184,
        "INTERVAL" => 1186,
        "TIMETZ" => 1266,
        "NUMERIC" | "DECIMAL" => 1700,
        "UUID" => 2950,
        "JSONB" => 3802,
        _ => 25, // unknown types surface as text
    }
}

/// Wire type size for a PostgreSQL type name (-1 = variable length).
pub fn pg_type_len(type_name: &str) -> i16 {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "CHAR" | "\"CHAR\"" => 1,
        "INT2" | "SMALLINT" => 2,
        "INT4" | "INT" | "INTEGER" | "FLOAT4" | "REAL" | "OID" | "DATE" => 4,
        "INT8" | "BIGINT" | "FLOAT8" | "DOUBLE PRECISION" | "TIME" | "TIMESTAMP"
        | "TIMESTAMPTZ" => 8,
        "UUID" => 16,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_oids() {
        assert_eq!(pg_type_oid("INT4"), 23);
        assert_eq!(pg_type_oid("int8"), 20);
        assert_eq!(pg_type_oid("TEXT"), 25);
        assert_eq!(pg_type_oid("TIMESTAMPTZ"), 1184);
        assert_eq!(pg_type_oid("UUID"), 2950);
        assert_eq!(pg_type_oid("something_custom"), 25);
    }

    #[test]
    fn test_type_lens() {
        assert_eq!(pg_type_len("BOOL"), 1);
        assert_eq!(pg_type_len("INT8"), 8);
        assert_eq!(pg_type_len("TEXT"), -1);
        assert_eq!(pg_type_len("UUID"), 16);
    }
}
