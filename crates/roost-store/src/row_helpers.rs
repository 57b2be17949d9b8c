use crate::error::VaultError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, VaultError> {
    row.get(idx).map_err(|e| VaultError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON string column, returning CorruptRow on parse failure.
pub fn parse_json(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<serde_json::Value, VaultError> {
    serde_json::from_str(raw).map_err(|e| VaultError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}
