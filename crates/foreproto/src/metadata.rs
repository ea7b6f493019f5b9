//! Worker metadata: the JSON document a worker delivers once, describing
//! its parameters. The manager keeps the raw text (served verbatim to the
//! UI) and two derived views: declared types of mutable parameters (for
//! modify coercion) and per-table column schemas (for `TableData` wire
//! decoding).
//!
//! Shape:
//!
//! ```json
//! {
//!   "mutable": { "<id>": { "type": "Int32" },
//!                "<id>": { "type": "TableData",
//!                          "columns": { "<col-id>": { "type": "Uint16" } } } },
//!   "const":   { ... }
//! }
//! ```
//!
//! Columns are ordered by ascending numeric column id.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::value::{ColumnSchema, Duration, ScalarType, TableData, Timer, Value};

/// A parsed metadata document.
#[derive(Debug, Clone)]
pub struct AppMetadata {
    raw: String,
    doc: serde_json::Value,
}

impl AppMetadata {
    pub fn parse(raw: impl Into<String>) -> Result<Self, serde_json::Error> {
        let raw = raw.into();
        let doc = serde_json::from_str(&raw)?;
        Ok(Self { raw, doc })
    }

    /// The document exactly as the worker delivered it.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn section(&self, name: &str) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.doc.get(name)?.as_object()
    }

    pub fn has_mutable(&self) -> bool {
        self.section("mutable").is_some_and(|m| !m.is_empty())
    }

    /// Declared type of a mutable parameter, or `None` when the id is not
    /// mutable or its type is missing/unknown.
    pub fn mutable_type(&self, id: u64) -> Option<ScalarType> {
        let item = self.section("mutable")?.get(&id.to_string())?;
        let name = item.get("type")?.as_str()?;
        let ty = ScalarType::from_name(name);
        if ty.is_none() {
            error!(id, declared = name, "unknown or unsupported parameter type in metadata");
        }
        ty
    }

    /// Column schemas of every `TableData` parameter in both the `mutable`
    /// and `const` sections. A table whose columns yield no recognized
    /// type is reported and omitted.
    pub fn table_schemas(&self) -> HashMap<u64, ColumnSchema> {
        let mut schemas = HashMap::new();
        for section in ["mutable", "const"] {
            let Some(parameters) = self.section(section) else {
                continue;
            };
            for (key, item) in parameters {
                let Some(item) = item.as_object() else {
                    continue;
                };
                if item.get("type").and_then(|t| t.as_str()) != Some("TableData") {
                    continue;
                }
                let Ok(table_id) = key.parse::<u64>() else {
                    error!(%key, "table id in metadata is not numeric");
                    continue;
                };
                if schemas.contains_key(&table_id) {
                    continue;
                }
                let Some(columns) = item.get("columns").and_then(|c| c.as_object()) else {
                    continue;
                };
                let mut ordered: Vec<(u64, ScalarType)> = Vec::with_capacity(columns.len());
                for (column_key, column_item) in columns {
                    let Ok(column_id) = column_key.parse::<u64>() else {
                        error!(table_id, %column_key, "column id in metadata is not numeric");
                        continue;
                    };
                    let Some(name) = column_item.get("type").and_then(|t| t.as_str()) else {
                        error!(table_id, column_id, "column in metadata has no type");
                        continue;
                    };
                    match ScalarType::from_name(name) {
                        Some(ty) => ordered.push((column_id, ty)),
                        None => {
                            error!(table_id, column_id, declared = name, "unknown column type in metadata")
                        }
                    }
                }
                if ordered.is_empty() {
                    error!(table_id, "no usable column types found for table");
                    continue;
                }
                ordered.sort_by_key(|(id, _)| *id);
                debug!(table_id, columns = ordered.len(), "table columns registered");
                schemas.insert(table_id, ordered.into_iter().map(|(_, ty)| ty).collect());
            }
        }
        schemas
    }
}

/// Coerce one JSON scalar to a declared wire type. Widening is permitted:
/// any JSON integer feeds any integer type of sufficient range, doubles
/// feed floats, integers feed `Timer`/`Duration` as nanoseconds, and
/// `null` feeds only the optional types. `None` means the update does not
/// fit and the parameter is skipped.
pub fn coerce_json(
    declared: ScalarType,
    json: &serde_json::Value,
    schema: Option<&ColumnSchema>,
) -> Option<Value> {
    fn signed(json: &serde_json::Value) -> Option<i64> {
        json.as_i64().or_else(|| json.as_u64().map(|v| v as i64))
    }
    fn float(json: &serde_json::Value) -> Option<f64> {
        json.as_f64()
            .or_else(|| signed(json).map(|v| v as f64))
    }
    macro_rules! optional {
        ($variant:ident, $source:expr) => {{
            if json.is_null() {
                return Some(Value::$variant(None));
            }
            $source.map(|v| Value::$variant(Some(v as _)))
        }};
    }
    match declared {
        ScalarType::Bool => json.as_bool().map(Value::Bool),
        ScalarType::Int8 => signed(json).map(|v| Value::Int8(v as i8)),
        ScalarType::Int16 => signed(json).map(|v| Value::Int16(v as i16)),
        ScalarType::Int32 => signed(json).map(|v| Value::Int32(v as i32)),
        ScalarType::Int64 => signed(json).map(Value::Int64),
        ScalarType::Uint8 => json.as_u64().map(|v| Value::Uint8(v as u8)),
        ScalarType::Uint16 => json.as_u64().map(|v| Value::Uint16(v as u16)),
        ScalarType::Uint32 => json.as_u64().map(|v| Value::Uint32(v as u32)),
        ScalarType::Uint64 => json.as_u64().map(Value::Uint64),
        ScalarType::Float => float(json).map(|v| Value::Float(v as f32)),
        ScalarType::Double => float(json).map(Value::Double),
        ScalarType::String => json.as_str().map(|s| Value::String(s.to_string())),
        ScalarType::Timer => signed(json).map(|ns| Value::Timer(Timer(ns))),
        ScalarType::Duration => signed(json).map(|ns| Value::Duration(Duration(ns))),
        ScalarType::TableData => {
            let rows = json.as_array()?;
            if rows.is_empty() {
                return Some(Value::Table(TableData::default()));
            }
            let schema = match schema {
                Some(schema) => schema,
                None => {
                    warn!("table update without a known column schema");
                    return None;
                }
            };
            let mut table = TableData::default();
            for row in rows {
                let cells = row.as_array()?;
                if cells.len() != schema.len() {
                    warn!(
                        expected = schema.len(),
                        got = cells.len(),
                        "table row width does not match column schema"
                    );
                    return None;
                }
                let mut out = Vec::with_capacity(cells.len());
                for (cell, column) in cells.iter().zip(schema) {
                    out.push(coerce_json(*column, cell, None)?);
                }
                table.rows.push(out);
            }
            Some(Value::Table(table))
        }
        ScalarType::OptionalInt8 => optional!(OptionalInt8, signed(json)),
        ScalarType::OptionalInt16 => optional!(OptionalInt16, signed(json)),
        ScalarType::OptionalInt32 => optional!(OptionalInt32, signed(json)),
        ScalarType::OptionalInt64 => optional!(OptionalInt64, signed(json)),
        ScalarType::OptionalUint8 => optional!(OptionalUint8, json.as_u64()),
        ScalarType::OptionalUint16 => optional!(OptionalUint16, json.as_u64()),
        ScalarType::OptionalUint32 => optional!(OptionalUint32, json.as_u64()),
        ScalarType::OptionalUint64 => optional!(OptionalUint64, json.as_u64()),
        ScalarType::OptionalFloat => optional!(OptionalFloat, float(json)),
        ScalarType::OptionalDouble => optional!(OptionalDouble, float(json)),
    }
}
