//! Conversions between host payloads and the tables the tuning loop works on.
//!
//! Every function here is pure: payloads go in as [`serde_json::Value`] and
//! come out as typed tables, or the other way round. Missing required keys are
//! reported as [`AdapterError`] rather than defaulted.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{json, Map, Value};

use crate::errors::{AdapterError, ConfigError, DataIntegrityError};
use crate::records::{ElementId, ElementRecord, TensionTable};
use crate::stage::StageStep;

/// Key wrapping a pretension body sent to the host.
pub const ASSIGN_KEY: &str = "Assign";
/// Key wrapping pretensions returned by the host.
pub const PRETENSION_KEY: &str = "PTNS";
/// Key wrapping a truss force table export.
pub const TRUSS_FORCE_KEY: &str = "TrussForce";
/// Column holding the element number in a force table.
pub const ELEM_COLUMN: &str = "Elem";
/// Column holding the construction stage name in a force table.
pub const STAGE_COLUMN: &str = "Stage";
/// Column holding the construction step label in a force table.
pub const STEP_COLUMN: &str = "Step";
/// Column holding the axial force at the I end of a member.
pub const FORCE_I_COLUMN: &str = "Force-I";

/// Host table in column-major header order with one row per record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlatTable {
    /// Column names in header order.
    columns: Vec<String>,
    /// Rows of cells, one cell per column.
    rows: Vec<Vec<Value>>,
}

impl FlatTable {
    /// Build a table, rejecting rows whose width differs from the header.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::RaggedRow`] for the first row with the wrong width.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, AdapterError> {
        for (row, cells) in rows.iter().enumerate() {
            if cells.len() != columns.len() {
                return Err(AdapterError::RaggedRow {
                    row,
                    expected: columns.len(),
                    found: cells.len(),
                });
            }
        }
        Ok(Self { columns, rows })
    }

    /// Column names in header order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in host order.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column in the header.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::MissingColumn`] when no column has that name.
    pub fn column_index(&self, name: &str) -> Result<usize, AdapterError> {
        self.columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| AdapterError::MissingColumn(name.to_owned()))
    }

    /// Cells of one column, top to bottom.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::MissingColumn`] when no column has that name.
    pub fn column_values(&self, name: &str) -> Result<Vec<&Value>, AdapterError> {
        let index = self.column_index(name)?;
        Ok(self.rows.iter().map(|row| &row[index]).collect())
    }

    /// Force-I per element at one construction stage/step.
    ///
    /// Only rows whose `Step` cell, and `Stage` cell when the table has that
    /// column, match `stage_step` are read. Summary rows the host appends
    /// (`MAX`, `MIN`) therefore never stand in for the terminal force.
    ///
    /// # Errors
    ///
    /// Returns [`DataIntegrityError::AmbiguousForce`] when an element matches
    /// more than one row, and [`DataIntegrityError::Table`] when a required
    /// column is missing or a matching cell is not a number.
    pub fn forces_at(
        &self,
        stage_step: &StageStep,
    ) -> Result<BTreeMap<ElementId, f64>, DataIntegrityError> {
        let elem = self.column_index(ELEM_COLUMN)?;
        let step = self.column_index(STEP_COLUMN)?;
        let stage = self.column_index(STAGE_COLUMN).ok();
        let force = self.column_index(FORCE_I_COLUMN)?;

        let mut forces = BTreeMap::new();
        let mut matching_rows: BTreeMap<ElementId, usize> = BTreeMap::new();
        for row in &self.rows {
            let at_label = value_as_text(&row[step]).trim() == stage_step.step.trim()
                && stage.map_or(true, |stage| {
                    value_as_text(&row[stage]).trim() == stage_step.stage.trim()
                });
            if !at_label {
                continue;
            }
            let element =
                value_as_u32(&row[elem]).ok_or_else(|| invalid(ELEM_COLUMN, &row[elem]))?;
            let value =
                value_as_f64(&row[force]).ok_or_else(|| invalid(FORCE_I_COLUMN, &row[force]))?;
            *matching_rows.entry(element).or_default() += 1;
            forces.insert(element, value);
        }

        if let Some((&element, &rows)) = matching_rows.iter().find(|(_, &rows)| rows > 1) {
            return Err(DataIntegrityError::AmbiguousForce { element, rows });
        }
        Ok(forces)
    }
}

/// Read a number stored either as a JSON number or as numeric text.
#[must_use]
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Read an unsigned 32-bit number (element or load id) stored as an integer,
/// an integral float or text.
#[must_use]
pub fn value_as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::String(text) => text.trim().parse().ok(),
        Value::Number(number) => match number.as_u64() {
            Some(integer) => u32::try_from(integer).ok(),
            None => {
                let number = number.as_f64()?;
                if number.fract() == 0.0 && number >= 0.0 && number <= f64::from(u32::MAX) {
                    // Integral and in range, so the cast is exact.
                    Some(number as u32)
                } else {
                    None
                }
            }
        },
        _ => None,
    }
}

/// Render a cell as a label.
#[must_use]
pub fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Convert a host pretension payload into a [`TensionTable`].
///
/// Both the `Assign` body the host accepts and the `PTNS` body it returns are
/// understood. Only the first item of each element is read.
///
/// # Errors
///
/// Returns [`AdapterError`] when a required key is missing or a value cannot be
/// converted.
///
/// # Examples
/// ```
/// use cabletune::host_format_to_table;
/// use serde_json::json;
///
/// let payload = json!({"Assign": {"2001": {"ITEMS": [
///     {"ID": 1, "LCNAME": "cable", "GROUP_NAME": "stays", "TENSION": 1.2e6}
/// ]}}});
/// let table = host_format_to_table(&payload).expect("well formed");
/// assert_eq!(table.tension(2001), Some(1.2e6));
/// ```
pub fn host_format_to_table(payload: &Value) -> Result<TensionTable, AdapterError> {
    let entries = payload
        .get(ASSIGN_KEY)
        .or_else(|| payload.get(PRETENSION_KEY))
        .ok_or_else(|| missing(ASSIGN_KEY))?
        .as_object()
        .ok_or_else(|| invalid(ASSIGN_KEY, payload))?;

    let mut table = TensionTable::new();
    for (key, entry) in entries {
        let element_id = key.trim().parse().map_err(|_| AdapterError::InvalidValue {
            key: "element".to_owned(),
            value: key.clone(),
        })?;
        let item = entry
            .get("ITEMS")
            .ok_or_else(|| missing("ITEMS"))?
            .as_array()
            .and_then(|items| items.first())
            .ok_or_else(|| invalid("ITEMS", entry))?;

        let load_id = required(item, "ID")?;
        let load_id = value_as_u32(load_id).ok_or_else(|| invalid("ID", load_id))?;
        let load_case_name = value_as_text(required(item, "LCNAME")?);
        let group_name = value_as_text(required(item, "GROUP_NAME")?);
        let tension = required(item, "TENSION")?;
        let tension = value_as_f64(tension).ok_or_else(|| invalid("TENSION", tension))?;

        table.insert(ElementRecord {
            element_id,
            load_id,
            load_case_name,
            group_name,
            tension,
        })?;
    }
    Ok(table)
}

/// Convert a [`TensionTable`] into the `Assign` body the host accepts.
#[must_use]
pub fn table_to_host_format(table: &TensionTable) -> Value {
    let entries: Map<String, Value> = table
        .iter()
        .map(|record| {
            (
                record.element_id.to_string(),
                json!({
                    "ITEMS": [{
                        "ID": record.load_id,
                        "LCNAME": record.load_case_name,
                        "GROUP_NAME": record.group_name,
                        "TENSION": record.tension,
                    }]
                }),
            )
        })
        .collect();
    json!({ ASSIGN_KEY: entries })
}

/// Convert a force table export into a [`FlatTable`], keeping header order.
///
/// # Errors
///
/// Returns [`AdapterError`] when the `TrussForce`, `HEAD` or `DATA` keys are
/// missing or malformed, or when a row is ragged.
pub fn force_response_to_table(payload: &Value) -> Result<FlatTable, AdapterError> {
    let body = payload
        .get(TRUSS_FORCE_KEY)
        .ok_or_else(|| missing(TRUSS_FORCE_KEY))?;
    let head = required(body, "HEAD")?;
    let columns = head
        .as_array()
        .ok_or_else(|| invalid("HEAD", head))?
        .iter()
        .map(value_as_text)
        .collect();
    let data = required(body, "DATA")?;
    let rows = data
        .as_array()
        .ok_or_else(|| invalid("DATA", data))?
        .iter()
        .map(|row| row.as_array().cloned().ok_or_else(|| invalid("DATA", row)))
        .collect::<Result<Vec<_>, _>>()?;
    FlatTable::new(columns, rows)
}

/// Convert a [`FlatTable`] back into a force table export.
#[must_use]
pub fn table_to_force_response(table: &FlatTable) -> Value {
    json!({
        TRUSS_FORCE_KEY: {
            "HEAD": table.columns,
            "DATA": table.rows,
        }
    })
}

/// Read a tension table from a JSON file.
///
/// The file may hold a host pretension payload or a plain list of
/// [`ElementRecord`]s.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be read or parsed.
pub fn read_tension_file(path: &Path) -> Result<TensionTable, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let payload: Value = serde_json::from_str(text.trim_start_matches('\u{feff}'))?;
    if payload.is_array() {
        let records: Vec<ElementRecord> = serde_json::from_value(payload)?;
        Ok(TensionTable::from_records(records)?)
    } else {
        Ok(host_format_to_table(&payload)?)
    }
}

/// Write a tension table to a JSON file in host format.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be written.
pub fn write_tension_file(path: &Path, table: &TensionTable) -> Result<(), ConfigError> {
    let text = serde_json::to_string_pretty(&table_to_host_format(table))?;
    std::fs::write(path, text).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Fetch a key that must be present.
fn required<'a>(value: &'a Value, key: &str) -> Result<&'a Value, AdapterError> {
    value.get(key).ok_or_else(|| missing(key))
}

/// Build a missing-key error.
fn missing(key: &str) -> AdapterError {
    AdapterError::MissingKey {
        key: key.to_owned(),
    }
}

/// Build an invalid-value error.
fn invalid(key: &str, value: &Value) -> AdapterError {
    AdapterError::InvalidValue {
        key: key.to_owned(),
        value: value.to_string(),
    }
}
