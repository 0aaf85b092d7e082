//! Typed records for the tensioned members of a bridge model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::AdapterError;

/// Host element number identifying one cable member.
pub type ElementId = u32;

/// Pretension assignment for one cable element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    /// Host element number.
    pub element_id: ElementId,
    /// Identifier of the pretension load within its load case.
    pub load_id: u32,
    /// Load case carrying the pretension.
    pub load_case_name: String,
    /// Load group the pretension belongs to.
    pub group_name: String,
    /// Trial tension in the host's force unit.
    pub tension: f64,
}

impl ElementRecord {
    /// Create a record with explicit fields.
    #[must_use]
    pub fn new(
        element_id: ElementId,
        load_id: u32,
        load_case_name: impl Into<String>,
        group_name: impl Into<String>,
        tension: f64,
    ) -> Self {
        Self {
            element_id,
            load_id,
            load_case_name: load_case_name.into(),
            group_name: group_name.into(),
            tension,
        }
    }
}

/// Pretension assignments keyed by element id.
///
/// Iteration always walks elements in ascending id order, so two tables built
/// from the same records in a different order compare equal.
///
/// # Examples
/// ```
/// use cabletune::{ElementRecord, TensionTable};
///
/// let table = TensionTable::from_records(vec![
///     ElementRecord::new(2002, 1, "cable", "stays", 1.5e6),
///     ElementRecord::new(2001, 1, "cable", "stays", 1.2e6),
/// ])
/// .expect("unique elements");
/// assert_eq!(table.element_ids(), vec![2001, 2002]);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TensionTable {
    /// Records keyed by their element id.
    records: BTreeMap<ElementId, ElementRecord>,
}

impl TensionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table, rejecting repeated element ids and unusable tensions.
    ///
    /// # Errors
    ///
    /// Returns the first error [`TensionTable::insert`] reports.
    pub fn from_records(
        records: impl IntoIterator<Item = ElementRecord>,
    ) -> Result<Self, AdapterError> {
        let mut table = Self::new();
        for record in records {
            table.insert(record)?;
        }
        Ok(table)
    }

    /// Add a record.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::DuplicateElement`] when the element is already
    /// present and [`AdapterError::NonFiniteTension`] for a NaN or infinite tension.
    pub fn insert(&mut self, record: ElementRecord) -> Result<(), AdapterError> {
        if !record.tension.is_finite() {
            return Err(AdapterError::NonFiniteTension {
                element: record.element_id,
                value: record.tension,
            });
        }
        if self.records.contains_key(&record.element_id) {
            return Err(AdapterError::DuplicateElement(record.element_id));
        }
        self.records.insert(record.element_id, record);
        Ok(())
    }

    /// Number of elements in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up the record for an element.
    #[must_use]
    pub fn get(&self, element: ElementId) -> Option<&ElementRecord> {
        self.records.get(&element)
    }

    /// Current tension of an element.
    #[must_use]
    pub fn tension(&self, element: ElementId) -> Option<f64> {
        self.records.get(&element).map(|record| record.tension)
    }

    /// Overwrite the tension of an element, returning `false` when it is unknown.
    pub fn set_tension(&mut self, element: ElementId, tension: f64) -> bool {
        match self.records.get_mut(&element) {
            Some(record) => {
                record.tension = tension;
                true
            }
            None => false,
        }
    }

    /// Element ids in ascending order.
    #[must_use]
    pub fn element_ids(&self) -> Vec<ElementId> {
        self.records.keys().copied().collect()
    }

    /// Records in ascending element order.
    pub fn iter(&self) -> impl Iterator<Item = &ElementRecord> {
        self.records.values()
    }
}

/// Target tensions keyed by element id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetTable {
    /// Target tension per element.
    targets: BTreeMap<ElementId, f64>,
}

impl TargetTable {
    /// Create an empty target table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets stored in pretension format carry the target in their `tension` column.
    #[must_use]
    pub fn from_tensions(table: &TensionTable) -> Self {
        table
            .iter()
            .map(|record| (record.element_id, record.tension))
            .collect()
    }

    /// Set the target for an element, replacing any previous value.
    pub fn insert(&mut self, element: ElementId, target: f64) {
        self.targets.insert(element, target);
    }

    /// Target for an element.
    #[must_use]
    pub fn get(&self, element: ElementId) -> Option<f64> {
        self.targets.get(&element).copied()
    }

    /// Number of targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether there are no targets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Element ids in ascending order.
    #[must_use]
    pub fn element_ids(&self) -> Vec<ElementId> {
        self.targets.keys().copied().collect()
    }

    /// `(element, target)` pairs in ascending element order.
    pub fn iter(&self) -> impl Iterator<Item = (ElementId, f64)> + '_ {
        self.targets.iter().map(|(element, target)| (*element, *target))
    }
}

impl FromIterator<(ElementId, f64)> for TargetTable {
    fn from_iter<I: IntoIterator<Item = (ElementId, f64)>>(iter: I) -> Self {
        Self {
            targets: iter.into_iter().collect(),
        }
    }
}
