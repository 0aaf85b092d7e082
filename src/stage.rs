//! Resolution of the label naming the completed-bridge construction step.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapter::{value_as_text, FlatTable, STEP_COLUMN};
use crate::errors::{AdapterError, ConfigurationError, DataIntegrityError, HostError};
use crate::host::{AnalysisHost, ForceQuery};
use crate::records::ElementId;

/// Row offset, counted from the end of the calibration step sequence, of the
/// terminal step label.
///
/// The host appends summary rows after the last real step of each element's
/// step sequence. The terminal step has been observed at the third row from
/// the end; the value is empirical and has to change if the host changes its
/// export layout.
pub const DEFAULT_STEP_OFFSET_FROM_END: usize = 3;

/// Construction stage and analysis step, rendered by the host as `stage:step`.
///
/// # Examples
/// ```
/// use cabletune::StageStep;
///
/// let label = StageStep::new("CS12", "002(last)");
/// assert_eq!(label.to_string(), "CS12:002(last)");
/// assert_eq!("CS12:002(last)".parse::<StageStep>().unwrap(), label);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageStep {
    /// Construction stage name.
    pub stage: String,
    /// Analysis step label within the stage.
    pub step: String,
}

impl StageStep {
    /// Create a label from its parts.
    #[must_use]
    pub fn new(stage: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            step: step.into(),
        }
    }
}

impl fmt::Display for StageStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage, self.step)
    }
}

impl FromStr for StageStep {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((stage, step)) if !stage.is_empty() && !step.is_empty() => {
                Ok(Self::new(stage, step))
            }
            _ => Err(AdapterError::InvalidValue {
                key: "stage_step".to_owned(),
                value: s.to_owned(),
            }),
        }
    }
}

/// Derives the terminal [`StageStep`] from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageStepResolver {
    /// Row offset from the end of the calibration step sequence.
    pub step_offset_from_end: usize,
}

impl Default for StageStepResolver {
    fn default() -> Self {
        Self {
            step_offset_from_end: DEFAULT_STEP_OFFSET_FROM_END,
        }
    }
}

impl StageStepResolver {
    /// Create a resolver with an explicit offset.
    #[must_use]
    pub const fn with_offset(step_offset_from_end: usize) -> Self {
        Self {
            step_offset_from_end,
        }
    }

    /// Check that the offset can address a row.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidStepOffset`] for a zero offset.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.step_offset_from_end == 0 {
            return Err(ConfigurationError::InvalidStepOffset);
        }
        Ok(())
    }

    /// Resolve the terminal label: the last listed stage, and the step found at
    /// the configured offset in an unscoped force query for `representative`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] when a host call fails, and [`HostError::Data`]
    /// when the host lists no stages or the step sequence is too short.
    pub fn resolve<H: AnalysisHost + ?Sized>(
        &self,
        host: &mut H,
        representative: ElementId,
        load_case: &str,
        force_unit: &str,
    ) -> Result<StageStep, HostError> {
        let stages = host.list_stages()?;
        let stage = stages.last().ok_or(DataIntegrityError::NoStages)?;

        let calibration = host.query_force_table(&ForceQuery {
            elements: vec![representative],
            stage_step: None,
            load_case: load_case.to_owned(),
            force_unit: force_unit.to_owned(),
        })?;
        let step = self.step_label(&calibration)?;

        let resolved = StageStep::new(stage.name.clone(), step);
        debug!(stage_step = %resolved, "resolved terminal stage/step");
        Ok(resolved)
    }

    /// Pick the step label at the configured offset from the end of `table`.
    ///
    /// # Errors
    ///
    /// Returns [`DataIntegrityError`] when the table has no `Step` column or
    /// fewer rows than the offset.
    pub fn step_label(&self, table: &FlatTable) -> Result<String, DataIntegrityError> {
        let steps = table.column_values(STEP_COLUMN)?;
        steps
            .len()
            .checked_sub(self.step_offset_from_end)
            .filter(|_| self.step_offset_from_end > 0)
            .and_then(|index| steps.get(index))
            .map(|value| value_as_text(value))
            .ok_or(DataIntegrityError::ShortStepSequence {
                rows: steps.len(),
                offset: self.step_offset_from_end,
            })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn calibration_table(steps: &[&str]) -> FlatTable {
        FlatTable::new(
            vec!["Elem".into(), "Stage".into(), "Step".into(), "Force-I".into()],
            steps
                .iter()
                .map(|step| vec![json!("2001"), json!("CS9"), json!(step), json!("1.0")])
                .collect(),
        )
        .expect("rectangular table")
    }

    #[test]
    fn picks_third_row_from_the_end_by_default() {
        let table = calibration_table(&["001(first)", "002", "003(last)", "MAX", "MIN"]);
        let step = StageStepResolver::default()
            .step_label(&table)
            .expect("enough rows");
        assert_eq!(step, "003(last)");
    }

    #[test]
    fn offset_is_tunable() {
        let table = calibration_table(&["001(first)", "002(last)", "SUM"]);
        let step = StageStepResolver::with_offset(2)
            .step_label(&table)
            .expect("enough rows");
        assert_eq!(step, "002(last)");
    }

    #[test]
    fn short_step_sequence_is_rejected() {
        let table = calibration_table(&["001", "002"]);
        assert_eq!(
            StageStepResolver::default().step_label(&table),
            Err(DataIntegrityError::ShortStepSequence { rows: 2, offset: 3 })
        );
    }

    #[test]
    fn zero_offset_is_a_configuration_error() {
        assert_eq!(
            StageStepResolver::with_offset(0).validate(),
            Err(ConfigurationError::InvalidStepOffset)
        );
        let table = calibration_table(&["001"]);
        assert!(StageStepResolver::with_offset(0).step_label(&table).is_err());
    }

    #[test]
    fn labels_split_on_the_last_colon() {
        let label: StageStep = "Stage: final:004".parse().expect("valid label");
        assert_eq!(label, StageStep::new("Stage: final", "004"));
        assert!("no-separator".parse::<StageStep>().is_err());
    }
}
