//! The capability set the tuning loop needs from the structural-analysis host.

use crate::adapter::FlatTable;
use crate::errors::HostError;
use crate::records::{ElementId, TensionTable};
use crate::stage::StageStep;

/// Construction stage as listed by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageRecord {
    /// Host key of the stage.
    pub key: String,
    /// Display name of the stage, used in stage/step labels.
    pub name: String,
}

impl StageRecord {
    /// Create a stage record.
    #[must_use]
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
        }
    }
}

/// Parameters of a force table query.
#[derive(Clone, Debug, PartialEq)]
pub struct ForceQuery {
    /// Elements whose rows are requested.
    pub elements: Vec<ElementId>,
    /// Construction step to report, or every step when `None`.
    pub stage_step: Option<StageStep>,
    /// Load case the forces are summed over.
    pub load_case: String,
    /// Force unit of the exported values.
    pub force_unit: String,
}

/// Remote structural-analysis application holding the bridge model.
///
/// Calls are synchronous and strictly ordered: a tuning run owns the host
/// model for its whole duration, so implementations need no interior locking.
pub trait AnalysisHost {
    /// Assign pretensions to the model.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Request`] when the host cannot be reached or rejects the call.
    fn set_tensions(&mut self, tensions: &TensionTable) -> Result<(), HostError>;

    /// Re-analyse the model, blocking until the analysis finishes.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Request`] on transport failure and
    /// [`HostError::Analysis`] when the model does not solve.
    fn run_analysis(&mut self) -> Result<(), HostError>;

    /// Construction stages in host order.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] when the stage list cannot be fetched or parsed.
    fn list_stages(&mut self) -> Result<Vec<StageRecord>, HostError>;

    /// Export axial forces for the requested elements.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Data`] when the export cannot be parsed and
    /// [`HostError::Request`] on transport failure.
    fn query_force_table(&mut self, query: &ForceQuery) -> Result<FlatTable, HostError>;
}
