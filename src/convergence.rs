//! Closed-loop adjustment of trial tensions toward the completed-bridge forces.
//!
//! Each pass applies the trial tensions, re-analyses the model, reads Force-I
//! at the terminal construction step and compares it with the tension that was
//! applied. The next trial tension is the current one minus the deviation, a
//! linear correction that assumes a one-to-one force response and applies no
//! damping, so a stiff or strongly coupled cable system may oscillate. The
//! full per-iteration history is returned so such behaviour stays visible.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;

use nalgebra::DVector;
use tracing::{debug, info, warn};

use crate::adapter::FlatTable;
use crate::errors::{ConfigurationError, DataIntegrityError, TuningError};
use crate::host::{AnalysisHost, ForceQuery};
use crate::records::{ElementId, TargetTable, TensionTable};
use crate::snapshot::{DeviationRow, IterationSnapshot};
use crate::stage::{StageStep, StageStepResolver};

/// Default convergence threshold on the largest absolute deviation, in percent.
pub const DEFAULT_TOLERANCE_PCT: f64 = 0.15;
/// Default ceiling on the number of analysis passes.
pub const DEFAULT_MAX_ITERATIONS: usize = 20;
/// Construction-stage summation load case the forces are read from.
pub const DEFAULT_LOAD_CASE: &str = "合计(CS)";
/// Force unit requested from the host; must match the unit of the tensions.
pub const DEFAULT_FORCE_UNIT: &str = "N";

/// Tunable parameters of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvergeOptions {
    /// Stop once every `|deviation_pct|` is strictly below this value.
    pub tolerance_pct: f64,
    /// Maximum number of analysis passes.
    pub max_iterations: usize,
    /// Load case whose forces are compared.
    pub load_case: String,
    /// Force unit of exported tables.
    pub force_unit: String,
    /// Resolver used when `stage_step` is not given.
    pub resolver: StageStepResolver,
    /// Known terminal stage/step; skips resolution when set.
    pub stage_step: Option<StageStep>,
}

impl Default for ConvergeOptions {
    fn default() -> Self {
        Self {
            tolerance_pct: DEFAULT_TOLERANCE_PCT,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            load_case: DEFAULT_LOAD_CASE.to_owned(),
            force_unit: DEFAULT_FORCE_UNIT.to_owned(),
            resolver: StageStepResolver::default(),
            stage_step: None,
        }
    }
}

/// How a run that did not fail came to an end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every deviation fell under the tolerance.
    Converged,
    /// The iteration ceiling was reached first.
    Exhausted,
    /// The observer asked the run to stop.
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Converged => "converged",
            Outcome::Exhausted => "exhausted",
            Outcome::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of a run that ended without an error.
#[derive(Clone, Debug, PartialEq)]
pub struct TuningReport {
    /// Why the run stopped.
    pub outcome: Outcome,
    /// Terminal stage/step every force query was scoped to.
    pub stage_step: StageStep,
    /// Deviation table of the last iteration.
    pub final_table: IterationSnapshot,
    /// Tensions applied in the last iteration.
    pub final_tensions: TensionTable,
    /// One snapshot per iteration, in order.
    pub snapshots: Vec<IterationSnapshot>,
}

impl TuningReport {
    /// Whether the tolerance was met.
    #[must_use]
    pub fn converged(&self) -> bool {
        self.outcome == Outcome::Converged
    }

    /// Number of iterations run.
    #[must_use]
    pub fn iterations(&self) -> usize {
        self.snapshots.len()
    }

    /// Largest absolute deviation percentage of the last iteration.
    #[must_use]
    pub fn max_abs_deviation_pct(&self) -> f64 {
        self.final_table.max_abs_deviation_pct()
    }
}

/// Hook called once per iteration, after its snapshot is taken.
///
/// Returning [`ControlFlow::Break`] stops the run with [`Outcome::Cancelled`]
/// unless that iteration already met the tolerance.
pub trait IterationObserver {
    /// Inspect the snapshot of the iteration that just finished.
    fn on_iteration(&mut self, snapshot: &IterationSnapshot) -> ControlFlow<()>;
}

impl<F> IterationObserver for F
where
    F: FnMut(&IterationSnapshot) -> ControlFlow<()>,
{
    fn on_iteration(&mut self, snapshot: &IterationSnapshot) -> ControlFlow<()> {
        self(snapshot)
    }
}

/// Observer that never intervenes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl IterationObserver for NoopObserver {
    fn on_iteration(&mut self, _snapshot: &IterationSnapshot) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Drive trial tensions until the achieved forces match them within tolerance.
///
/// The configuration is validated before the host is touched. The terminal
/// stage/step label is resolved once, after the first analysis, unless
/// `options.stage_step` supplies it, and reused for every force query.
///
/// # Errors
///
/// Returns [`TuningError::Configuration`] for unusable inputs,
/// [`TuningError::Host`] when a host call fails and
/// [`TuningError::DataIntegrity`] when a force table does not cover the
/// tracked elements. Running out of iterations is not an error; it is
/// reported as [`Outcome::Exhausted`].
pub fn converge<H, O>(
    host: &mut H,
    initial: &TensionTable,
    targets: &TargetTable,
    options: &ConvergeOptions,
    observer: &mut O,
) -> Result<TuningReport, TuningError>
where
    H: AnalysisHost + ?Sized,
    O: IterationObserver + ?Sized,
{
    validate(initial, targets, options)?;

    let elements = initial.element_ids();
    let target: DVector<f64> =
        DVector::from_iterator(elements.len(), targets.iter().map(|(_, value)| value));
    let mut tensions = initial.clone();
    let mut stage_step = options.stage_step.clone();
    let mut snapshots: Vec<IterationSnapshot> = Vec::new();

    info!(
        elements = elements.len(),
        tolerance_pct = options.tolerance_pct,
        max_iterations = options.max_iterations,
        "starting tension tuning"
    );

    let mut iteration = 0;
    loop {
        iteration += 1;
        let abort = |err, snapshots: &[IterationSnapshot]| {
            TuningError::from_host(err, iteration, snapshots.last())
        };

        host.set_tensions(&tensions)
            .map_err(|err| abort(err, &snapshots))?;
        host.run_analysis().map_err(|err| abort(err, &snapshots))?;

        let label = match &stage_step {
            Some(label) => label.clone(),
            None => {
                let label = options
                    .resolver
                    .resolve(host, elements[0], &options.load_case, &options.force_unit)
                    .map_err(|err| abort(err, &snapshots))?;
                stage_step = Some(label.clone());
                label
            }
        };

        let table = host
            .query_force_table(&ForceQuery {
                elements: elements.clone(),
                stage_step: Some(label.clone()),
                load_case: options.load_case.clone(),
                force_unit: options.force_unit.clone(),
            })
            .map_err(|err| abort(err, &snapshots))?;
        let achieved = achieved_forces(&table, &label, &elements).map_err(|source| {
            TuningError::DataIntegrity {
                iteration,
                last_snapshot: snapshots.last().cloned().map(Box::new),
                source,
            }
        })?;

        let trial: DVector<f64> =
            DVector::from_iterator(elements.len(), tensions.iter().map(|record| record.tension));
        let rows: Vec<DeviationRow> = elements
            .iter()
            .enumerate()
            .map(|(i, &element)| DeviationRow::compute(element, target[i], trial[i], achieved[i]))
            .collect();
        let deviation = DVector::from_iterator(rows.len(), rows.iter().map(|row| row.deviation));

        let snapshot = IterationSnapshot::new(iteration, rows);
        let max_deviation_pct = snapshot.max_abs_deviation_pct();
        info!(
            iteration,
            max_deviation_pct,
            stage_step = %label,
            "iteration complete"
        );
        let flow = observer.on_iteration(&snapshot);
        snapshots.push(snapshot.clone());

        let outcome = if max_deviation_pct < options.tolerance_pct {
            info!(iteration, "tension tuning converged");
            Some(Outcome::Converged)
        } else if flow.is_break() {
            warn!(iteration, "tension tuning cancelled by observer");
            Some(Outcome::Cancelled)
        } else if iteration >= options.max_iterations {
            warn!(
                iterations = iteration,
                max_deviation_pct, "tension tuning exhausted its iterations"
            );
            Some(Outcome::Exhausted)
        } else {
            None
        };
        if let Some(outcome) = outcome {
            return Ok(TuningReport {
                outcome,
                stage_step: label,
                final_table: snapshot,
                final_tensions: tensions,
                snapshots,
            });
        }

        let next = &trial - &deviation;
        for (i, &element) in elements.iter().enumerate() {
            tensions.set_tension(element, next[i]);
        }
        debug!(iteration, "updated trial tensions");
    }
}

/// Reject inputs the loop cannot run with.
fn validate(
    initial: &TensionTable,
    targets: &TargetTable,
    options: &ConvergeOptions,
) -> Result<(), ConfigurationError> {
    if !(options.tolerance_pct.is_finite() && options.tolerance_pct > 0.0) {
        return Err(ConfigurationError::InvalidTolerance(options.tolerance_pct));
    }
    if options.max_iterations == 0 {
        return Err(ConfigurationError::InvalidIterationCount(
            options.max_iterations,
        ));
    }
    if options.stage_step.is_none() {
        options.resolver.validate()?;
    }
    if initial.is_empty() && targets.is_empty() {
        return Err(ConfigurationError::NoElements);
    }

    let without_target: Vec<ElementId> = initial
        .element_ids()
        .into_iter()
        .filter(|element| targets.get(*element).is_none())
        .collect();
    let without_tension: Vec<ElementId> = targets
        .element_ids()
        .into_iter()
        .filter(|element| initial.get(*element).is_none())
        .collect();
    if !without_target.is_empty() || !without_tension.is_empty() {
        return Err(ConfigurationError::MismatchedElements {
            without_target,
            without_tension,
        });
    }

    for (element, value) in targets.iter() {
        if !value.is_finite() {
            return Err(ConfigurationError::NonFiniteTarget { element, value });
        }
        if value == 0.0 {
            return Err(ConfigurationError::ZeroTarget { element });
        }
    }
    for record in initial.iter() {
        if !record.tension.is_finite() {
            return Err(ConfigurationError::NonFiniteTension {
                element: record.element_id,
                value: record.tension,
            });
        }
    }
    Ok(())
}

/// Force-I at the terminal stage/step for each tracked element, in the order of `elements`.
fn achieved_forces(
    table: &FlatTable,
    stage_step: &StageStep,
    elements: &[ElementId],
) -> Result<DVector<f64>, DataIntegrityError> {
    let forces: BTreeMap<ElementId, f64> = table.forces_at(stage_step)?;
    let missing: Vec<ElementId> = elements
        .iter()
        .copied()
        .filter(|element| !forces.contains_key(element))
        .collect();
    if !missing.is_empty() {
        return Err(DataIntegrityError::MissingElements { elements: missing });
    }

    let mut achieved = DVector::zeros(elements.len());
    for (i, element) in elements.iter().enumerate() {
        let value = forces[element];
        if !value.is_finite() {
            return Err(DataIntegrityError::NonFiniteForce {
                element: *element,
                value,
            });
        }
        achieved[i] = value;
    }
    Ok(achieved)
}
