#![warn(clippy::pedantic)]

use std::collections::BTreeMap;

use approx::assert_relative_eq;
use cabletune::{
    converge, table_to_force_response, AnalysisHost, ConfigurationError, ConvergeOptions,
    DataIntegrityError, ElementId, ElementRecord, FlatTable, ForceQuery, HostError,
    NoopObserver, Outcome, SnapshotWriter, StageRecord, StageStep, TargetTable, TensionTable,
    TuningError,
};
use serde_json::json;

/// In-memory bridge model answering every force query with `response(element, tension)`.
struct ScriptedHost {
    response: Box<dyn Fn(ElementId, f64) -> f64>,
    applied: BTreeMap<ElementId, f64>,
    calls: usize,
    analyses: usize,
    fail_analysis_at: Option<usize>,
    omitted: Option<ElementId>,
    ignore_scope: bool,
    repeat_terminal_row: bool,
    stages: Vec<StageRecord>,
}

impl ScriptedHost {
    fn new(response: impl Fn(ElementId, f64) -> f64 + 'static) -> Self {
        Self {
            response: Box::new(response),
            applied: BTreeMap::new(),
            calls: 0,
            analyses: 0,
            fail_analysis_at: None,
            omitted: None,
            ignore_scope: false,
            repeat_terminal_row: false,
            stages: vec![
                StageRecord::new("1", "CS1"),
                StageRecord::new("2", "CS2"),
                StageRecord::new("3", "Completed"),
            ],
        }
    }

    /// The host's force export for the given rows, reparsed like a real response.
    fn export(rows: Vec<Vec<serde_json::Value>>) -> FlatTable {
        let table = FlatTable::new(
            vec![
                "Elem".into(),
                "Load".into(),
                "Stage".into(),
                "Step".into(),
                "Force-I".into(),
                "Force-J".into(),
            ],
            rows,
        )
        .expect("rows match header");
        cabletune::force_response_to_table(&table_to_force_response(&table))
            .expect("export round-trips")
    }
}

impl AnalysisHost for ScriptedHost {
    fn set_tensions(&mut self, tensions: &TensionTable) -> Result<(), HostError> {
        self.calls += 1;
        self.applied = tensions
            .iter()
            .map(|record| (record.element_id, record.tension))
            .collect();
        Ok(())
    }

    fn run_analysis(&mut self) -> Result<(), HostError> {
        self.calls += 1;
        self.analyses += 1;
        if self.fail_analysis_at == Some(self.analyses) {
            return Err(HostError::Analysis("solver diverged".into()));
        }
        Ok(())
    }

    fn list_stages(&mut self) -> Result<Vec<StageRecord>, HostError> {
        self.calls += 1;
        Ok(self.stages.clone())
    }

    fn query_force_table(&mut self, query: &ForceQuery) -> Result<FlatTable, HostError> {
        self.calls += 1;
        // (stage, step, share of the completed-bridge force) per exported row.
        let scoped = query.stage_step.as_ref().filter(|_| !self.ignore_scope);
        let mut steps: Vec<(&str, &str, f64)> = match scoped {
            Some(label) => vec![("Completed", label.step.as_str(), 1.0)],
            None => vec![
                ("CS2", "003(last)", 0.25),
                ("Completed", "001(first)", 0.0),
                ("Completed", "002", 0.5),
                ("Completed", "003(last)", 1.0),
            ],
        };
        if self.repeat_terminal_row {
            steps.push(("Completed", "003(last)", 1.0));
        }
        steps.push(("Completed", "MAX", 3.0));
        steps.push(("Completed", "MIN", 0.0));

        let mut rows = Vec::new();
        for &element in &query.elements {
            if self.omitted == Some(element) {
                continue;
            }
            let force = (self.response)(element, self.applied[&element]);
            for &(stage, step, share) in &steps {
                let value = format!("{:.6}", share * force);
                rows.push(vec![
                    json!(element.to_string()),
                    json!(query.load_case),
                    json!(stage),
                    json!(step),
                    json!(value),
                    json!(value),
                ]);
            }
        }
        Ok(Self::export(rows))
    }
}

fn tensions(values: &[(ElementId, f64)]) -> TensionTable {
    TensionTable::from_records(values.iter().map(|&(element, tension)| {
        ElementRecord::new(element, 1, "cable pretension", "stay cables", tension)
    }))
    .expect("unique elements")
}

fn options(max_iterations: usize) -> ConvergeOptions {
    ConvergeOptions {
        max_iterations,
        ..ConvergeOptions::default()
    }
}

#[test]
fn error_free_host_converges_in_one_iteration() {
    let initial = tensions(&[(2001, 1.2e6), (2002, 1.5e6), (2003, 9.8e5)]);
    let targets = TargetTable::from_tensions(&initial);
    let mut host = ScriptedHost::new(|_, tension| tension);

    let report = converge(
        &mut host,
        &initial,
        &targets,
        &ConvergeOptions::default(),
        &mut NoopObserver,
    )
    .expect("run completes");

    assert_eq!(report.outcome, Outcome::Converged);
    assert_eq!(report.iterations(), 1);
    assert_eq!(report.stage_step, StageStep::new("Completed", "003(last)"));
    assert_relative_eq!(report.max_abs_deviation_pct(), 0.0);
    assert_eq!(report.final_tensions, initial);
}

#[test]
fn single_cable_correction_matches_hand_calculation() {
    let initial = tensions(&[(2001, 100.0)]);
    let targets = TargetTable::from_tensions(&initial);
    let mut host = ScriptedHost::new(|_, tension| tension + 5.0);

    let report = converge(&mut host, &initial, &targets, &options(2), &mut NoopObserver)
        .expect("run completes");

    let first = report.snapshots[0].row(2001).expect("tracked element");
    assert_relative_eq!(first.achieved_force, 105.0);
    assert_relative_eq!(first.deviation, 5.0);
    assert_relative_eq!(first.deviation_pct, 5.0);
    assert_relative_eq!(first.next_tension(), 95.0);

    let second = report.snapshots[1].row(2001).expect("tracked element");
    assert_relative_eq!(second.trial_tension, 95.0);
    // Achieved 100 equals the target, but the error is measured from the trial.
    assert_relative_eq!(second.achieved_force, 100.0);
    assert_relative_eq!(second.deviation, 5.0);
    assert_relative_eq!(second.next_tension(), 90.0);
}

#[test]
fn zero_target_is_rejected_before_any_host_call() {
    let initial = tensions(&[(2001, 1000.0), (2002, 1000.0)]);
    let targets: TargetTable = [(2001, 1000.0), (2002, 0.0)].into_iter().collect();
    let mut host = ScriptedHost::new(|_, tension| tension);

    let err = converge(
        &mut host,
        &initial,
        &targets,
        &ConvergeOptions::default(),
        &mut NoopObserver,
    )
    .expect_err("zero target");

    assert!(matches!(
        err,
        TuningError::Configuration(ConfigurationError::ZeroTarget { element: 2002 })
    ));
    assert_eq!(err.offending_elements(), vec![2002]);
    assert_eq!(host.calls, 0);
}

#[test]
fn persistent_offset_exhausts_without_error() {
    let initial = tensions(&[(2001, 1000.0), (2002, 2000.0)]);
    let targets = TargetTable::from_tensions(&initial);
    let mut host = ScriptedHost::new(|_, tension| tension + 10.0);

    let report = converge(&mut host, &initial, &targets, &options(6), &mut NoopObserver)
        .expect("exhaustion is not an error");

    assert_eq!(report.outcome, Outcome::Exhausted);
    assert!(!report.converged());
    assert_eq!(report.iterations(), 6);
    assert_eq!(host.analyses, 6);
    for snapshot in &report.snapshots {
        assert_relative_eq!(snapshot.row(2001).expect("tracked").deviation, 10.0);
    }
    assert_relative_eq!(report.final_tensions.tension(2002).expect("tracked"), 1950.0);
}

#[test]
fn loop_stops_once_deviation_is_below_tolerance() {
    let initial = tensions(&[(2001, 1000.0)]);
    let targets = TargetTable::from_tensions(&initial);
    // Overshoots by half the distance to 980, so each correction halves the error.
    let mut host = ScriptedHost::new(|_, tension| tension + 0.5 * (tension - 980.0));

    let report = converge(
        &mut host,
        &initial,
        &targets,
        &ConvergeOptions::default(),
        &mut NoopObserver,
    )
    .expect("run completes");

    assert_eq!(report.outcome, Outcome::Converged);
    assert!(report.max_abs_deviation_pct() < 0.15);
    let history: Vec<f64> = report
        .snapshots
        .iter()
        .map(cabletune::IterationSnapshot::max_abs_deviation_pct)
        .collect();
    assert!(history.windows(2).all(|pair| pair[1] < pair[0]));
}

#[test]
fn missing_element_aborts_with_data_integrity() {
    let initial = tensions(&[(2001, 1000.0), (2002, 1000.0)]);
    let targets = TargetTable::from_tensions(&initial);
    let mut host = ScriptedHost::new(|_, tension| tension + 1.0);
    host.omitted = Some(2002);

    let err = converge(
        &mut host,
        &initial,
        &targets,
        &ConvergeOptions::default(),
        &mut NoopObserver,
    )
    .expect_err("element 2002 is never reported");

    match &err {
        TuningError::DataIntegrity {
            iteration, source, ..
        } => {
            assert_eq!(*iteration, 1);
            assert_eq!(
                source,
                &DataIntegrityError::MissingElements {
                    elements: vec![2002]
                }
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.last_snapshot().is_none());
}

#[test]
fn host_failure_reports_iteration_and_last_snapshot() {
    let initial = tensions(&[(2001, 1000.0)]);
    let targets = TargetTable::from_tensions(&initial);
    let mut host = ScriptedHost::new(|_, tension| tension + 10.0);
    host.fail_analysis_at = Some(3);

    let err = converge(&mut host, &initial, &targets, &options(10), &mut NoopObserver)
        .expect_err("third analysis fails");

    assert!(matches!(
        err,
        TuningError::Host {
            source: HostError::Analysis(_),
            ..
        }
    ));
    assert_eq!(err.iteration(), Some(3));
    let last = err.last_snapshot().expect("two iterations completed");
    assert_eq!(last.label(), "iteration-02");
    assert_relative_eq!(last.rows[0].trial_tension, 990.0);
}

#[test]
fn model_without_stages_is_a_data_integrity_failure() {
    let initial = tensions(&[(2001, 1000.0)]);
    let targets = TargetTable::from_tensions(&initial);
    let mut host = ScriptedHost::new(|_, tension| tension);
    host.stages.clear();

    let err = converge(
        &mut host,
        &initial,
        &targets,
        &ConvergeOptions::default(),
        &mut NoopObserver,
    )
    .expect_err("no stages");

    assert!(matches!(
        err,
        TuningError::DataIntegrity {
            iteration: 1,
            source: DataIntegrityError::NoStages,
            ..
        }
    ));
}

#[test]
fn every_iteration_leaves_a_snapshot_file() {
    let dir = tempfile::tempdir().expect("temporary directory");
    let initial = tensions(&[(2001, 1000.0), (2002, 1000.0)]);
    let targets = TargetTable::from_tensions(&initial);
    let mut host = ScriptedHost::new(|_, tension| tension - 3.0);
    let mut writer = SnapshotWriter::new(dir.path().join("snapshots"));

    let report = converge(&mut host, &initial, &targets, &options(3), &mut writer)
        .expect("run completes");
    assert!(writer.take_error().is_none());

    let mut names: Vec<String> = std::fs::read_dir(writer.directory())
        .expect("snapshot directory exists")
        .map(|entry| {
            entry
                .expect("readable entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["iteration-01.csv", "iteration-02.csv", "iteration-03.csv"]
    );

    let last = std::fs::read_to_string(writer.path_for(&report.snapshots[2]))
        .expect("snapshot is readable");
    assert!(last.starts_with("element_id,target_tension"));
    assert_eq!(last.lines().count(), 3);

    assert_eq!(writer.clear_stale().expect("cleanup succeeds"), 3);
}

#[test]
fn summary_rows_never_replace_the_terminal_force() {
    let initial = tensions(&[(2001, 1.2e6), (2002, 1.5e6)]);
    let targets = TargetTable::from_tensions(&initial);
    let mut host = ScriptedHost::new(|_, tension| tension);
    // Exports every stage and step, including MAX/MIN, whatever the query asks for.
    host.ignore_scope = true;

    let report = converge(
        &mut host,
        &initial,
        &targets,
        &ConvergeOptions::default(),
        &mut NoopObserver,
    )
    .expect("run completes");

    assert_eq!(report.outcome, Outcome::Converged);
    assert_eq!(report.iterations(), 1);
    let row = report.final_table.row(2001).expect("tracked element");
    assert_relative_eq!(row.achieved_force, 1.2e6);
}

#[test]
fn repeated_terminal_rows_abort_the_run() {
    let initial = tensions(&[(2001, 1000.0)]);
    let targets = TargetTable::from_tensions(&initial);
    let mut host = ScriptedHost::new(|_, tension| tension);
    host.repeat_terminal_row = true;

    let err = converge(
        &mut host,
        &initial,
        &targets,
        &ConvergeOptions::default(),
        &mut NoopObserver,
    )
    .expect_err("two rows claim the terminal force");

    assert!(matches!(
        err,
        TuningError::DataIntegrity {
            iteration: 1,
            source: DataIntegrityError::AmbiguousForce {
                element: 2001,
                rows: 2
            },
            ..
        }
    ));
    assert_eq!(err.offending_elements(), vec![2001]);
}
