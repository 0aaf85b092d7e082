use std::ops::ControlFlow;

use cabletune::{
    converge, AnalysisHost, ConvergeOptions, ElementRecord, FlatTable, ForceQuery, HostError,
    IterationSnapshot, StageRecord, TargetTable, TensionTable,
};
use nalgebra::{DMatrix, DVector};
use serde_json::json;

/// Fan of stay cables where tensioning one cable also loads its neighbours.
///
/// The completed-bridge force is `t + A (t - t_star)`: `t_star` is the set of
/// pretensions that reproduces itself and `A` couples adjacent cables.
struct SyntheticBridge {
    elements: Vec<u32>,
    coupling: DMatrix<f64>,
    balanced: DVector<f64>,
    applied: DVector<f64>,
}

impl SyntheticBridge {
    fn new(balanced: &[f64]) -> Self {
        let n = balanced.len();
        let coupling = DMatrix::from_fn(n, n, |i, j| match i.abs_diff(j) {
            0 => 0.6,
            1 => 0.08,
            _ => 0.0,
        });
        Self {
            elements: (0..n as u32).map(|i| 2001 + i).collect(),
            coupling,
            balanced: DVector::from_row_slice(balanced),
            applied: DVector::zeros(n),
        }
    }
}

impl AnalysisHost for SyntheticBridge {
    fn set_tensions(&mut self, tensions: &TensionTable) -> Result<(), HostError> {
        for (i, element) in self.elements.iter().enumerate() {
            self.applied[i] = tensions
                .tension(*element)
                .ok_or_else(|| HostError::Request(format!("element {element} not in model")))?;
        }
        Ok(())
    }

    fn run_analysis(&mut self) -> Result<(), HostError> {
        Ok(())
    }

    fn list_stages(&mut self) -> Result<Vec<StageRecord>, HostError> {
        Ok(vec![
            StageRecord::new("1", "Pylon"),
            StageRecord::new("2", "Deck closure"),
            StageRecord::new("3", "Completed"),
        ])
    }

    fn query_force_table(&mut self, query: &ForceQuery) -> Result<FlatTable, HostError> {
        let forces = &self.applied + &self.coupling * (&self.applied - &self.balanced);
        let steps = match &query.stage_step {
            Some(label) => vec![label.step.clone()],
            None => ["001(first)", "002(last)", "MAX", "MIN"].map(String::from).to_vec(),
        };
        let mut rows = Vec::new();
        for (i, element) in self.elements.iter().enumerate() {
            if !query.elements.contains(element) {
                continue;
            }
            for step in &steps {
                rows.push(vec![json!(element), json!(step), json!(forces[i])]);
            }
        }
        Ok(FlatTable::new(
            vec!["Elem".into(), "Step".into(), "Force-I".into()],
            rows,
        )?)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let balanced = [2.10e6, 2.45e6, 2.80e6, 3.05e6, 3.30e6];
    let mut bridge = SyntheticBridge::new(&balanced);

    // Start every cable at the same design tension.
    let initial = TensionTable::from_records(bridge.elements.iter().map(|&element| {
        ElementRecord::new(element, 1, "cable pretension", "stays", 2.5e6)
    }))?;
    let targets: TargetTable = bridge
        .elements
        .iter()
        .copied()
        .zip(balanced)
        .collect();

    let mut progress = |snapshot: &IterationSnapshot| {
        println!(
            "{}: max deviation {:.4}%",
            snapshot.label(),
            snapshot.max_abs_deviation_pct()
        );
        ControlFlow::Continue(())
    };
    let report = converge(
        &mut bridge,
        &initial,
        &targets,
        &ConvergeOptions::default(),
        &mut progress,
    )?;

    println!("{} at {}", report.outcome, report.stage_step);
    for record in report.final_tensions.iter() {
        println!("{:>6} {:>14.1} N", record.element_id, record.tension);
    }

    Ok(())
}
