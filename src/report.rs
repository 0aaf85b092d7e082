use cabletune::{TuningError, TuningReport};
use std::fmt::Write;

/// Render a textual summary of a finished tuning run.
///
/// One line per cable compares the last applied tension with the force the
/// host reported for it, so a non-converged run shows which cables lag.
#[must_use]
pub fn render_summary(report: &TuningReport) -> String {
    let mut output = String::new();

    writeln!(
        &mut output,
        "Tension tuning {} after {} iteration(s) at {}",
        report.outcome,
        report.iterations(),
        report.stage_step
    )
    .expect("writing to string cannot fail");

    writeln!(
        &mut output,
        "Largest deviation: {:.4}%",
        report.max_abs_deviation_pct()
    )
    .expect("writing to string cannot fail");

    writeln!(
        &mut output,
        "{:>8} {:>16} {:>16} {:>16} {:>10}",
        "element", "target", "trial", "achieved", "dev %"
    )
    .expect("writing to string cannot fail");
    for row in &report.final_table.rows {
        writeln!(
            &mut output,
            "{:>8} {:>16.3} {:>16.3} {:>16.3} {:>+10.4}",
            row.element_id, row.target_tension, row.trial_tension, row.achieved_force, row.deviation_pct
        )
        .expect("writing to string cannot fail");
    }

    output
}

/// Render the diagnostic context carried by an aborted run.
#[must_use]
pub fn render_failure(error: &TuningError) -> String {
    let mut output = format!("Tension tuning failed: {error}\n");

    if let Some(iteration) = error.iteration() {
        writeln!(&mut output, "Aborted in iteration {iteration}")
            .expect("writing to string cannot fail");
    }
    let elements = error.offending_elements();
    if !elements.is_empty() {
        writeln!(&mut output, "Offending elements: {elements:?}")
            .expect("writing to string cannot fail");
    }
    match error.last_snapshot() {
        Some(snapshot) => writeln!(
            &mut output,
            "Last completed snapshot: {} (max deviation {:.4}%)",
            snapshot.label(),
            snapshot.max_abs_deviation_pct()
        )
        .expect("writing to string cannot fail"),
        None => output.push_str("No iteration completed\n"),
    }

    output
}
