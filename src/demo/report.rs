use std::fmt::{self, Write};

use femstate::{AnalysisReport, Domain, Tag};
use nalgebra::Vector3;

use super::model::DemoModel;

/// Numbers printed at the end of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct Summary {
    /// Steps committed by the run.
    pub steps: u32,
    /// Final committed load factor.
    pub load_factor: f64,
    /// Newton iterations of the converged steps.
    pub iterations: u32,
    /// Increments retried with half the size.
    pub cutbacks: u32,
    /// Committed displacement of the loaded node.
    pub apex_displacement: Vector3<f64>,
    /// Axial force of each bar.
    pub member_forces: Vec<(Tag, f64)>,
    /// Number of checkpoints written.
    pub checkpoints: usize,
}

impl Summary {
    /// Gather the summary from an analysed domain.
    #[must_use]
    pub fn collect(domain: &Domain, model: &DemoModel, report: &AnalysisReport) -> Self {
        let apex_displacement = domain
            .node(model.apex)
            .map_or_else(Vector3::zeros, |node| *node.committed_displacement());
        let member_forces = model
            .members
            .iter()
            .filter_map(|tag| Some((*tag, domain.element(*tag)?.axial_force())))
            .collect();
        Self {
            steps: report.steps,
            load_factor: report.load_factor,
            iterations: report.iterations,
            cutbacks: report.cutbacks,
            apex_displacement,
            member_forces,
            checkpoints: report.checkpoints.len(),
        }
    }
}

/// Render a textual summary of the run.
///
/// # Errors
///
/// Returns [`fmt::Error`] if formatting fails.
pub fn render_summary(summary: &Summary) -> Result<String, fmt::Error> {
    let mut output = String::new();

    // State how far the load was taken and what it cost before any response
    // numbers, so a cut-short run is obvious from the first line.
    writeln!(
        &mut output,
        "Two-bar truss: {} step(s) to load factor {:.3} ({} iteration(s), {} cutback(s))",
        summary.steps, summary.load_factor, summary.iterations, summary.cutbacks
    )?;

    // The apex is the only free node. Scientific notation matches hand
    // calculations.
    let u = &summary.apex_displacement;
    writeln!(
        &mut output,
        "Apex displacement: ux = {:+.3e} m, uy = {:+.3e} m, uz = {:+.3e} m",
        u.x, u.y, u.z
    )?;

    // Positive forces are tension. Comparing both bars against the applied
    // load is a quick equilibrium check.
    for (tag, axial_force) in &summary.member_forces {
        writeln!(&mut output, "Member {tag}: axial force = {axial_force:+.1} N")?;
    }

    // Each checkpoint is one commit tag that a later run can restore.
    if summary.checkpoints == 0 {
        output.push_str("Checkpoints: none\n");
    } else {
        writeln!(&mut output, "Checkpoints: {}", summary.checkpoints)?;
    }

    Ok(output)
}
