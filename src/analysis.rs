//! Load-controlled static analysis with Newton-Raphson iterations.
//!
//! The tangent stiffness is assembled with the direct stiffness method
//! (<https://en.wikipedia.org/wiki/Direct_stiffness_method>) over the free
//! degrees of freedom and solved with an LU decomposition.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Vector3};
use tracing::{debug, info, trace, warn};

use crate::channel::ExchangeChannel;
use crate::config::AnalysisConfig;
use crate::domain::Domain;
use crate::errors::{AnalysisError, DomainError, StateError};
use crate::tagged::{CommitTag, Tag, Tagged};

/// Outcome of [`StaticAnalysis::run`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnalysisReport {
    /// Steps committed during the run.
    pub steps: u32,
    /// Committed load factor at the end of the run.
    pub load_factor: f64,
    /// Newton iterations spent on converged steps.
    pub iterations: u32,
    /// Increments that failed and were retried with half the size.
    pub cutbacks: u32,
    /// Commit tags of the checkpoints written.
    pub checkpoints: Vec<CommitTag>,
}

/// Equation numbers of the free degrees of freedom.
#[derive(Debug)]
struct DofMap {
    equations: HashMap<Tag, [Option<usize>; 3]>,
    count: usize,
}

impl DofMap {
    fn new(domain: &Domain) -> Self {
        let mut count = 0;
        let equations = domain
            .nodes()
            .map(|node| {
                let mut numbers = [None; 3];
                for (axis, fixed) in node.fixity().iter().enumerate() {
                    if !fixed {
                        numbers[axis] = Some(count);
                        count += 1;
                    }
                }
                (node.tag(), numbers)
            })
            .collect();
        Self { equations, count }
    }

    /// Equation number of each element degree of freedom, `None` when
    /// restrained.
    fn locations(&self, nodes: &[Tag]) -> Vec<Option<usize>> {
        nodes
            .iter()
            .flat_map(|node| self.equations.get(node).copied().unwrap_or([None; 3]))
            .collect()
    }

    fn stiffness(&self, domain: &Domain) -> DMatrix<f64> {
        let mut matrix = DMatrix::zeros(self.count, self.count);
        for element in domain.elements() {
            let local = element.tangent_stiffness();
            let dof_map = self.locations(element.node_tags());
            for (row_local, global_row) in dof_map.iter().enumerate() {
                let Some(global_row) = global_row else {
                    continue;
                };
                for (col_local, global_col) in dof_map.iter().enumerate() {
                    if let Some(global_col) = global_col {
                        matrix[(*global_row, *global_col)] += local[(row_local, col_local)];
                    }
                }
            }
        }
        matrix
    }

    /// Returns the unbalanced force and the norm of the external load.
    fn residual(&self, domain: &Domain) -> Result<(DVector<f64>, f64), DomainError> {
        let mut external = DVector::zeros(self.count);
        for (node, force) in domain.nodal_loads()? {
            for (axis, equation) in self.locations(&[node]).into_iter().enumerate() {
                if let Some(equation) = equation {
                    external[equation] += force[axis];
                }
            }
        }
        let mut residual = external.clone();
        for element in domain.elements() {
            let forces = element.resisting_force();
            for (local, equation) in self.locations(element.node_tags()).into_iter().enumerate() {
                if let Some(equation) = equation {
                    residual[equation] -= forces[local];
                }
            }
        }
        Ok((residual, external.norm()))
    }

    fn apply(&self, domain: &mut Domain, correction: &DVector<f64>) -> Result<(), StateError> {
        for (node, numbers) in &self.equations {
            let increment = Vector3::from_fn(|axis, _| {
                numbers[axis].map_or(0.0, |equation| correction[equation])
            });
            if let Some(node) = domain.node_mut(*node) {
                node.increment_trial_displacement(&increment)?;
            }
        }
        Ok(())
    }
}

/// Drives a [`Domain`] from its committed load factor to 1 in equal
/// increments, committing every converged step.
///
/// An increment that fails to converge is reverted and retried with half the
/// size until it falls below [`AnalysisConfig::min_step_fraction`] of the
/// nominal increment.
#[derive(Clone, Debug, Default)]
pub struct StaticAnalysis {
    config: AnalysisConfig,
}

impl StaticAnalysis {
    /// Create a driver with `config`.
    #[must_use]
    pub const fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    /// Settings of the driver.
    #[must_use]
    pub const fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Run the analysis, writing checkpoints to `checkpoints` when a channel is
    /// given and checkpoints are enabled.
    ///
    /// Each checkpoint uses the committed step count as its commit tag.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::EmptyDomain`] for a domain without nodes,
    /// [`AnalysisError::NotConverged`] when the increment shrank below its
    /// minimum and [`AnalysisError::Domain`] when a sweep or checkpoint fails.
    /// The domain is left at its last committed step.
    pub fn run(
        &self,
        domain: &mut Domain,
        mut checkpoints: Option<&mut dyn ExchangeChannel>,
    ) -> Result<AnalysisReport, AnalysisError> {
        if domain.node_count() == 0 {
            return Err(AnalysisError::EmptyDomain);
        }
        let dofs = DofMap::new(domain);
        let nominal = 1.0 / f64::from(self.config.load_steps);
        let minimum = nominal * self.config.min_step_fraction;
        let mut report = AnalysisReport {
            load_factor: domain.committed_load_factor(),
            ..AnalysisReport::default()
        };
        info!(
            equations = dofs.count,
            load_steps = self.config.load_steps,
            "static analysis started"
        );

        while 1.0 - report.load_factor > f64::EPSILON {
            let mut increment = nominal.min(1.0 - report.load_factor);
            loop {
                let target = report.load_factor + increment;
                if let Some(iterations) = self.attempt(domain, &dofs, target)? {
                    domain.commit()?;
                    report.steps += 1;
                    report.iterations += iterations;
                    report.load_factor = target;
                    debug!(
                        step = domain.step(),
                        load_factor = target,
                        iterations,
                        "step committed"
                    );
                    break;
                }
                domain.revert_to_last_commit()?;
                increment /= 2.0;
                report.cutbacks += 1;
                if increment < minimum {
                    warn!(
                        load_factor = report.load_factor,
                        increment,
                        "increment below minimum"
                    );
                    return Err(AnalysisError::NotConverged {
                        load_factor: report.load_factor,
                        increment,
                    });
                }
                debug!(load_factor = report.load_factor, increment, "cutting back");
            }

            let interval = self.config.checkpoint_interval;
            if let Some(channel) = checkpoints.as_deref_mut() {
                if interval > 0 && domain.step() % interval == 0 {
                    let commit_tag = CommitTag(domain.step());
                    domain.checkpoint(channel, commit_tag)?;
                    report.checkpoints.push(commit_tag);
                }
            }
        }

        info!(
            steps = report.steps,
            iterations = report.iterations,
            cutbacks = report.cutbacks,
            "static analysis finished"
        );
        Ok(report)
    }

    /// Iterate at `load_factor` and return the iteration count on convergence.
    fn attempt(
        &self,
        domain: &mut Domain,
        dofs: &DofMap,
        load_factor: f64,
    ) -> Result<Option<u32>, AnalysisError> {
        domain.set_load_factor(load_factor);
        for iteration in 0..=self.config.max_iterations {
            let (residual, reference) = dofs.residual(domain)?;
            let norm = residual.norm();
            trace!(iteration, norm, "unbalanced force");
            if norm <= self.config.tolerance * reference.max(1.0) {
                return Ok(Some(iteration));
            }
            if iteration == self.config.max_iterations {
                break;
            }
            let Some(correction) = dofs.stiffness(domain).lu().solve(&residual) else {
                debug!(load_factor, iteration, "singular tangent stiffness");
                return Ok(None);
            };
            if let Err(error) = dofs.apply(domain, &correction) {
                debug!(load_factor, %error, "rejected displacement correction");
                return Ok(None);
            }
            match domain.update_elements() {
                Ok(()) => {}
                Err(DomainError::Update { element, source }) => {
                    debug!(
                        load_factor,
                        %element,
                        error = %source,
                        "element rejected its trial state"
                    );
                    return Ok(None);
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::element::TrussElement;
    use crate::geometry::{force, point};
    use crate::material::ElasticMaterial;
    use crate::node::Node;
    use crate::pattern::PlainPattern;

    fn bar(load: f64) -> (Domain, Tag) {
        let mut domain = Domain::new();
        let fixed = domain.add_node(Node::new(point(0.0, 0.0, 0.0)).with_fixity([true; 3]));
        let free = domain.add_node(Node::new(point(1.0, 0.0, 0.0)).with_fixity([false, true, true]));
        let material = Box::new(ElasticMaterial::new(Tag(1), 200.0e9));
        domain
            .add_element(Box::new(TrussElement::new([fixed, free], 0.01, material)))
            .expect("nodes exist");
        domain
            .add_pattern(Box::new(PlainPattern::new().with_load(free, force(load, 0.0, 0.0))))
            .expect("node exists");
        (domain, free)
    }

    #[test]
    fn empty_domain_is_rejected() {
        let mut domain = Domain::new();
        let error = StaticAnalysis::default()
            .run(&mut domain, None)
            .expect_err("no nodes");
        assert!(matches!(error, AnalysisError::EmptyDomain));
    }

    #[test]
    fn linear_bar_reaches_the_closed_form_displacement() {
        let (mut domain, free) = bar(-1_000.0);
        let analysis = StaticAnalysis::new(AnalysisConfig {
            load_steps: 4,
            ..AnalysisConfig::default()
        });
        let report = analysis.run(&mut domain, None).expect("converges");
        assert_eq!(report.steps, 4);
        assert_eq!(report.cutbacks, 0);
        assert_relative_eq!(report.load_factor, 1.0, epsilon = 1.0e-12);
        let node = domain.node(free).expect("node exists");
        assert_relative_eq!(node.committed_displacement().x, -5.0e-7, max_relative = 1.0e-9);
    }

    #[test]
    fn dof_map_skips_restrained_directions() {
        let (domain, free) = bar(1.0);
        let dofs = DofMap::new(&domain);
        assert_eq!(dofs.count, 1);
        assert_eq!(dofs.locations(&[free]), vec![Some(0), None, None]);
    }
}
