use argmin::core::{CostFunction, Executor, Gradient, IterState, State};
use argmin::solver::brent::BrentOpt;
use log::{debug, info};
use nalgebra::DMatrix;

use crate::engine::LikelihoodEngine;
use crate::parameters::{ModelValues, Phase};
use crate::Result;

/// Relative step of the central-difference gradient.
pub const GRADIENT_STEP: f64 = 1e-5;
/// Relative step of the central-difference Hessian.
pub const HESSIAN_STEP: f64 = 1e-4;

/// Negative log-likelihood of an engine as an argmin problem over the optimising-phase vector.
pub struct LikelihoodObjective<'a> {
    engine: &'a LikelihoodEngine,
    phase: Phase,
    bounds: Vec<(f64, f64)>,
}

impl<'a> LikelihoodObjective<'a> {
    pub fn new(engine: &'a LikelihoodEngine) -> Self {
        Self::with_phase(engine, Phase::Optimising)
    }

    pub fn with_phase(engine: &'a LikelihoodEngine, phase: Phase) -> Self {
        Self {
            engine,
            phase,
            bounds: engine.bounds(phase),
        }
    }

    pub fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    pub fn hessian(&self, x: &[f64]) -> Result<DMatrix<f64>> {
        numerical_hessian(|x| self.value(x), x, &self.bounds)
    }

    fn value(&self, x: &[f64]) -> Result<f64> {
        Ok(self.engine.evaluate(x, self.phase)?.neg_log_likelihood)
    }
}

impl CostFunction for LikelihoodObjective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Vec<f64>) -> Result<f64> {
        self.value(x)
    }
}

impl Gradient for LikelihoodObjective<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Vec<f64>) -> Result<Vec<f64>> {
        numerical_gradient(|x| self.value(x), x, &self.bounds)
    }
}

fn step(x: f64, relative: f64, (lo, hi): (f64, f64)) -> f64 {
    (relative * x.abs().max(1.0)).min((hi - lo) / 4.0)
}

/// Moves every coordinate at least one step inside its bounds.
fn interior(x: &[f64], steps: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    x.iter()
        .zip(steps)
        .zip(bounds)
        .map(|((v, h), (lo, hi))| v.clamp(lo + h, hi - h))
        .collect()
}

/// Central-difference gradient of `f`. Coordinates closer than one step to a bound are
/// differentiated one step inside it, so `f` is only evaluated within the bounds.
pub fn numerical_gradient<F>(f: F, x: &[f64], bounds: &[(f64, f64)]) -> Result<Vec<f64>>
where
    F: Fn(&[f64]) -> Result<f64>,
{
    let steps: Vec<f64> = x
        .iter()
        .zip(bounds)
        .map(|(v, b)| step(*v, GRADIENT_STEP, *b))
        .collect();
    let centre = interior(x, &steps, bounds);
    let mut probe = centre.clone();
    let mut gradient = Vec::with_capacity(x.len());
    for (i, h) in steps.iter().enumerate() {
        probe[i] = centre[i] + h;
        let up = f(&probe)?;
        probe[i] = centre[i] - h;
        let down = f(&probe)?;
        probe[i] = centre[i];
        gradient.push((up - down) / (2.0 * h));
    }
    Ok(gradient)
}

/// Central-difference Hessian of `f`, evaluated around the same interior point as
/// [`numerical_gradient`].
pub fn numerical_hessian<F>(f: F, x: &[f64], bounds: &[(f64, f64)]) -> Result<DMatrix<f64>>
where
    F: Fn(&[f64]) -> Result<f64>,
{
    let n = x.len();
    let steps: Vec<f64> = x
        .iter()
        .zip(bounds)
        .map(|(v, b)| step(*v, HESSIAN_STEP, *b))
        .collect();
    let centre = interior(x, &steps, bounds);
    let f0 = f(&centre)?;
    let mut probe = centre.clone();
    let mut eval = |shifts: &[(usize, f64)]| -> Result<f64> {
        for (i, s) in shifts {
            probe[*i] = centre[*i] + s;
        }
        let value = f(&probe);
        for (i, _) in shifts {
            probe[*i] = centre[*i];
        }
        value
    };
    let mut hessian = DMatrix::zeros(n, n);
    for i in 0..n {
        let hi = steps[i];
        let up = eval(&[(i, hi)])?;
        let down = eval(&[(i, -hi)])?;
        hessian[(i, i)] = (up - 2.0 * f0 + down) / (hi * hi);
        for j in 0..i {
            let hj = steps[j];
            let pp = eval(&[(i, hi), (j, hj)])?;
            let pm = eval(&[(i, hi), (j, -hj)])?;
            let mp = eval(&[(i, -hi), (j, hj)])?;
            let mm = eval(&[(i, -hi), (j, -hj)])?;
            let value = (pp - pm - mp + mm) / (4.0 * hi * hj);
            hessian[(i, j)] = value;
            hessian[(j, i)] = value;
        }
    }
    Ok(hessian)
}

/// One coordinate of the parameter vector, with all others held fixed.
struct CoordinateCost<'a> {
    engine: &'a LikelihoodEngine,
    x: &'a [f64],
    coordinate: usize,
}

impl CostFunction for CoordinateCost<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, value: &f64) -> Result<f64> {
        let mut x = self.x.to_vec();
        x[self.coordinate] = *value;
        Ok(self.engine.evaluate(&x, Phase::Optimising)?.neg_log_likelihood)
    }
}

pub struct ParameterOptimisationResult {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    /// Optimum in the direct form of [`Phase::Final`].
    pub params: Vec<f64>,
    pub values: ModelValues,
}

/// Coordinate-wise maximum likelihood fit of all free parameters of an engine.
///
/// Every round runs a bounded Brent search along each coordinate in turn; rounds repeat until
/// the negative log-likelihood improves by less than `epsilon`. The engine is locked for the
/// duration of the run.
pub struct ParameterOptimiser<'a> {
    pub(crate) epsilon: f64,
    pub(crate) max_iterations: usize,
    pub(crate) engine: &'a mut LikelihoodEngine,
    start: Option<Vec<f64>>,
}

impl<'a> ParameterOptimiser<'a> {
    pub fn new(engine: &'a mut LikelihoodEngine) -> Self {
        Self {
            epsilon: 1e-3,
            max_iterations: 100,
            engine,
            start: None,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Starting point in the direct form; the engine's initial values otherwise.
    pub fn with_start(mut self, params: Vec<f64>) -> Self {
        self.start = Some(params);
        self
    }

    pub fn run(self) -> Result<ParameterOptimisationResult> {
        info!(
            "Optimising {} parameters of {}.",
            self.engine.parameter_count(),
            self.engine.descriptor()
        );
        let start = match &self.start {
            Some(params) => {
                self.engine
                    .layout()
                    .convert(params, Phase::Final, Phase::Optimising)?
            }
            None => self.engine.initial_params(Phase::Optimising)?,
        };
        self.engine.begin_run()?;
        let outcome = self.rounds(start);
        self.engine.end_run();
        let (x, initial_cost, iterations) = outcome?;

        let params = self
            .engine
            .layout()
            .convert(&x, Phase::Optimising, Phase::Final)?;
        let final_cost = self.engine.evaluate(&params, Phase::Final)?.neg_log_likelihood;
        info!(
            "Final cost: {}, achieved in {} iteration(s).",
            final_cost, iterations
        );
        Ok(ParameterOptimisationResult {
            initial_cost,
            final_cost,
            iterations,
            values: self.engine.values(&params, Phase::Final)?,
            params,
        })
    }

    fn rounds(&self, mut x: Vec<f64>) -> Result<(Vec<f64>, f64, usize)> {
        let engine = &*self.engine;
        let bounds = engine.bounds(Phase::Optimising);
        let names = engine.layout().names();
        let initial_cost = engine.evaluate(&x, Phase::Optimising)?.neg_log_likelihood;
        info!("Initial cost: {}.", initial_cost);
        let mut curr_cost = initial_cost;
        let mut prev_cost = f64::INFINITY;
        let mut iterations = 0;
        while prev_cost - curr_cost > self.epsilon && iterations < self.max_iterations {
            iterations += 1;
            debug!("Iteration: {}", iterations);
            prev_cost = curr_cost;
            for coordinate in 0..x.len() {
                let (value, cost) = self.optimise_coordinate(&x, coordinate, bounds[coordinate])?;
                if cost < curr_cost {
                    x[coordinate] = value;
                    curr_cost = cost;
                    debug!(
                        "Optimised {} to value {:.6} with cost {:.6}",
                        names[coordinate], value, cost
                    );
                }
            }
        }
        Ok((x, initial_cost, iterations))
    }

    /// Brent search along one coordinate, over a window around the current value that widens
    /// from round to round as the value moves.
    fn optimise_coordinate(
        &self,
        x: &[f64],
        coordinate: usize,
        (lo, hi): (f64, f64),
    ) -> Result<(f64, f64)> {
        let current = x[coordinate].clamp(lo, hi);
        let (min, max) = if lo >= 0.0 {
            (lo, hi.min((current * 10.0).max(1.0)))
        } else {
            ((current - 10.0).max(lo), (current + 10.0).min(hi))
        };
        let cost = CoordinateCost {
            engine: &*self.engine,
            x,
            coordinate,
        };
        let res = Executor::new(cost, BrentOpt::new(min, max))
            .configure(|_| IterState::new().param(current).max_iters(500))
            .run()?;
        let state = res.state();
        match state.get_best_param() {
            Some(value) => Ok((*value, state.get_best_cost())),
            None => Ok((current, f64::INFINITY)),
        }
    }
}

#[cfg(test)]
mod tests;
