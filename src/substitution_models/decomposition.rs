use anyhow::bail;
use log::{debug, warn};
use nalgebra::{DVector, Schur, SymmetricEigen};

use crate::errors::ModelError;
use crate::substitution_models::{RateMatrix, SubstMatrix};
use crate::Result;

/// Branch lengths below this are treated as zero and give the identity transition matrix.
pub const ZERO_BRANCH_LENGTH: f64 = 1e-12;

const SMALL_DENOMINATOR: f64 = 1e-10;
const MAX_SCHUR_ITERATIONS: usize = 1000;

/// Real eigen-decomposition `Q = V diag(eigenvalues) U` with `U V = I`.
#[derive(Clone, Debug, PartialEq)]
pub struct EigenSystem {
    pub eigenvalues: DVector<f64>,
    pub v: SubstMatrix,
    pub u: SubstMatrix,
}

impl EigenSystem {
    /// Decomposition of a reversible generator through the symmetric matrix
    /// `D^1/2 Q D^-1/2`, `D = diag(freqs)`. All frequencies must be positive.
    pub fn symmetric(rate: &RateMatrix) -> Result<Self> {
        let n = rate.n();
        if let Some(f) = rate.freqs.iter().find(|f| **f <= 0.0) {
            bail!(ModelError::NumericalDegeneracy(format!(
                "Symmetric decomposition needs positive frequencies, got {}",
                f
            )));
        }
        let sqrt_pi = rate.freqs.map(f64::sqrt);
        let a = SubstMatrix::from_fn(n, n, |i, j| rate.q[(i, j)] * sqrt_pi[i] / sqrt_pi[j]);
        let a = (&a + a.transpose()) * 0.5;
        let eigen = SymmetricEigen::new(a);
        let r = eigen.eigenvectors;
        let v = SubstMatrix::from_fn(n, n, |i, k| r[(i, k)] / sqrt_pi[i]);
        let u = SubstMatrix::from_fn(n, n, |k, j| r[(j, k)] * sqrt_pi[j]);
        Ok(Self {
            eigenvalues: eigen.eigenvalues,
            v,
            u,
        })
    }

    /// Decomposition of any generator with a real spectrum, through its real Schur form.
    pub fn general(rate: &RateMatrix) -> Result<Self> {
        let n = rate.n();
        let Some(schur) = Schur::try_new(rate.q.clone(), f64::EPSILON, MAX_SCHUR_ITERATIONS)
        else {
            bail!(ModelError::NumericalDegeneracy(
                "Schur decomposition of the rate matrix did not converge".to_string()
            ));
        };
        let Some(eigenvalues) = schur.eigenvalues() else {
            bail!(ModelError::NumericalDegeneracy(
                "Rate matrix has complex eigenvalues".to_string()
            ));
        };
        let (z, t) = schur.unpack();

        // eigenvectors of the upper triangular factor by back substitution
        let mut y = SubstMatrix::zeros(n, n);
        for k in 0..n {
            y[(k, k)] = 1.0;
            for i in (0..k).rev() {
                let sum: f64 = ((i + 1)..=k).map(|j| t[(i, j)] * y[(j, k)]).sum();
                let mut denominator = t[(i, i)] - t[(k, k)];
                if denominator.abs() < SMALL_DENOMINATOR {
                    denominator = SMALL_DENOMINATOR.copysign(denominator);
                }
                y[(i, k)] = -sum / denominator;
            }
        }
        let v = z * y;
        let Some(u) = v.clone().try_inverse() else {
            bail!(ModelError::NumericalDegeneracy(
                "Eigenvectors of the rate matrix are singular".to_string()
            ));
        };
        let system = Self { eigenvalues, v, u };
        let error = (system.reconstruct() - &rate.q).amax();
        if !(error <= 1e-8 * rate.q.amax().max(1.0)) {
            bail!(ModelError::NumericalDegeneracy(format!(
                "Eigen-decomposition reconstructs the rate matrix with error {:e}",
                error
            )));
        }
        Ok(system)
    }

    fn reconstruct(&self) -> SubstMatrix {
        let mut vd = self.v.clone();
        for (k, mut col) in vd.column_iter_mut().enumerate() {
            col *= self.eigenvalues[k];
        }
        vd * &self.u
    }

    /// `P(t) = V diag(exp(eigenvalues * t)) U`.
    pub fn p(&self, t: f64) -> SubstMatrix {
        let n = self.eigenvalues.len();
        if t < ZERO_BRANCH_LENGTH {
            return SubstMatrix::identity(n, n);
        }
        let mut vd = self.v.clone();
        for (k, mut col) in vd.column_iter_mut().enumerate() {
            col *= (self.eigenvalues[k] * t).exp();
        }
        clip_negative(vd * &self.u)
    }
}

/// Ready-to-exponentiate form of a rate matrix.
#[derive(Clone, Debug, PartialEq)]
pub enum Decomposition {
    Eigen(EigenSystem),
    /// Generator kept as is and exponentiated directly for every branch.
    Dense(SubstMatrix),
}

impl Decomposition {
    /// Eigen-decomposes `rate`, symmetrically when it is reversible with positive frequencies.
    /// Falls back to direct exponentiation when no real decomposition is available.
    pub fn new(rate: &RateMatrix) -> Self {
        let eigen = if rate.reversible && rate.freqs.iter().all(|f| *f > 0.0) {
            EigenSystem::symmetric(rate)
        } else {
            EigenSystem::general(rate)
        };
        match eigen {
            Ok(eigen) => {
                debug!("Decomposed {}", rate);
                Decomposition::Eigen(eigen)
            }
            Err(e) => {
                warn!("{}, falling back to direct exponentiation", e);
                Decomposition::Dense(rate.q.clone())
            }
        }
    }

    /// Keeps the raw generator, for matrices that are only exponentiated once.
    pub fn dense(rate: &RateMatrix) -> Self {
        Decomposition::Dense(rate.q.clone())
    }

    pub fn n(&self) -> usize {
        match self {
            Decomposition::Eigen(e) => e.eigenvalues.len(),
            Decomposition::Dense(q) => q.nrows(),
        }
    }

    /// Transition probabilities over a branch of length `t`.
    pub fn p(&self, t: f64) -> SubstMatrix {
        match self {
            Decomposition::Eigen(e) => e.p(t),
            Decomposition::Dense(q) => {
                let n = q.nrows();
                if t < ZERO_BRANCH_LENGTH {
                    return SubstMatrix::identity(n, n);
                }
                clip_negative((q * t).exp())
            }
        }
    }
}

fn clip_negative(mut p: SubstMatrix) -> SubstMatrix {
    p.iter_mut().for_each(|x| {
        if *x < 0.0 {
            *x = 0.0
        }
    });
    p
}
