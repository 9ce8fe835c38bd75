use std::fmt::Display;

use anyhow::bail;

use crate::errors::ModelError;
use crate::substitution_models::{
    check_param_count, FreqVector, QMatrixBuilder, RateMatrix, Scaling, SubstMatrix,
};
use crate::Result;

/// Exchangeabilities of a custom model: either fixed or one free value per allowed pair.
#[derive(Clone, Debug, PartialEq)]
pub enum CustomRates {
    Fixed(SubstMatrix),
    /// Free exchangeabilities for the allowed pairs, the first allowed pair fixed at 1.
    Free,
}

/// Reversible model over a user-defined alphabet where only the pairs marked as allowed
/// may exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct CustomModel {
    name: String,
    n: usize,
    allowed: Vec<(usize, usize)>,
    rates: CustomRates,
}

impl Display for CustomModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} states)", self.name, self.n)
    }
}

impl CustomModel {
    /// `allowed[i][j]` marks the pairs that may change into each other; it must be symmetric.
    pub fn new(name: &str, allowed: &[Vec<bool>], rates: CustomRates) -> Result<Self> {
        let n = allowed.len();
        if n < 2 || allowed.iter().any(|row| row.len() != n) {
            bail!(ModelError::ModelConfiguration(format!(
                "Allowed-pair mask of the {} model must be square with at least 2 states",
                name
            )));
        }
        let mut pairs = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                if allowed[i][j] != allowed[j][i] {
                    bail!(ModelError::ModelConfiguration(format!(
                        "Allowed-pair mask of the {} model is not symmetric at ({}, {})",
                        name, i, j
                    )));
                }
                if allowed[i][j] {
                    pairs.push((i, j));
                }
            }
        }
        if pairs.is_empty() {
            bail!(ModelError::ModelConfiguration(format!(
                "The {} model allows no changes",
                name
            )));
        }
        if let CustomRates::Fixed(s) = &rates {
            if s.nrows() != n || s.ncols() != n {
                bail!(ModelError::ModelConfiguration(format!(
                    "Exchangeabilities of the {} model must be {}x{}",
                    name, n, n
                )));
            }
            for i in 0..n {
                for j in 0..n {
                    if i != j && !allowed[i][j] && s[(i, j)] > 0.0 {
                        bail!(ModelError::ModelConfiguration(format!(
                            "The {} model assigns rate {} to the disallowed pair ({}, {})",
                            name,
                            s[(i, j)],
                            i,
                            j
                        )));
                    }
                }
            }
        }
        Ok(Self {
            name: name.to_string(),
            n,
            allowed: pairs,
            rates,
        })
    }

    /// All pairs allowed, all exchangeabilities equal: the n-state analogue of JC69.
    pub fn equal_rates(n: usize) -> Result<Self> {
        let allowed = vec![vec![true; n]; n];
        let s = SubstMatrix::from_fn(n, n, |i, j| if i == j { 0.0 } else { 1.0 });
        Self::new("equal rates", &allowed, CustomRates::Fixed(s))
    }

    pub fn allowed_pairs(&self) -> &[(usize, usize)] {
        &self.allowed
    }

    fn exchangeabilities(&self, params: &[f64]) -> SubstMatrix {
        match &self.rates {
            CustomRates::Fixed(s) => s.clone(),
            CustomRates::Free => {
                let mut s = SubstMatrix::zeros(self.n, self.n);
                for (k, &(i, j)) in self.allowed.iter().enumerate() {
                    let value = if k == 0 { 1.0 } else { params[k - 1] };
                    s[(i, j)] = value;
                    s[(j, i)] = value;
                }
                s
            }
        }
    }
}

impl QMatrixBuilder for CustomModel {
    fn n_states(&self) -> usize {
        self.n
    }

    fn param_count(&self) -> usize {
        match self.rates {
            CustomRates::Fixed(_) => 0,
            CustomRates::Free => self.allowed.len() - 1,
        }
    }

    fn param_names(&self) -> Vec<String> {
        match self.rates {
            CustomRates::Fixed(_) => vec![],
            CustomRates::Free => self
                .allowed
                .iter()
                .skip(1)
                .map(|(i, j)| format!("r_{}_{}", i, j))
                .collect(),
        }
    }

    fn default_params(&self) -> Vec<f64> {
        vec![1.0; self.param_count()]
    }

    fn has_free_freqs(&self) -> bool {
        true
    }

    fn build_q(&self, params: &[f64], freqs: &FreqVector, scaling: Scaling) -> Result<RateMatrix> {
        check_param_count(self, params)?;
        RateMatrix::from_exchangeabilities(&self.exchangeabilities(params), freqs, scaling)
    }
}
