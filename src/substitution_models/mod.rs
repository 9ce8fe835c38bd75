use std::fmt::Display;

use anyhow::bail;
use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::alphabets::Alphabet;
use crate::errors::ModelError;
use crate::Result;

pub mod codon_models;
pub mod custom_models;
pub mod decomposition;
pub mod dna_models;
pub mod protein_models;

pub use codon_models::*;
pub use custom_models::*;
pub use decomposition::*;
pub use dna_models::*;
pub use protein_models::*;

pub type SubstMatrix = DMatrix<f64>;
pub type FreqVector = DVector<f64>;

/// Tolerance on the sum of a frequency vector.
pub const FREQ_TOLERANCE: f64 = 1e-6;

#[macro_export]
macro_rules! frequencies {
    ($slice:expr) => {
        $crate::substitution_models::FreqVector::from_column_slice($slice)
    };
}

/// Whether a rate matrix is rescaled to one expected substitution per unit time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scaling {
    Normalised,
    /// The matrix is left as built and its mean rate is only reported.
    Unscaled,
}

/// Generator of the substitution process together with its stationary distribution.
#[derive(Clone, Debug, PartialEq)]
pub struct RateMatrix {
    pub q: SubstMatrix,
    pub freqs: FreqVector,
    /// Expected substitution rate at stationarity of the matrix as built, before any scaling.
    pub mean_rate: f64,
    pub reversible: bool,
    pub normalised: bool,
}

impl RateMatrix {
    /// Reversible generator with `q[i, j] = s[i, j] * freqs[j]` off the diagonal.
    pub fn from_exchangeabilities(
        s: &SubstMatrix,
        freqs: &FreqVector,
        scaling: Scaling,
    ) -> Result<Self> {
        let n = freqs.len();
        if s.nrows() != n || s.ncols() != n {
            bail!(ModelError::ModelConfiguration(format!(
                "Exchangeability matrix is {}x{}, expected {}x{}",
                s.nrows(),
                s.ncols(),
                n,
                n
            )));
        }
        for i in 0..n {
            for j in (i + 1)..n {
                if (s[(i, j)] - s[(j, i)]).abs() > 1e-12 * s[(i, j)].abs().max(1.0) {
                    bail!(ModelError::ModelConfiguration(format!(
                        "Exchangeabilities must be symmetric, s[{i},{j}] = {} but s[{j},{i}] = {}",
                        s[(i, j)],
                        s[(j, i)]
                    )));
                }
            }
        }
        let rates = SubstMatrix::from_fn(n, n, |i, j| if i == j { 0.0 } else { s[(i, j)] * freqs[j] });
        Self::reversible(rates, freqs, scaling)
    }

    /// Generator from off-diagonal rates known to be reversible with respect to `freqs`.
    pub fn reversible(rates: SubstMatrix, freqs: &FreqVector, scaling: Scaling) -> Result<Self> {
        validate_freqs(freqs, rates.nrows())?;
        let q = fill_diagonal(rates)?;
        Self::finish(q, freqs.clone(), true, scaling)
    }

    /// Non-reversible generator; the stationary distribution is derived from the rates.
    pub fn general(rates: SubstMatrix, scaling: Scaling) -> Result<Self> {
        let q = fill_diagonal(rates)?;
        let freqs = stationary_distribution(&q)?;
        Self::finish(q, freqs, false, scaling)
    }

    fn finish(q: SubstMatrix, freqs: FreqVector, reversible: bool, scaling: Scaling) -> Result<Self> {
        let mean_rate = mean_rate(&q, &freqs);
        if !(mean_rate > 0.0 && mean_rate.is_finite()) {
            bail!(ModelError::ModelConfiguration(format!(
                "Rate matrix has mean substitution rate {}",
                mean_rate
            )));
        }
        let mut rate_matrix = Self {
            q,
            freqs,
            mean_rate,
            reversible,
            normalised: false,
        };
        if scaling == Scaling::Normalised {
            rate_matrix.q.scale_mut(1.0 / mean_rate);
            rate_matrix.normalised = true;
        }
        Ok(rate_matrix)
    }

    pub fn n(&self) -> usize {
        self.freqs.len()
    }

    /// Returns the matrix multiplied by `factor`, used for a scale shared by several matrices.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            q: self.q.scale(factor),
            freqs: self.freqs.clone(),
            mean_rate: self.mean_rate,
            reversible: self.reversible,
            normalised: false,
        }
    }

    /// Current expected number of substitutions per unit time at stationarity.
    pub fn rate(&self) -> f64 {
        mean_rate(&self.q, &self.freqs)
    }

    /// Stationary flux `sum_i pi_i sum_{j != i, keep(i, j)} q_ij`.
    pub fn flux<F: Fn(usize, usize) -> bool>(&self, keep: F) -> f64 {
        let n = self.n();
        let mut total = 0.0;
        for i in 0..n {
            for j in 0..n {
                if i != j && keep(i, j) {
                    total += self.freqs[i] * self.q[(i, j)];
                }
            }
        }
        total
    }
}

impl Display for RateMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{} {} rate matrix (mean rate {:.6}{})",
            self.n(),
            self.n(),
            if self.reversible { "reversible" } else { "non-reversible" },
            self.mean_rate,
            if self.normalised { ", normalised" } else { "" }
        )
    }
}

fn fill_diagonal(mut rates: SubstMatrix) -> Result<SubstMatrix> {
    let n = rates.nrows();
    if rates.ncols() != n {
        bail!(ModelError::ModelConfiguration(format!(
            "Rate matrix must be square, got {}x{}",
            n,
            rates.ncols()
        )));
    }
    for i in 0..n {
        let mut row_sum = 0.0;
        for j in 0..n {
            if i == j {
                continue;
            }
            let rate = rates[(i, j)];
            if !(rate >= 0.0 && rate.is_finite()) {
                bail!(ModelError::ModelConfiguration(format!(
                    "Invalid substitution rate {} from state {} to state {}",
                    rate, i, j
                )));
            }
            row_sum += rate;
        }
        rates[(i, i)] = -row_sum;
    }
    Ok(rates)
}

fn mean_rate(q: &SubstMatrix, freqs: &FreqVector) -> f64 {
    -(0..freqs.len()).map(|i| freqs[i] * q[(i, i)]).sum::<f64>()
}

/// Checks that `freqs` has `n` non-negative entries summing to one.
pub fn validate_freqs(freqs: &FreqVector, n: usize) -> Result<()> {
    if freqs.len() != n {
        bail!(ModelError::ModelConfiguration(format!(
            "Expected {} frequencies, got {}",
            n,
            freqs.len()
        )));
    }
    if let Some(f) = freqs.iter().find(|f| !(**f >= 0.0 && f.is_finite())) {
        bail!(ModelError::ModelConfiguration(format!(
            "Frequencies must be non-negative, got {}",
            f
        )));
    }
    if (freqs.sum() - 1.0).abs() > FREQ_TOLERANCE {
        bail!(ModelError::ModelConfiguration(format!(
            "The frequencies provided sum to {}, not 1",
            freqs.sum()
        )));
    }
    Ok(())
}

/// Solves `pi Q = 0` with `sum(pi) = 1`.
pub fn stationary_distribution(q: &SubstMatrix) -> Result<FreqVector> {
    let n = q.nrows();
    let mut system = q.transpose();
    for j in 0..n {
        system[(n - 1, j)] = 1.0;
    }
    let mut rhs = FreqVector::zeros(n);
    rhs[n - 1] = 1.0;
    let Some(mut pi) = system.lu().solve(&rhs) else {
        bail!(ModelError::NumericalDegeneracy(
            "Rate matrix has no unique stationary distribution".to_string()
        ));
    };
    if pi.iter().any(|p| *p < -FREQ_TOLERANCE) {
        bail!(ModelError::NumericalDegeneracy(format!(
            "Stationary distribution has negative entries: {:?}",
            pi.as_slice()
        )));
    }
    pi.iter_mut().for_each(|p| *p = p.max(0.0));
    let total = pi.sum();
    pi.scale_mut(1.0 / total);
    debug!("Stationary distribution {:?}", pi.as_slice());
    Ok(pi)
}

/// Builds the generator of one family of substitution models from its free rate parameters.
pub trait QMatrixBuilder {
    fn n_states(&self) -> usize;
    /// Number of free rate parameters, including `omega` for codon models.
    fn param_count(&self) -> usize;
    fn param_names(&self) -> Vec<String>;
    fn default_params(&self) -> Vec<f64>;
    /// Whether the stationary frequencies are parameters of the model (rather than fixed by it).
    fn has_free_freqs(&self) -> bool;
    /// Equilibrium frequencies the model prescribes on its own, if any.
    fn model_freqs(&self) -> Option<FreqVector> {
        None
    }
    fn is_reversible(&self) -> bool {
        true
    }
    /// Whether the last rate parameter is the nonsynonymous/synonymous rate ratio.
    fn has_omega(&self) -> bool {
        false
    }
    fn build_q(&self, params: &[f64], freqs: &FreqVector, scaling: Scaling) -> Result<RateMatrix>;
}

pub(crate) fn check_param_count<B: QMatrixBuilder + Display>(
    model: &B,
    params: &[f64],
) -> Result<()> {
    if params.len() != model.param_count() {
        bail!(ModelError::ModelConfiguration(format!(
            "{} parameters for the {} model, expected {}, got {}",
            if params.len() < model.param_count() {
                "Not enough"
            } else {
                "Too many"
            },
            model,
            model.param_count(),
            params.len()
        )));
    }
    if let Some(p) = params.iter().find(|p| !(**p >= 0.0 && p.is_finite())) {
        bail!(ModelError::ModelConfiguration(format!(
            "Rate parameters of the {} model must be non-negative, got {}",
            model, p
        )));
    }
    Ok(())
}

/// Substitution model families, each carrying exactly the settings it needs.
#[derive(Clone, Debug, PartialEq)]
pub enum SubstModelKind {
    Nucleotide(NucleotideModel),
    AminoAcid(AminoAcidModel),
    Codon(CodonModel),
    Custom(CustomModel),
}

impl Display for SubstModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubstModelKind::Nucleotide(m) => write!(f, "{}", m),
            SubstModelKind::AminoAcid(m) => write!(f, "{}", m),
            SubstModelKind::Codon(m) => write!(f, "{}", m),
            SubstModelKind::Custom(m) => write!(f, "{}", m),
        }
    }
}

impl SubstModelKind {
    fn builder(&self) -> &dyn QMatrixBuilder {
        match self {
            SubstModelKind::Nucleotide(m) => m,
            SubstModelKind::AminoAcid(m) => m,
            SubstModelKind::Codon(m) => m,
            SubstModelKind::Custom(m) => m,
        }
    }

    /// Checks that the model describes the state space of `alphabet`.
    pub fn check_alphabet(&self, alphabet: &Alphabet) -> Result<()> {
        let matches = match (self, alphabet) {
            (SubstModelKind::Nucleotide(_), Alphabet::Nucleotide) => true,
            (SubstModelKind::AminoAcid(_), Alphabet::AminoAcid) => true,
            (SubstModelKind::Codon(m), Alphabet::Codon(code)) => m.code() == code,
            (SubstModelKind::Custom(m), Alphabet::Custom(symbols)) => m.n_states() == symbols.len(),
            _ => false,
        };
        if !matches {
            bail!(ModelError::ModelConfiguration(format!(
                "The {} model does not fit {} data",
                self, alphabet
            )));
        }
        Ok(())
    }

    pub fn genetic_code(&self) -> Option<&crate::alphabets::GeneticCode> {
        match self {
            SubstModelKind::Codon(m) => Some(m.code()),
            _ => None,
        }
    }
}

impl QMatrixBuilder for SubstModelKind {
    fn n_states(&self) -> usize {
        self.builder().n_states()
    }

    fn param_count(&self) -> usize {
        self.builder().param_count()
    }

    fn param_names(&self) -> Vec<String> {
        self.builder().param_names()
    }

    fn default_params(&self) -> Vec<f64> {
        self.builder().default_params()
    }

    fn has_free_freqs(&self) -> bool {
        self.builder().has_free_freqs()
    }

    fn model_freqs(&self) -> Option<FreqVector> {
        self.builder().model_freqs()
    }

    fn is_reversible(&self) -> bool {
        self.builder().is_reversible()
    }

    fn has_omega(&self) -> bool {
        self.builder().has_omega()
    }

    fn build_q(&self, params: &[f64], freqs: &FreqVector, scaling: Scaling) -> Result<RateMatrix> {
        self.builder().build_q(params, freqs, scaling)
    }
}
