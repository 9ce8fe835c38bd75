use std::fmt::Display;

use anyhow::bail;
use log::debug;

use crate::alphabets::{AMINOACIDS, AMINOACID_INDEX};
use crate::errors::ModelError;
use crate::substitution_models::{
    check_param_count, validate_freqs, CodonModel, FreqVector, QMatrixBuilder, RateMatrix,
    Scaling, SubstMatrix,
};
use crate::Result;

const N_AA: usize = 20;
const N_AA_PAIRS: usize = N_AA * (N_AA - 1) / 2;

/// Exchangeabilities and equilibrium frequencies of an empirical amino acid model.
#[derive(Clone, Debug, PartialEq)]
pub struct EmpiricalMatrix {
    name: String,
    exchangeabilities: SubstMatrix,
    freqs: FreqVector,
}

impl EmpiricalMatrix {
    /// Checks and stores a 20x20 exchangeability matrix in ARNDCQEGHILKMFPSTWYV order.
    pub fn new(name: &str, exchangeabilities: SubstMatrix, freqs: FreqVector) -> Result<Self> {
        if exchangeabilities.nrows() != N_AA || exchangeabilities.ncols() != N_AA {
            bail!(ModelError::ModelConfiguration(format!(
                "Empirical model {} needs a 20x20 matrix, got {}x{}",
                name,
                exchangeabilities.nrows(),
                exchangeabilities.ncols()
            )));
        }
        if let Some(i) = (0..N_AA).find(|&i| exchangeabilities[(i, i)] > 0.0) {
            bail!(ModelError::ModelConfiguration(format!(
                "Empirical model {} has a positive diagonal entry for {}",
                name, AMINOACIDS[i] as char
            )));
        }
        if exchangeabilities.iter().any(|s| *s < 0.0) {
            bail!(ModelError::ModelConfiguration(format!(
                "Empirical model {} has negative exchangeabilities",
                name
            )));
        }
        validate_freqs(&freqs, N_AA)?;
        let mut s = exchangeabilities;
        s.fill_diagonal(0.0);
        if s != s.transpose() {
            bail!(ModelError::ModelConfiguration(format!(
                "Empirical model {} has an asymmetric exchangeability matrix",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            exchangeabilities: s,
            freqs,
        })
    }

    /// Reads the lower triangle (190 values, row by row from the second row) of the
    /// exchangeability matrix as it is laid out in the usual `.dat` model files.
    pub fn from_lower_triangle(name: &str, values: &[f64], freqs: &[f64]) -> Result<Self> {
        if values.len() != N_AA_PAIRS {
            bail!(ModelError::ModelConfiguration(format!(
                "Empirical model {} needs {} exchangeabilities, got {}",
                name,
                N_AA_PAIRS,
                values.len()
            )));
        }
        let s = lower_triangle_matrix(values);
        let mut freqs = FreqVector::from_column_slice(freqs);
        let total = freqs.sum();
        if total > 0.0 {
            freqs.scale_mut(1.0 / total);
        }
        Self::new(name, s, freqs)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn freqs(&self) -> &FreqVector {
        &self.freqs
    }
}

fn lower_triangle_matrix(values: &[f64]) -> SubstMatrix {
    let mut s = SubstMatrix::zeros(N_AA, N_AA);
    let mut k = 0;
    for i in 1..N_AA {
        for j in 0..i {
            s[(i, j)] = values[k];
            s[(j, i)] = values[k];
            k += 1;
        }
    }
    s
}

/// Amino acid substitution models.
#[derive(Clone, Debug, PartialEq)]
pub enum AminoAcidModel {
    /// Equal exchangeabilities and equal frequencies.
    Poisson,
    /// Equal exchangeabilities with the given frequencies.
    EqualInput,
    Empirical(EmpiricalMatrix),
    /// 190 free exchangeabilities, the last one fixed at 1.
    Gtr,
    /// Amino acid process obtained by lumping the codons of each amino acid of a codon model.
    FromCodon {
        codon: CodonModel,
        codon_freqs: FreqVector,
    },
}

impl Display for AminoAcidModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AminoAcidModel::Poisson => write!(f, "Poisson"),
            AminoAcidModel::EqualInput => write!(f, "equal input"),
            AminoAcidModel::Empirical(m) => write!(f, "{}", m.name),
            AminoAcidModel::Gtr => write!(f, "amino acid GTR"),
            AminoAcidModel::FromCodon { codon, .. } => write!(f, "amino acid from {}", codon),
        }
    }
}

impl AminoAcidModel {
    /// Lumps the unscaled codon generator into amino acid rates,
    /// `q_ab = sum_{i in a} pi_i / pi_a * sum_{j in b} q_ij`.
    fn lump_codon_rates(
        codon: &CodonModel,
        codon_freqs: &FreqVector,
        params: &[f64],
    ) -> Result<(SubstMatrix, FreqVector)> {
        let codon_q = codon.build_q(params, codon_freqs, Scaling::Unscaled)?;
        let code = codon.code();
        let aa_of = |state: usize| AMINOACID_INDEX[code.amino_acid(state) as usize];
        let mut aa_freqs = FreqVector::zeros(N_AA);
        for (state, f) in codon_q.freqs.iter().enumerate() {
            if let Some(a) = aa_of(state) {
                aa_freqs[a] += f;
            }
        }
        let mut rates = SubstMatrix::zeros(N_AA, N_AA);
        for step in codon.steps() {
            if step.synonymous {
                continue;
            }
            if let (Some(a), Some(b)) = (aa_of(step.from), aa_of(step.to)) {
                rates[(a, b)] += codon_q.freqs[step.from] * codon_q.q[(step.from, step.to)];
            }
        }
        for a in 0..N_AA {
            if aa_freqs[a] > 0.0 {
                let mut row = rates.row_mut(a);
                row /= aa_freqs[a];
            }
        }
        Ok((rates, aa_freqs))
    }
}

impl QMatrixBuilder for AminoAcidModel {
    fn n_states(&self) -> usize {
        N_AA
    }

    fn param_count(&self) -> usize {
        match self {
            AminoAcidModel::Gtr => N_AA_PAIRS - 1,
            AminoAcidModel::FromCodon { codon, .. } => codon.param_count(),
            _ => 0,
        }
    }

    fn param_names(&self) -> Vec<String> {
        match self {
            AminoAcidModel::Gtr => {
                let mut names = Vec::with_capacity(N_AA_PAIRS - 1);
                for i in 1..N_AA {
                    for j in 0..i {
                        names.push(format!(
                            "r_{}{}",
                            AMINOACIDS[i] as char, AMINOACIDS[j] as char
                        ));
                    }
                }
                names.pop();
                names
            }
            AminoAcidModel::FromCodon { codon, .. } => codon.param_names(),
            _ => vec![],
        }
    }

    fn default_params(&self) -> Vec<f64> {
        match self {
            AminoAcidModel::FromCodon { codon, .. } => codon.default_params(),
            _ => vec![1.0; self.param_count()],
        }
    }

    fn has_free_freqs(&self) -> bool {
        matches!(self, AminoAcidModel::EqualInput | AminoAcidModel::Gtr | AminoAcidModel::Empirical(_))
    }

    fn model_freqs(&self) -> Option<FreqVector> {
        match self {
            AminoAcidModel::Poisson => Some(FreqVector::from_element(N_AA, 1.0 / N_AA as f64)),
            AminoAcidModel::Empirical(m) => Some(m.freqs.clone()),
            AminoAcidModel::FromCodon { codon, codon_freqs } => {
                let stationary = codon.stationary(codon_freqs);
                let mut aa_freqs = FreqVector::zeros(N_AA);
                for (state, f) in stationary.iter().enumerate() {
                    if let Some(a) = AMINOACID_INDEX[codon.code().amino_acid(state) as usize] {
                        aa_freqs[a] += f;
                    }
                }
                Some(aa_freqs)
            }
            _ => None,
        }
    }

    fn build_q(&self, params: &[f64], freqs: &FreqVector, scaling: Scaling) -> Result<RateMatrix> {
        check_param_count(self, params)?;
        match self {
            AminoAcidModel::Poisson => {
                let equal = FreqVector::from_element(N_AA, 1.0 / N_AA as f64);
                RateMatrix::from_exchangeabilities(&equal_exchangeabilities(), &equal, scaling)
            }
            AminoAcidModel::EqualInput => {
                RateMatrix::from_exchangeabilities(&equal_exchangeabilities(), freqs, scaling)
            }
            AminoAcidModel::Empirical(m) => {
                debug!("Building empirical amino acid model {}", m.name);
                RateMatrix::from_exchangeabilities(&m.exchangeabilities, freqs, scaling)
            }
            AminoAcidModel::Gtr => {
                let mut values = params.to_vec();
                values.push(1.0);
                RateMatrix::from_exchangeabilities(&lower_triangle_matrix(&values), freqs, scaling)
            }
            AminoAcidModel::FromCodon { codon, codon_freqs } => {
                let (rates, aa_freqs) = Self::lump_codon_rates(codon, codon_freqs, params)?;
                RateMatrix::reversible(rates, &aa_freqs, scaling)
            }
        }
    }
}

fn equal_exchangeabilities() -> SubstMatrix {
    SubstMatrix::from_fn(N_AA, N_AA, |i, j| if i == j { 0.0 } else { 1.0 })
}
