use std::fmt::Display;

use anyhow::bail;
use log::debug;
use nalgebra::DMatrix;

use crate::alphabets::GeneticCode;
use crate::errors::ModelError;
use crate::substitution_models::{
    check_param_count, validate_freqs, FreqVector, QMatrixBuilder, RateMatrix, Scaling,
    SubstMatrix,
};
use crate::Result;

/// How the frequency of the target codon enters the rate of a codon change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodonTarget {
    /// Rate proportional to the frequency of the target codon.
    GoldmanYang,
    /// Rate proportional to the frequency of the target nucleotide at the changed position.
    MuseGaut,
}

/// Nucleotide mutation bias underlying the codon model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutationBias {
    /// Transition/transversion rate ratio.
    Kappa,
    /// Five free nucleotide exchangeabilities, the A to G one fixed at 1.
    Gtr,
}

/// Single-nucleotide change between two sense codons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CodonStep {
    pub(crate) from: usize,
    pub(crate) to: usize,
    pub(crate) position: usize,
    pub(crate) nuc_from: usize,
    pub(crate) nuc_to: usize,
    pub(crate) synonymous: bool,
}

/// Codon model built from a nucleotide mutation bias and a selection multiplier `omega`
/// on nonsynonymous changes. Only changes at a single codon position have a positive rate.
#[derive(Clone, Debug, PartialEq)]
pub struct CodonModel {
    code: GeneticCode,
    target: CodonTarget,
    bias: MutationBias,
    steps: Vec<CodonStep>,
}

impl Display for CodonModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match self.target {
            CodonTarget::GoldmanYang => "GY",
            CodonTarget::MuseGaut => "MG",
        };
        let bias = match self.bias {
            MutationBias::Kappa => "kappa",
            MutationBias::Gtr => "GTR",
        };
        write!(f, "{} codon model ({} bias, {})", target, bias, self.code.name())
    }
}

impl CodonModel {
    pub fn new(code: GeneticCode, target: CodonTarget, bias: MutationBias) -> Self {
        let n = code.n_sense();
        let mut steps = Vec::new();
        for from in 0..n {
            let a = code.nucleotides(from);
            for to in 0..n {
                let b = code.nucleotides(to);
                let diffs: Vec<usize> = (0..3).filter(|&p| a[p] != b[p]).collect();
                if diffs.len() == 1 {
                    let position = diffs[0];
                    steps.push(CodonStep {
                        from,
                        to,
                        position,
                        nuc_from: a[position],
                        nuc_to: b[position],
                        synonymous: code.is_synonymous(from, to),
                    });
                }
            }
        }
        Self {
            code,
            target,
            bias,
            steps,
        }
    }

    pub fn goldman_yang(code: GeneticCode) -> Self {
        Self::new(code, CodonTarget::GoldmanYang, MutationBias::Kappa)
    }

    pub fn muse_gaut(code: GeneticCode) -> Self {
        Self::new(code, CodonTarget::MuseGaut, MutationBias::Kappa)
    }

    pub fn code(&self) -> &GeneticCode {
        &self.code
    }

    pub fn target(&self) -> CodonTarget {
        self.target
    }

    pub fn bias(&self) -> MutationBias {
        self.bias
    }

    pub(crate) fn steps(&self) -> &[CodonStep] {
        &self.steps
    }

    fn mutation_params(&self) -> usize {
        match self.bias {
            MutationBias::Kappa => 1,
            MutationBias::Gtr => 5,
        }
    }

    fn mutation_rate(&self, params: &[f64], a: usize, b: usize) -> f64 {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        match self.bias {
            MutationBias::Kappa => {
                if (lo, hi) == (0, 1) || (lo, hi) == (2, 3) {
                    params[0]
                } else {
                    1.0
                }
            }
            MutationBias::Gtr => match (lo, hi) {
                (0, 1) => params[0],
                (0, 2) => params[1],
                (0, 3) => params[2],
                (1, 2) => params[3],
                (1, 3) => params[4],
                _ => 1.0,
            },
        }
    }

    /// Nucleotide marginals (rows: codon positions, columns: TCAG) of codon frequencies.
    pub fn position_freqs(&self, freqs: &FreqVector) -> DMatrix<f64> {
        let mut pos = DMatrix::zeros(3, 4);
        for (state, f) in freqs.iter().enumerate() {
            for (p, nuc) in self.code.nucleotides(state).into_iter().enumerate() {
                pos[(p, nuc)] += f;
            }
        }
        pos
    }

    /// Stationary distribution of the model given the codon frequencies it was built from.
    pub fn stationary(&self, freqs: &FreqVector) -> FreqVector {
        match self.target {
            CodonTarget::GoldmanYang => freqs.clone(),
            CodonTarget::MuseGaut => {
                let pos = self.position_freqs(freqs);
                codon_freqs_f3x4(&self.code, &pos)
            }
        }
    }
}

impl QMatrixBuilder for CodonModel {
    fn n_states(&self) -> usize {
        self.code.n_sense()
    }

    fn param_count(&self) -> usize {
        self.mutation_params() + 1
    }

    fn param_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.bias {
            MutationBias::Kappa => vec!["kappa".to_string()],
            MutationBias::Gtr => ["r_tc", "r_ta", "r_tg", "r_ca", "r_cg"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        names.push("omega".to_string());
        names
    }

    fn default_params(&self) -> Vec<f64> {
        let mut params = match self.bias {
            MutationBias::Kappa => vec![2.0],
            MutationBias::Gtr => vec![1.0; 5],
        };
        params.push(0.4);
        params
    }

    fn has_free_freqs(&self) -> bool {
        true
    }

    fn has_omega(&self) -> bool {
        true
    }

    /// `params` are the mutation bias parameters followed by `omega`.
    fn build_q(&self, params: &[f64], freqs: &FreqVector, scaling: Scaling) -> Result<RateMatrix> {
        check_param_count(self, params)?;
        let n = self.n_states();
        validate_freqs(freqs, n)?;
        let omega = params[self.mutation_params()];
        let pos = match self.target {
            CodonTarget::MuseGaut => Some(self.position_freqs(freqs)),
            CodonTarget::GoldmanYang => None,
        };
        let mut rates = SubstMatrix::zeros(n, n);
        for step in &self.steps {
            let target = match &pos {
                Some(pos) => pos[(step.position, step.nuc_to)],
                None => freqs[step.to],
            };
            let mut rate = self.mutation_rate(params, step.nuc_from, step.nuc_to) * target;
            if !step.synonymous {
                rate *= omega;
            }
            rates[(step.from, step.to)] = rate;
        }
        let stationary = self.stationary(freqs);
        debug!("Building {} with parameters {:?}", self, params);
        RateMatrix::reversible(rates, &stationary, scaling)
    }
}

/// Codon frequencies from one set of nucleotide frequencies used at every position.
pub fn codon_freqs_f1x4(code: &GeneticCode, nuc_freqs: &FreqVector) -> Result<FreqVector> {
    validate_freqs(nuc_freqs, 4)?;
    let pos = DMatrix::from_fn(3, 4, |_, j| nuc_freqs[j]);
    Ok(codon_freqs_f3x4(code, &pos))
}

/// Codon frequencies as normalised products of position-specific nucleotide frequencies.
pub fn codon_freqs_f3x4(code: &GeneticCode, pos_freqs: &DMatrix<f64>) -> FreqVector {
    let mut freqs = FreqVector::from_fn(code.n_sense(), |state, _| {
        code.nucleotides(state)
            .iter()
            .enumerate()
            .map(|(p, &nuc)| pos_freqs[(p, nuc)])
            .product()
    });
    let total = freqs.sum();
    if total > 0.0 {
        freqs.scale_mut(1.0 / total);
    }
    freqs
}

/// Checks a 3x4 matrix of position-specific nucleotide frequencies.
pub fn validate_position_freqs(pos_freqs: &DMatrix<f64>) -> Result<()> {
    if pos_freqs.nrows() != 3 || pos_freqs.ncols() != 4 {
        bail!(ModelError::ModelConfiguration(format!(
            "Position frequencies must be 3x4, got {}x{}",
            pos_freqs.nrows(),
            pos_freqs.ncols()
        )));
    }
    for row in pos_freqs.row_iter() {
        validate_freqs(&row.transpose(), 4)?;
    }
    Ok(())
}
