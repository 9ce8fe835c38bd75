use std::fmt::Display;

use log::debug;

use crate::alphabets::NUCLEOTIDES;
use crate::substitution_models::{
    check_param_count, validate_freqs, FreqVector, QMatrixBuilder, RateMatrix, Scaling,
    SubstMatrix,
};
use crate::Result;

/// Nucleotide substitution models over TCAG.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NucleotideModel {
    JC69,
    K80,
    F81,
    F84,
    HKY,
    TN93,
    GTR,
    /// Unrestricted (non-reversible) model with 12 rates, the G to A rate fixed at 1.
    UNREST,
}

impl Display for NucleotideModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NucleotideModel::JC69 => "JC69",
            NucleotideModel::K80 => "K80",
            NucleotideModel::F81 => "F81",
            NucleotideModel::F84 => "F84",
            NucleotideModel::HKY => "HKY",
            NucleotideModel::TN93 => "TN93",
            NucleotideModel::GTR => "GTR",
            NucleotideModel::UNREST => "UNREST",
        };
        write!(f, "{}", name)
    }
}

/// Symmetric exchangeabilities of a reversible nucleotide model.
#[derive(Clone, Debug, PartialEq)]
pub struct DNASubstParams {
    pub(crate) pi: FreqVector,
    pub(crate) rtc: f64,
    pub(crate) rta: f64,
    pub(crate) rtg: f64,
    pub(crate) rca: f64,
    pub(crate) rcg: f64,
    pub(crate) rag: f64,
}

impl Display for DNASubstParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[pi = {:?}, rtc = {}, rta = {}, rtg = {}, rca = {}, rcg = {}, rag = {}]",
            self.pi.as_slice(),
            self.rtc,
            self.rta,
            self.rtg,
            self.rca,
            self.rcg,
            self.rag
        )
    }
}

impl DNASubstParams {
    fn uniform(pi: FreqVector, transition_tc: f64, transition_ag: f64) -> Self {
        Self {
            pi,
            rtc: transition_tc,
            rta: 1.0,
            rtg: 1.0,
            rca: 1.0,
            rcg: 1.0,
            rag: transition_ag,
        }
    }

    pub(crate) fn exchangeabilities(&self) -> SubstMatrix {
        SubstMatrix::from_row_slice(
            4,
            4,
            &[
                0.0, self.rtc, self.rta, self.rtg, //
                self.rtc, 0.0, self.rca, self.rcg, //
                self.rta, self.rca, 0.0, self.rag, //
                self.rtg, self.rcg, self.rag, 0.0,
            ],
        )
    }
}

impl NucleotideModel {
    /// Exchangeabilities and frequencies of the reversible models, `None` for UNREST.
    fn subst_params(&self, params: &[f64], freqs: &FreqVector) -> Option<DNASubstParams> {
        let equal = FreqVector::from_element(4, 0.25);
        let subst_params = match self {
            NucleotideModel::JC69 => DNASubstParams::uniform(equal, 1.0, 1.0),
            NucleotideModel::K80 => DNASubstParams::uniform(equal, params[0], params[0]),
            NucleotideModel::F81 => DNASubstParams::uniform(freqs.clone(), 1.0, 1.0),
            NucleotideModel::F84 => {
                let kappa = params[0];
                let pyrimidines = freqs[0] + freqs[1];
                let purines = freqs[2] + freqs[3];
                DNASubstParams::uniform(
                    freqs.clone(),
                    1.0 + kappa / pyrimidines,
                    1.0 + kappa / purines,
                )
            }
            NucleotideModel::HKY => DNASubstParams::uniform(freqs.clone(), params[0], params[0]),
            NucleotideModel::TN93 => DNASubstParams::uniform(freqs.clone(), params[0], params[1]),
            NucleotideModel::GTR => DNASubstParams {
                pi: freqs.clone(),
                rtc: params[0],
                rta: params[1],
                rtg: params[2],
                rca: params[3],
                rcg: params[4],
                rag: 1.0,
            },
            NucleotideModel::UNREST => return None,
        };
        Some(subst_params)
    }

    fn unrest_rates(params: &[f64]) -> SubstMatrix {
        let mut rates = SubstMatrix::zeros(4, 4);
        let mut k = 0;
        for i in 0..4 {
            for j in 0..4 {
                if i == j {
                    continue;
                }
                rates[(i, j)] = if k < params.len() { params[k] } else { 1.0 };
                k += 1;
            }
        }
        rates
    }
}

impl QMatrixBuilder for NucleotideModel {
    fn n_states(&self) -> usize {
        4
    }

    fn param_count(&self) -> usize {
        match self {
            NucleotideModel::JC69 | NucleotideModel::F81 => 0,
            NucleotideModel::K80 | NucleotideModel::F84 | NucleotideModel::HKY => 1,
            NucleotideModel::TN93 => 2,
            NucleotideModel::GTR => 5,
            NucleotideModel::UNREST => 11,
        }
    }

    fn param_names(&self) -> Vec<String> {
        match self {
            NucleotideModel::JC69 | NucleotideModel::F81 => vec![],
            NucleotideModel::K80 | NucleotideModel::F84 | NucleotideModel::HKY => {
                vec!["kappa".to_string()]
            }
            NucleotideModel::TN93 => vec!["kappa_tc".to_string(), "kappa_ag".to_string()],
            NucleotideModel::GTR => ["r_tc", "r_ta", "r_tg", "r_ca", "r_cg"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            NucleotideModel::UNREST => {
                let mut names = Vec::with_capacity(11);
                for i in 0..4 {
                    for j in 0..4 {
                        if i != j && names.len() < 11 {
                            names.push(format!(
                                "q_{}{}",
                                NUCLEOTIDES[i] as char,
                                NUCLEOTIDES[j] as char
                            ));
                        }
                    }
                }
                names
            }
        }
    }

    fn default_params(&self) -> Vec<f64> {
        match self {
            NucleotideModel::K80 | NucleotideModel::F84 | NucleotideModel::HKY => vec![2.0],
            NucleotideModel::TN93 => vec![2.0, 2.0],
            _ => vec![1.0; self.param_count()],
        }
    }

    fn has_free_freqs(&self) -> bool {
        !matches!(
            self,
            NucleotideModel::JC69 | NucleotideModel::K80 | NucleotideModel::UNREST
        )
    }

    fn model_freqs(&self) -> Option<FreqVector> {
        match self {
            NucleotideModel::JC69 | NucleotideModel::K80 => Some(FreqVector::from_element(4, 0.25)),
            _ => None,
        }
    }

    fn is_reversible(&self) -> bool {
        *self != NucleotideModel::UNREST
    }

    fn build_q(&self, params: &[f64], freqs: &FreqVector, scaling: Scaling) -> Result<RateMatrix> {
        check_param_count(self, params)?;
        let Some(subst_params) = self.subst_params(params, freqs) else {
            return RateMatrix::general(Self::unrest_rates(params), scaling);
        };
        validate_freqs(freqs, 4)?;
        debug!("Building {} with {}", self, subst_params);
        RateMatrix::from_exchangeabilities(
            &subst_params.exchangeabilities(),
            &subst_params.pi,
            scaling,
        )
    }
}
