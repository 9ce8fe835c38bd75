use std::fmt::Display;

use anyhow::bail;

use crate::alphabets::{AMINOACIDS, NUCLEOTIDES};
use crate::errors::ModelError;
use crate::Result;

pub const STOP: u8 = b'*';

const STANDARD: &str = "FFLLSSSSYY**CC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG";
const VERTEBRATE_MITO: &str = "FFLLSSSSYY**CCWWLLLLPPPPHHQQRRRRIIMMTTTTNNKKSS**VVVVAAAADDEEGGGG";
const YEAST_MITO: &str = "FFLLSSSSYY**CCWWTTTTPPPPHHQQRRRRIIMMTTTTNNKKSSRRVVVVAAAADDEEGGGG";
const MOLD_MITO: &str = "FFLLSSSSYY**CCWWLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG";
const INVERTEBRATE_MITO: &str = "FFLLSSSSYY**CCWWLLLLPPPPHHQQRRRRIIMMTTTTNNKKSSSSVVVVAAAADDEEGGGG";
const CILIATE: &str = "FFLLSSSSYYQQCC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG";

/// Translation table over the 64 codons in TCAG order, with the sense codons
/// numbered consecutively to form the codon state space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneticCode {
    name: String,
    table: [u8; 64],
    sense: Vec<usize>,
    state_of: [Option<usize>; 64],
}

impl Display for GeneticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} sense codons)", self.name, self.sense.len())
    }
}

impl Default for GeneticCode {
    fn default() -> Self {
        Self::standard()
    }
}

impl GeneticCode {
    pub fn standard() -> Self {
        Self::new_unchecked("Standard", STANDARD)
    }

    pub fn vertebrate_mitochondrial() -> Self {
        Self::new_unchecked("Vertebrate mitochondrial", VERTEBRATE_MITO)
    }

    /// Looks up one of the NCBI translation tables 1 to 6.
    pub fn from_ncbi_id(id: u8) -> Result<Self> {
        Ok(match id {
            1 => Self::standard(),
            2 => Self::vertebrate_mitochondrial(),
            3 => Self::new_unchecked("Yeast mitochondrial", YEAST_MITO),
            4 => Self::new_unchecked("Mold mitochondrial", MOLD_MITO),
            5 => Self::new_unchecked("Invertebrate mitochondrial", INVERTEBRATE_MITO),
            6 => Self::new_unchecked("Ciliate nuclear", CILIATE),
            _ => bail!(ModelError::ModelConfiguration(format!(
                "Unsupported genetic code {}",
                id
            ))),
        })
    }

    /// Builds a code from 64 one-letter amino acids (or `*` for stop) in TCAG codon order.
    pub fn from_table(name: &str, table: &str) -> Result<Self> {
        let bytes = table.as_bytes();
        if bytes.len() != 64 {
            bail!(ModelError::ModelConfiguration(format!(
                "A genetic code needs 64 entries, got {}",
                bytes.len()
            )));
        }
        if let Some(&c) = bytes
            .iter()
            .find(|c| **c != STOP && !AMINOACIDS.contains(&c.to_ascii_uppercase()))
        {
            bail!(ModelError::ModelConfiguration(format!(
                "Unknown amino acid {} in genetic code",
                c as char
            )));
        }
        Ok(Self::new_unchecked(name, &table.to_ascii_uppercase()))
    }

    fn new_unchecked(name: &str, table: &str) -> Self {
        let mut entries = [STOP; 64];
        entries.copy_from_slice(table.as_bytes());
        let mut sense = Vec::with_capacity(64);
        let mut state_of = [None; 64];
        for (codon, &aa) in entries.iter().enumerate() {
            if aa != STOP {
                state_of[codon] = Some(sense.len());
                sense.push(codon);
            }
        }
        Self {
            name: name.to_string(),
            table: entries,
            sense,
            state_of,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_sense(&self) -> usize {
        self.sense.len()
    }

    /// Codon index (16 * first + 4 * second + third) of a sense state.
    pub fn codon_index(&self, state: usize) -> usize {
        self.sense[state]
    }

    /// Sense state of a codon index, `None` for stop codons.
    pub fn state(&self, codon_index: usize) -> Option<usize> {
        self.state_of[codon_index]
    }

    pub fn state_of_nucleotides(&self, nucs: [usize; 3]) -> Option<usize> {
        self.state(nucs[0] * 16 + nucs[1] * 4 + nucs[2])
    }

    /// Nucleotide indices (TCAG) at the three codon positions of a sense state.
    pub fn nucleotides(&self, state: usize) -> [usize; 3] {
        let codon = self.sense[state];
        [codon / 16, (codon / 4) % 4, codon % 4]
    }

    pub fn amino_acid(&self, state: usize) -> u8 {
        self.table[self.sense[state]]
    }

    pub fn is_synonymous(&self, i: usize, j: usize) -> bool {
        self.amino_acid(i) == self.amino_acid(j)
    }

    pub fn codon_string(&self, state: usize) -> String {
        self.nucleotides(state)
            .iter()
            .map(|&n| NUCLEOTIDES[n] as char)
            .collect()
    }
}
