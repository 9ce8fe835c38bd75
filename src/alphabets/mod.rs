use std::fmt::Display;

use anyhow::bail;
use itertools::iproduct;
use lazy_static::lazy_static;

use crate::substitution_models::FreqVector;
use crate::Result;

mod genetic_code;
pub use genetic_code::*;

pub static AMINOACIDS: &[u8] = b"ARNDCQEGHILKMFPSTWYV";
pub static AMB_AMINOACIDS: &[u8] = b"BJZX";
pub static NUCLEOTIDES: &[u8] = b"TCAG";
pub static AMB_NUCLEOTIDES: &[u8] = b"RYSWKMBDHVNX";
pub static GAP: u8 = b'-';
pub static MISSING: &[u8] = b"-?.~";

/// Maximum number of states representable in a [`StateSet`].
pub const MAX_STATES: usize = 64;

lazy_static! {
    pub static ref NUCLEOTIDE_INDEX: [Option<usize>; 256] = {
        let mut index = [None; 256];
        for (i, &char) in NUCLEOTIDES.iter().enumerate() {
            index[char as usize] = Some(i);
            index[char.to_ascii_lowercase() as usize] = Some(i);
        }
        index[b'U' as usize] = Some(0);
        index[b'u' as usize] = Some(0);
        index
    };
    pub static ref AMINOACID_INDEX: [Option<usize>; 256] = {
        let mut index = [None; 256];
        for (i, &char) in AMINOACIDS.iter().enumerate() {
            index[char as usize] = Some(i);
            index[char.to_ascii_lowercase() as usize] = Some(i);
        }
        index
    };
}

/// Set of states compatible with one observation, stored as a bit mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateSet(u64);

impl StateSet {
    pub fn empty() -> Self {
        StateSet(0)
    }

    pub fn single(state: usize) -> Self {
        debug_assert!(state < MAX_STATES);
        StateSet(1 << state)
    }

    /// Set holding every one of the `n` states, used for missing data.
    pub fn all(n: usize) -> Self {
        debug_assert!(n <= MAX_STATES);
        if n == MAX_STATES {
            StateSet(u64::MAX)
        } else {
            StateSet((1 << n) - 1)
        }
    }

    pub fn from_states(states: &[usize]) -> Self {
        let mut set = Self::empty();
        for &s in states {
            set.insert(s);
        }
        set
    }

    pub fn insert(&mut self, state: usize) {
        debug_assert!(state < MAX_STATES);
        self.0 |= 1 << state;
    }

    pub fn contains(&self, state: usize) -> bool {
        state < MAX_STATES && (self.0 >> state) & 1 == 1
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_subset(&self, other: &StateSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_STATES).filter(|&s| self.contains(s))
    }

    /// 0/1 vector over `n` states with ones at the members of the set.
    pub fn indicator(&self, n: usize) -> FreqVector {
        FreqVector::from_fn(n, |s, _| if self.contains(s) { 1.0 } else { 0.0 })
    }
}

impl Display for StateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, s) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", s)?;
        }
        write!(f, "}}")
    }
}

/// State space of the sequences, one state per character (or per codon).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Alphabet {
    Nucleotide,
    AminoAcid,
    Codon(GeneticCode),
    /// Small user-defined alphabet, e.g. binary characters.
    Custom(Vec<u8>),
}

impl Display for Alphabet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Alphabet::Nucleotide => write!(f, "nucleotide"),
            Alphabet::AminoAcid => write!(f, "amino acid"),
            Alphabet::Codon(code) => write!(f, "codon, {}", code),
            Alphabet::Custom(symbols) => {
                write!(f, "custom [{}]", String::from_utf8_lossy(symbols))
            }
        }
    }
}

impl Alphabet {
    pub fn n_states(&self) -> usize {
        match self {
            Alphabet::Nucleotide => NUCLEOTIDES.len(),
            Alphabet::AminoAcid => AMINOACIDS.len(),
            Alphabet::Codon(code) => code.n_sense(),
            Alphabet::Custom(symbols) => symbols.len(),
        }
    }

    /// Number of sequence characters making up one state.
    pub fn width(&self) -> usize {
        match self {
            Alphabet::Codon(_) => 3,
            _ => 1,
        }
    }

    /// Encodes one observation (`width()` characters) as the set of compatible states.
    pub fn encode(&self, word: &[u8]) -> Result<StateSet> {
        if word.len() != self.width() {
            bail!(
                "Expected {} character(s) per {} state, got {}",
                self.width(),
                self,
                word.len()
            );
        }
        match self {
            Alphabet::Nucleotide => nucleotide_set(word[0]),
            Alphabet::AminoAcid => aminoacid_set(word[0]),
            Alphabet::Codon(code) => codon_set(code, word),
            Alphabet::Custom(symbols) => {
                if MISSING.contains(&word[0]) {
                    return Ok(StateSet::all(symbols.len()));
                }
                match symbols.iter().position(|s| *s == word[0]) {
                    Some(i) => Ok(StateSet::single(i)),
                    None => bail!("Unknown character {} for alphabet {}", word[0] as char, self),
                }
            }
        }
    }

    pub fn encode_sequence(&self, seq: &[u8]) -> Result<Vec<StateSet>> {
        if seq.len() % self.width() != 0 {
            bail!(
                "Sequence length {} is not a multiple of {}",
                seq.len(),
                self.width()
            );
        }
        seq.chunks(self.width()).map(|w| self.encode(w)).collect()
    }

    /// Human readable name of a state.
    pub fn state_label(&self, state: usize) -> String {
        match self {
            Alphabet::Nucleotide => (NUCLEOTIDES[state] as char).to_string(),
            Alphabet::AminoAcid => (AMINOACIDS[state] as char).to_string(),
            Alphabet::Codon(code) => code.codon_string(state),
            Alphabet::Custom(symbols) => (symbols[state] as char).to_string(),
        }
    }
}

fn nucleotide_set(char: u8) -> Result<StateSet> {
    let states: &[usize] = match char.to_ascii_uppercase() {
        b'T' | b'U' => &[0],
        b'C' => &[1],
        b'A' => &[2],
        b'G' => &[3],
        b'Y' => &[0, 1],
        b'R' => &[2, 3],
        b'M' => &[1, 2],
        b'K' => &[0, 3],
        b'S' => &[1, 3],
        b'W' => &[0, 2],
        b'H' => &[0, 1, 2],
        b'B' => &[0, 1, 3],
        b'V' => &[1, 2, 3],
        b'D' => &[0, 2, 3],
        b'N' | b'X' => &[0, 1, 2, 3],
        c if MISSING.contains(&c) => &[0, 1, 2, 3],
        c => bail!("Unknown nucleotide character {}", c as char),
    };
    Ok(StateSet::from_states(states))
}

fn aminoacid_set(char: u8) -> Result<StateSet> {
    let index = &AMINOACID_INDEX;
    if let Some(i) = index[char as usize] {
        return Ok(StateSet::single(i));
    }
    let members: &[u8] = match char.to_ascii_uppercase() {
        b'B' => b"ND",
        b'Z' => b"QE",
        b'J' => b"IL",
        b'X' => AMINOACIDS,
        c if MISSING.contains(&c) => AMINOACIDS,
        c => bail!("Unknown amino acid character {}", c as char),
    };
    Ok(StateSet::from_states(
        &members
            .iter()
            .filter_map(|&c| index[c as usize])
            .collect::<Vec<_>>(),
    ))
}

fn codon_set(code: &GeneticCode, word: &[u8]) -> Result<StateSet> {
    let positions = word
        .iter()
        .map(|&c| Ok(nucleotide_set(c)?.iter().collect::<Vec<usize>>()))
        .collect::<Result<Vec<_>>>()?;
    let mut set = StateSet::empty();
    for (x, y, z) in iproduct!(
        positions[0].iter().copied(),
        positions[1].iter().copied(),
        positions[2].iter().copied()
    ) {
        if let Some(state) = code.state_of_nucleotides([x, y, z]) {
            set.insert(state);
        }
    }
    if set.is_empty() {
        bail!(
            "Stop codon {} found in sequence under the {} code",
            String::from_utf8_lossy(word),
            code.name()
        );
    }
    Ok(set)
}
