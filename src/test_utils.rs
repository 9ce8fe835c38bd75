use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::alphabets::Alphabet;
use crate::patterns::SitePatterns;
use crate::phylo_info::{PhyloInfo, PhyloInfoBuilder};
use crate::substitution_models::{Decomposition, RateMatrix, SubstMatrix};
use crate::tree::Tree;

fn draw(rng: &mut StdRng, weights: impl IntoIterator<Item = f64>) -> usize {
    WeightedIndex::new(weights).unwrap().sample(rng)
}

/// Simulates one sequence per leaf down the tree. Every site draws its rate uniformly from
/// `site_rates`.
pub(crate) fn simulate_sequences(
    tree: &Tree,
    rate: &RateMatrix,
    alphabet: &Alphabet,
    n_sites: usize,
    site_rates: &[f64],
    seed: u64,
) -> (Vec<String>, Vec<Vec<u8>>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let decomposition = Decomposition::new(rate);
    let transitions: Vec<Vec<SubstMatrix>> = site_rates
        .iter()
        .map(|r| {
            tree.nodes
                .iter()
                .map(|node| decomposition.p(node.blen * r))
                .collect()
        })
        .collect();
    let mut states = vec![vec![0usize; n_sites]; tree.len()];
    for site in 0..n_sites {
        let category = rng.gen_range(0..site_rates.len());
        for node_idx in tree.preorder.iter() {
            let i = usize::from(node_idx);
            states[i][site] = match tree.parent(node_idx) {
                None => draw(&mut rng, rate.freqs.iter().copied()),
                Some(parent) => {
                    let from = states[usize::from(parent)][site];
                    let p = &transitions[category][i];
                    draw(&mut rng, p.row(from).iter().copied())
                }
            };
        }
    }
    let leaves = tree.leaves();
    let ids = leaves.iter().map(|n| n.id.clone()).collect();
    let seqs = leaves
        .iter()
        .map(|n| {
            states[usize::from(&n.idx)]
                .iter()
                .flat_map(|s| alphabet.state_label(*s).into_bytes())
                .collect()
        })
        .collect();
    (ids, seqs)
}

pub(crate) fn simulated_info(
    tree: &Tree,
    rate: &RateMatrix,
    alphabet: &Alphabet,
    n_sites: usize,
    seed: u64,
) -> PhyloInfo {
    let (ids, seqs) = simulate_sequences(tree, rate, alphabet, n_sites, &[1.0], seed);
    info_from_sequences(tree.clone(), alphabet.clone(), ids, &seqs)
}

pub(crate) fn info_from_sequences(
    tree: Tree,
    alphabet: Alphabet,
    ids: Vec<String>,
    seqs: &[Vec<u8>],
) -> PhyloInfo {
    let refs: Vec<&[u8]> = seqs.iter().map(|s| s.as_slice()).collect();
    let patterns = SitePatterns::from_alignment(alphabet, ids, &refs, None).unwrap();
    PhyloInfoBuilder::new(tree, patterns).build().unwrap()
}

pub(crate) fn info_from_strs(tree: Tree, alphabet: Alphabet, ids: &[&str], seqs: &[&str]) -> PhyloInfo {
    let seqs: Vec<Vec<u8>> = seqs.iter().map(|s| s.as_bytes().to_vec()).collect();
    info_from_sequences(
        tree,
        alphabet,
        ids.iter().map(|s| s.to_string()).collect(),
        &seqs,
    )
}
