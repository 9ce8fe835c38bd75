use approx::assert_relative_eq;
use assert_matches::assert_matches;
use rstest::rstest;

use crate::alphabets::Alphabet;
use crate::errors::{model_error, ModelError};
use crate::likelihood::{
    PartialLikelihoods, Pruner, TransitionMatrices, DEFAULT_SCALE_THRESHOLD, LIKELIHOOD_FLOOR,
};
use crate::patterns::SitePatterns;
use crate::phylo_info::{PhyloInfo, PhyloInfoBuilder};
use crate::substitution_models::{
    CustomModel, Decomposition, NucleotideModel, QMatrixBuilder, RateMatrix, Scaling,
    SubstMatrix,
};
use crate::test_utils::{info_from_strs, simulated_info};
use crate::{frequencies, tree};

fn transitions(info: &PhyloInfo, rate: &RateMatrix, gene_rates: &[f64]) -> TransitionMatrices {
    let decomposition = Decomposition::new(rate);
    let mut matrices =
        TransitionMatrices::new(info.patterns.n_genes(), info.tree.len(), info.n_states());
    for (gene, r) in gene_rates.iter().enumerate() {
        for idx in info.tree.branches() {
            matrices.set(gene, &idx, decomposition.p(info.tree.blen(&idx) * r));
        }
    }
    matrices
}

fn log_likelihood(info: &PhyloInfo, rate: &RateMatrix, threshold: f64) -> f64 {
    let pruner = Pruner::new(info).with_scale_threshold(threshold);
    let mut buffers = PartialLikelihoods::new(info);
    let gene_rates = vec![1.0; info.patterns.n_genes()];
    pruner
        .prune(&mut buffers, &transitions(info, rate, &gene_rates))
        .unwrap();
    let site_logl = pruner.site_log_likelihoods(&buffers, &rate.freqs).unwrap();
    assert!(!site_logl.suspect);
    site_logl.total(info.patterns.weights())
}

fn jc69() -> RateMatrix {
    let model = NucleotideModel::JC69;
    model
        .build_q(&[], &model.model_freqs().unwrap(), Scaling::Normalised)
        .unwrap()
}

fn hky() -> RateMatrix {
    NucleotideModel::HKY
        .build_q(&[3.0], &frequencies!(&[0.2, 0.3, 0.35, 0.15]), Scaling::Normalised)
        .unwrap()
}

#[test]
fn two_state_star_tree() {
    let tree = tree!("(A:0.1,B:0.1,C:0.1);");
    let alphabet = Alphabet::Custom(b"01".to_vec());
    let info = info_from_strs(tree, alphabet, &["A", "B", "C"], &["00", "00", "01"]);
    let rate = CustomModel::equal_rates(2)
        .unwrap()
        .build_q(&[], &frequencies!(&[0.5, 0.5]), Scaling::Normalised)
        .unwrap();
    let same = 0.5 + 0.5 * (-0.2f64).exp();
    let diff = 0.5 - 0.5 * (-0.2f64).exp();
    let identical = 0.5 * (same.powi(3) + diff.powi(3));
    let one_differs = 0.5 * (same * same * diff + diff * diff * same);

    let pruner = Pruner::new(&info);
    let mut buffers = PartialLikelihoods::new(&info);
    pruner
        .prune(&mut buffers, &transitions(&info, &rate, &[1.0]))
        .unwrap();
    let site_logl = pruner.site_log_likelihoods(&buffers, &rate.freqs).unwrap();
    assert_relative_eq!(site_logl.values[0], identical.ln(), epsilon = 1e-6);
    assert_relative_eq!(site_logl.values[1], one_differs.ln(), epsilon = 1e-6);
    assert_relative_eq!(
        site_logl.total(info.patterns.weights()),
        identical.ln() + one_differs.ln(),
        epsilon = 1e-12
    );
}

#[rstest]
#[case::jc69(jc69())]
#[case::hky(hky())]
fn scaling_does_not_change_likelihood(#[case] rate: RateMatrix) {
    let tree = tree!("(((A:0.1,B:0.25):0.3,C:0.2):0.05,(D:0.4,E:0.15):0.1);");
    let info = simulated_info(&tree, &rate, &Alphabet::Nucleotide, 200, 7);
    let unscaled = log_likelihood(&info, &rate, 0.0);
    let default = log_likelihood(&info, &rate, DEFAULT_SCALE_THRESHOLD);
    let always = log_likelihood(&info, &rate, f64::INFINITY);
    assert_relative_eq!(unscaled, default, epsilon = 1e-10);
    assert_relative_eq!(unscaled, always, epsilon = 1e-8);
}

#[test]
fn rescaled_buffers_record_log_factors() {
    let tree = tree!("((A:0.1,B:0.2):0.3,C:0.4);");
    let info = info_from_strs(tree, Alphabet::Nucleotide, &["A", "B", "C"], &["AC", "AG", "AT"]);
    let rate = jc69();
    let pruner = Pruner::new(&info).with_scale_threshold(f64::INFINITY);
    let mut buffers = PartialLikelihoods::new(&info);
    pruner
        .prune(&mut buffers, &transitions(&info, &rate, &[1.0]))
        .unwrap();
    for node in info.tree.internals() {
        let partial = buffers.node_info(&node.idx);
        for column in partial.column_iter() {
            assert_relative_eq!(column.max(), 1.0);
        }
        assert!(buffers.node_scale(&node.idx).iter().all(|s| *s < 0.0));
        assert!(!buffers.is_dirty(&node.idx));
    }
}

#[test]
fn dirty_nodes_match_full_recompute() {
    let rate = hky();
    let tree = tree!("(((A:0.1,B:0.25):0.3,C:0.2):0.05,(D:0.4,E:0.15):0.1);");
    let mut info = simulated_info(&tree, &rate, &Alphabet::Nucleotide, 100, 11);
    let pruner_info = info.clone();
    let pruner = Pruner::new(&pruner_info);
    let mut buffers = PartialLikelihoods::new(&pruner_info);
    pruner
        .prune(&mut buffers, &transitions(&pruner_info, &rate, &[1.0]))
        .unwrap();

    let b = info.tree.try_idx("B").unwrap();
    info.tree.set_blen(&b, 0.7);
    for ancestor in info.tree.ancestors(&b) {
        buffers.mark_dirty(&ancestor);
    }
    let updated = transitions(&info, &rate, &[1.0]);
    pruner.prune(&mut buffers, &updated).unwrap();
    let cached = pruner.site_log_likelihoods(&buffers, &rate.freqs).unwrap();

    let mut fresh = PartialLikelihoods::new(&pruner_info);
    pruner.prune(&mut fresh, &updated).unwrap();
    let full = pruner.site_log_likelihoods(&fresh, &rate.freqs).unwrap();
    for (x, y) in cached.values.iter().zip(full.values.iter()) {
        assert_eq!(x.to_bits(), y.to_bits());
    }

    // clean buffers are not recomputed, whatever the matrices say
    let stale = pruner.site_log_likelihoods(&buffers, &rate.freqs).unwrap();
    pruner
        .prune(&mut buffers, &transitions(&info, &rate, &[2.0]))
        .unwrap();
    assert_eq!(stale, pruner.site_log_likelihoods(&buffers, &rate.freqs).unwrap());
}

#[test]
fn missing_taxon_does_not_change_likelihood() {
    let rate = jc69();
    let full = info_from_strs(
        tree!("((A:0.1,B:0.2):0.3,C:0.4);"),
        Alphabet::Nucleotide,
        &["A", "B", "C"],
        &["ACGTTA", "ACGATA", "------"],
    );
    let pruned = info_from_strs(
        tree!("(A:0.1,B:0.2);"),
        Alphabet::Nucleotide,
        &["A", "B"],
        &["ACGTTA", "ACGATA"],
    );
    assert_relative_eq!(
        log_likelihood(&full, &rate, DEFAULT_SCALE_THRESHOLD),
        log_likelihood(&pruned, &rate, DEFAULT_SCALE_THRESHOLD),
        epsilon = 1e-12
    );
}

#[test]
fn genes_use_their_own_matrices() {
    let rate = hky();
    let ids = ["A", "B", "C", "D"];
    let seqs: [&[u8]; 4] = [b"ACGTACGTAA", b"ACGTTCGTAC", b"ACCTACGAAA", b"TCGTACGTAG"];
    let taxa: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
    let site_genes = [0, 0, 0, 0, 1, 1, 1, 1, 1, 1];
    let patterns =
        SitePatterns::from_alignment(Alphabet::Nucleotide, taxa.clone(), &seqs, Some(&site_genes[..]))
            .unwrap();
    let tree = tree!("((A:0.1,B:0.2):0.3,(C:0.15,D:0.25):0.05);");
    let info = PhyloInfoBuilder::new(tree, patterns).build().unwrap();
    let pruner = Pruner::new(&info);
    let mut buffers = PartialLikelihoods::new(&info);
    pruner
        .prune(&mut buffers, &transitions(&info, &rate, &[1.0, 2.0]))
        .unwrap();
    let site_logl = pruner.site_log_likelihoods(&buffers, &rate.freqs).unwrap();
    let range = info.patterns.gene_range(1);
    let gene_logl: f64 = range
        .clone()
        .map(|p| site_logl.values[p] * info.patterns.weights()[p])
        .sum();

    let second: Vec<&[u8]> = seqs.iter().map(|s| &s[4..]).collect();
    let patterns = SitePatterns::from_alignment(Alphabet::Nucleotide, taxa, &second, None).unwrap();
    let doubled = tree!("((A:0.2,B:0.4):0.6,(C:0.3,D:0.5):0.1);");
    let separate = PhyloInfoBuilder::new(doubled, patterns).build().unwrap();
    assert_relative_eq!(
        gene_logl,
        log_likelihood(&separate, &rate, DEFAULT_SCALE_THRESHOLD),
        epsilon = 1e-12
    );
}

#[test]
fn zero_likelihood_is_floored() {
    let info = info_from_strs(
        tree!("(A:0.1,B:0.2);"),
        Alphabet::Nucleotide,
        &["A", "B"],
        &["AC", "AA"],
    );
    let rate = jc69();
    let mut matrices = TransitionMatrices::new(1, info.tree.len(), 4);
    for idx in info.tree.branches() {
        matrices.set(0, &idx, SubstMatrix::zeros(4, 4));
    }
    let pruner = Pruner::new(&info);
    let mut buffers = PartialLikelihoods::new(&info);
    pruner.prune(&mut buffers, &matrices).unwrap();
    let site_logl = pruner.site_log_likelihoods(&buffers, &rate.freqs).unwrap();
    assert!(site_logl.suspect);
    assert!(site_logl
        .values
        .iter()
        .all(|v| *v == LIKELIHOOD_FLOOR.ln()));
}

#[test]
fn gene_count_mismatch() {
    let info = info_from_strs(
        tree!("(A:0.1,B:0.2);"),
        Alphabet::Nucleotide,
        &["A", "B"],
        &["AC", "AA"],
    );
    let pruner = Pruner::new(&info);
    let mut buffers = PartialLikelihoods::new(&info);
    let err = pruner
        .prune(&mut buffers, &TransitionMatrices::new(2, info.tree.len(), 4))
        .unwrap_err();
    assert_matches!(model_error(&err), Some(ModelError::ModelStateInconsistency(_)));
}
