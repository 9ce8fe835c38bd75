use approx::assert_relative_eq;
use assert_matches::assert_matches;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::alphabets::{Alphabet, GeneticCode, NUCLEOTIDES};
use crate::engine::*;
use crate::errors::{model_error, ModelError};
use crate::likelihood::{PartialLikelihoods, Pruner, TransitionMatrices};
use crate::parameters::{FrequencyMode, ModelDescriptor, Phase, RateVariation};
use crate::phylo_info::PhyloInfo;
use crate::site_heterogeneity::SelectionModel;
use crate::substitution_models::{
    codon_freqs_f1x4, CodonModel, Decomposition, NucleotideModel, QMatrixBuilder, Scaling,
    SubstModelKind,
};
use crate::test_utils::{info_from_sequences, info_from_strs, simulated_info};
use crate::{frequencies, tree};

const NO_STOPS: &str = "FFLLSSSSYYYYCCWWLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG";

fn nucleotide(model: NucleotideModel) -> ModelDescriptor {
    ModelDescriptor::new(SubstModelKind::Nucleotide(model))
}

fn goldman_yang() -> ModelDescriptor {
    ModelDescriptor::new(SubstModelKind::Codon(CodonModel::goldman_yang(
        GeneticCode::standard(),
    )))
}

fn engine(info: PhyloInfo, descriptor: ModelDescriptor) -> LikelihoodEngine {
    EngineBuilder::new(info, descriptor).build().unwrap()
}

fn dna_info() -> PhyloInfo {
    let model = NucleotideModel::HKY;
    let rate = model
        .build_q(&[2.5], &frequencies!(&[0.3, 0.2, 0.2, 0.3]), Scaling::Normalised)
        .unwrap();
    simulated_info(
        &tree!("(((A:0.1,B:0.25):0.05,C:0.3):0.1,(D:0.2,E:0.15):0.12);"),
        &rate,
        &Alphabet::Nucleotide,
        300,
        7,
    )
}

fn codon_info(labelled: bool) -> PhyloInfo {
    let newick = if labelled {
        "((A:0.1,B:0.2):0.3 #1,(C:0.4,D:0.1):0.2);"
    } else {
        "((A:0.1,B:0.2):0.3,(C:0.4,D:0.1):0.2);"
    };
    info_from_strs(
        tree!(newick),
        Alphabet::Codon(GeneticCode::standard()),
        &["A", "B", "C", "D"],
        &[
            "ATGAAACCCGGGTTTCTG",
            "ATGAAGCCAGGGTTCCTG",
            "ATGCAACCCGGATTTTTG",
            "ATGCAGCCTGGATACCTA",
        ],
    )
}

fn evaluate(engine: &LikelihoodEngine, x: &[f64], phase: Phase) -> f64 {
    engine.evaluate(x, phase).unwrap().neg_log_likelihood
}

#[test]
fn repeated_evaluations_are_identical() {
    let descriptor = nucleotide(NucleotideModel::HKY)
        .with_freq_mode(FrequencyMode::Estimated)
        .with_rate_variation(RateVariation::gamma(0.8, 4));
    let engine = engine(dna_info(), descriptor);
    let x1 = engine.initial_params(Phase::Optimising).unwrap();
    let mut x2 = x1.clone();
    for v in x2.iter_mut() {
        *v *= 1.1;
    }
    let first = evaluate(&engine, &x1, Phase::Optimising);
    let again = evaluate(&engine, &x1, Phase::Optimising);
    let other = evaluate(&engine, &x2, Phase::Optimising);
    let back = evaluate(&engine, &x1, Phase::Optimising);
    assert_eq!(first.to_bits(), again.to_bits());
    assert_eq!(first.to_bits(), back.to_bits());
    assert_ne!(first.to_bits(), other.to_bits());
    assert!(first.is_finite() && first > 0.0);
}

#[test]
fn jc69_matches_direct_pruning() {
    let info = dna_info();
    let engine = engine(info.clone(), nucleotide(NucleotideModel::JC69));
    let x = engine.initial_params(Phase::Final).unwrap();
    let result = engine.evaluate(&x, Phase::Final).unwrap();
    assert!(!result.suspect);

    let model = NucleotideModel::JC69;
    let rate = model
        .build_q(&[], &model.model_freqs().unwrap(), Scaling::Normalised)
        .unwrap();
    let decomposition = Decomposition::new(&rate);
    let mut transitions = TransitionMatrices::new(1, info.tree.len(), 4);
    for idx in info.tree.branches() {
        transitions.set(0, &idx, decomposition.p(info.tree.blen(&idx)));
    }
    let pruner = Pruner::new(&info);
    let mut buffers = PartialLikelihoods::new(&info);
    pruner.prune(&mut buffers, &transitions).unwrap();
    let direct = pruner
        .site_log_likelihoods(&buffers, &rate.freqs)
        .unwrap()
        .total(info.patterns.weights());
    assert_relative_eq!(result.neg_log_likelihood, -direct, max_relative = 1e-10);
}

#[test]
fn branch_update_matches_fresh_engine() {
    let info = dna_info();
    let descriptor = nucleotide(NucleotideModel::HKY).with_rate_variation(RateVariation::gamma(0.5, 4));
    let cached = engine(info.clone(), descriptor.clone());
    let x = cached.initial_params(Phase::Optimising).unwrap();
    evaluate(&cached, &x, Phase::Optimising);

    let mut moved = x.clone();
    let leaf = cached
        .layout()
        .names()
        .iter()
        .position(|n| n == "t_A")
        .unwrap();
    moved[leaf] += 0.07;
    let fresh = engine(info, descriptor);
    assert_eq!(
        evaluate(&cached, &moved, Phase::Optimising).to_bits(),
        evaluate(&fresh, &moved, Phase::Optimising).to_bits()
    );
}

#[test]
fn flat_gamma_is_homogeneous() {
    let info = dna_info();
    let homogeneous = engine(info.clone(), nucleotide(NucleotideModel::HKY));
    let gamma = engine(
        info,
        nucleotide(NucleotideModel::HKY).with_rate_variation(RateVariation::Gamma {
            alpha: 1e4,
            categories: 4,
            method: crate::site_heterogeneity::GammaMethod::Mean,
            fix_alpha: true,
        }),
    );
    assert_eq!(
        homogeneous.parameter_count(),
        gamma.parameter_count(),
        "a fixed shape is not a parameter"
    );
    let x = homogeneous.initial_params(Phase::Final).unwrap();
    assert_relative_eq!(
        evaluate(&homogeneous, &x, Phase::Final),
        evaluate(&gamma, &x, Phase::Final),
        max_relative = 1e-4
    );
}

#[test]
fn neutral_site_classes_collapse_to_one_ratio() {
    let one_ratio = engine(
        codon_info(false),
        goldman_yang().with_selection_params(vec![1.0]),
    );
    let expected = evaluate(
        &one_ratio,
        &one_ratio.initial_params(Phase::Final).unwrap(),
        Phase::Final,
    );

    let m1a = engine(
        codon_info(false),
        goldman_yang()
            .with_selection(SelectionModel::NearlyNeutral)
            .with_selection_params(vec![0.6, 1.0]),
    );
    let x = m1a.initial_params(Phase::Final).unwrap();
    assert_relative_eq!(evaluate(&m1a, &x, Phase::Final), expected, max_relative = 1e-10);

    let labelled_one_ratio = engine(
        codon_info(true),
        goldman_yang().with_selection_params(vec![1.0]),
    );
    let branch_site = engine(
        codon_info(true),
        goldman_yang()
            .with_selection(SelectionModel::BranchSiteA)
            .with_selection_params(vec![0.5, 0.3, 1.0, 1.0]),
    );
    let x = branch_site.initial_params(Phase::Final).unwrap();
    assert_relative_eq!(
        evaluate(&branch_site, &x, Phase::Final),
        evaluate(
            &labelled_one_ratio,
            &labelled_one_ratio.initial_params(Phase::Final).unwrap(),
            Phase::Final
        ),
        max_relative = 1e-10
    );
}

#[test]
fn labelled_root_branches_are_separate_parameters() {
    let branch_ratios = || {
        goldman_yang()
            .with_selection(SelectionModel::BranchRatios)
            .with_selection_params(vec![0.1, 5.0])
    };
    let mut values = Vec::new();
    for newick in [
        "((A:0.1,B:0.2):0.05 #1,(C:0.4,D:0.1):0.95);",
        "((A:0.1,B:0.2):0.95 #1,(C:0.4,D:0.1):0.05);",
    ] {
        let info = || {
            info_from_strs(
                tree!(newick),
                Alphabet::Codon(GeneticCode::standard()),
                &["A", "B", "C", "D"],
                &[
                    "ATGAAACCCGGGTTTCTG",
                    "ATGAAGCCAGGGTTCCTG",
                    "ATGCAACCCGGATTTTTG",
                    "ATGCAGCCTGGATACCTA",
                ],
            )
        };
        let free = engine(info(), branch_ratios());
        let fixed = engine(info(), branch_ratios().with_fixed_branch_lengths());
        let expected = evaluate(&fixed, &fixed.initial_params(Phase::Final).unwrap(), Phase::Final);
        let x = free.initial_params(Phase::Final).unwrap();
        assert_relative_eq!(evaluate(&free, &x, Phase::Final), expected, max_relative = 1e-10);
        values.push(expected);
    }
    assert!((values[0] - values[1]).abs() > 1e-3);
}

#[test]
fn neutral_muse_gaut_is_three_nucleotide_positions() {
    let code = GeneticCode::from_table("no stops", NO_STOPS).unwrap();
    assert_eq!(code.n_sense(), 64);
    let pi = frequencies!(&[0.1, 0.2, 0.3, 0.4]);
    let codon_freqs = codon_freqs_f1x4(&code, &pi).unwrap();

    let mut rng = StdRng::seed_from_u64(11);
    let ids = vec![
        "A".to_string(),
        "B".to_string(),
        "C".to_string(),
        "D".to_string(),
    ];
    let seqs: Vec<Vec<u8>> = (0..4)
        .map(|_| (0..60).map(|_| NUCLEOTIDES[rng.gen_range(0..4)]).collect())
        .collect();

    let codon_info = info_from_sequences(
        tree!("((A:0.3,B:0.6):0.15,(C:0.45,D:0.9):0.3);"),
        Alphabet::Codon(code.clone()),
        ids.clone(),
        &seqs,
    );
    let codon = engine(
        codon_info,
        ModelDescriptor::new(SubstModelKind::Codon(CodonModel::muse_gaut(code)))
            .with_fixed_rate_params(vec![2.0])
            .with_selection_params(vec![1.0])
            .with_fixed_omega()
            .with_freq_mode(FrequencyMode::Fixed(codon_freqs)),
    );
    let codon_nll = evaluate(
        &codon,
        &codon.initial_params(Phase::Final).unwrap(),
        Phase::Final,
    );

    let mut nucleotide_nll = 0.0;
    for position in 0..3 {
        let column: Vec<Vec<u8>> = seqs
            .iter()
            .map(|s| s.iter().skip(position).step_by(3).copied().collect())
            .collect();
        let info = info_from_sequences(
            tree!("((A:0.1,B:0.2):0.05,(C:0.15,D:0.3):0.1);"),
            Alphabet::Nucleotide,
            ids.clone(),
            &column,
        );
        let hky = engine(
            info,
            nucleotide(NucleotideModel::HKY)
                .with_fixed_rate_params(vec![2.0])
                .with_freq_mode(FrequencyMode::Fixed(pi.clone())),
        );
        nucleotide_nll += evaluate(&hky, &hky.initial_params(Phase::Final).unwrap(), Phase::Final);
    }
    assert_relative_eq!(codon_nll, nucleotide_nll, max_relative = 1e-8);
}

#[test]
fn run_lock() {
    let mut engine = engine(dna_info(), nucleotide(NucleotideModel::K80));
    let x = engine.initial_params(Phase::Optimising).unwrap();
    let final_x = engine.initial_params(Phase::Final).unwrap();
    engine.begin_run().unwrap();
    assert!(engine.in_run());

    assert!(engine.evaluate(&x, Phase::Optimising).is_ok());
    let err = engine.evaluate(&final_x, Phase::Final).unwrap_err();
    assert_matches!(model_error(&err), Some(ModelError::ModelStateInconsistency(_)));
    let err = engine.evaluate(&x[1..], Phase::Optimising).unwrap_err();
    assert_matches!(model_error(&err), Some(ModelError::ModelStateInconsistency(_)));
    let err = engine
        .set_descriptor(nucleotide(NucleotideModel::JC69))
        .unwrap_err();
    assert_matches!(model_error(&err), Some(ModelError::ModelStateInconsistency(_)));
    assert!(engine.begin_run().is_err());

    engine.end_run();
    assert!(engine.evaluate(&final_x, Phase::Final).is_ok());
    engine
        .set_descriptor(nucleotide(NucleotideModel::JC69))
        .unwrap();
    assert_eq!(engine.parameter_count(), x.len() - 1);
}

#[test]
fn branch_substitutions_follow_branch_lengths() {
    let engine = engine(dna_info(), nucleotide(NucleotideModel::JC69));
    let x = engine.initial_params(Phase::Final).unwrap();
    let values = engine.values(&x, Phase::Final).unwrap();
    let report = engine.branch_substitutions(&x, Phase::Final).unwrap();
    assert_eq!(report.len(), engine.info().tree.len() - 1);
    for branch in report {
        assert_relative_eq!(
            branch.total,
            values.blens[usize::from(&branch.node)],
            max_relative = 1e-10
        );
        assert_eq!(branch.synonymous, None);
    }
}

#[test]
fn synonymous_and_nonsynonymous_substitutions() {
    let engine = engine(
        codon_info(false),
        goldman_yang().with_selection_params(vec![0.3]),
    );
    let x = engine.initial_params(Phase::Final).unwrap();
    let values = engine.values(&x, Phase::Final).unwrap();
    for branch in engine.branch_substitutions(&x, Phase::Final).unwrap() {
        let synonymous = branch.synonymous.unwrap();
        let nonsynonymous = branch.nonsynonymous.unwrap();
        assert!(synonymous > 0.0 && nonsynonymous > 0.0);
        assert_relative_eq!(synonymous + nonsynonymous, branch.total, max_relative = 1e-10);
        assert_relative_eq!(
            branch.total,
            values.blens[usize::from(&branch.node)],
            max_relative = 1e-10
        );
    }

    let silent = self::engine(
        codon_info(false),
        goldman_yang()
            .with_selection_params(vec![0.0])
            .with_fixed_omega(),
    );
    let x = silent.initial_params(Phase::Final).unwrap();
    for branch in silent.branch_substitutions(&x, Phase::Final).unwrap() {
        assert_eq!(branch.nonsynonymous, Some(0.0));
        assert_relative_eq!(branch.synonymous.unwrap(), branch.total, max_relative = 1e-10);
    }
}

#[test]
fn site_class_posteriors() {
    let engine = engine(
        codon_info(false),
        goldman_yang().with_selection(SelectionModel::PositiveSelection),
    );
    let x = engine.initial_params(Phase::Optimising).unwrap();
    let posteriors = engine.posteriors(&x, Phase::Optimising).unwrap();
    assert_eq!(
        posteriors.shape(),
        (engine.info().patterns.n_patterns(), 3)
    );
    for row in posteriors.row_iter() {
        assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-12);
    }
    let site_logl = engine.site_log_likelihoods(&x, Phase::Optimising).unwrap();
    let total: f64 = site_logl
        .iter()
        .zip(engine.info().patterns.weights())
        .map(|(l, w)| l * w)
        .sum();
    assert_relative_eq!(
        -total,
        evaluate(&engine, &x, Phase::Optimising),
        max_relative = 1e-12
    );
}

#[test]
fn invalid_rate_parameters() {
    let engine = engine(
        dna_info(),
        nucleotide(NucleotideModel::HKY).with_fixed_rate_params(vec![-2.0]),
    );
    let x = engine.initial_params(Phase::Final).unwrap();
    let err = engine.evaluate(&x, Phase::Final).unwrap_err();
    assert_matches!(model_error(&err), Some(ModelError::ModelConfiguration(_)));
}

#[test]
fn invalid_descriptor_is_rejected() {
    let err = EngineBuilder::new(
        dna_info(),
        goldman_yang().with_selection_params(vec![0.3]),
    )
    .build()
    .unwrap_err();
    assert_matches!(model_error(&err), Some(ModelError::ModelConfiguration(_)));
}
