use approx::assert_relative_eq;
use argmin::core::{CostFunction, Gradient};

use crate::alphabets::Alphabet;
use crate::engine::{EngineBuilder, LikelihoodEngine};
use crate::optimisers::*;
use crate::parameters::{FrequencyMode, ModelDescriptor, Phase};
use crate::substitution_models::{NucleotideModel, QMatrixBuilder, RateMatrix, Scaling, SubstModelKind};
use crate::test_utils::{info_from_sequences, simulate_sequences};
use crate::tree::Tree;
use crate::{frequencies, tree};

fn quadratic(x: &[f64]) -> crate::Result<f64> {
    Ok((x[0] - 1.0).powi(2) + 3.0 * (x[1] + 2.0).powi(2) + x[0] * x[1])
}

#[test]
fn quadratic_gradient() {
    let bounds = [(-10.0, 10.0), (-10.0, 10.0)];
    let gradient = numerical_gradient(quadratic, &[0.5, 0.5], &bounds).unwrap();
    assert_relative_eq!(gradient[0], 2.0 * (0.5 - 1.0) + 0.5, epsilon = 1e-6);
    assert_relative_eq!(gradient[1], 6.0 * (0.5 + 2.0) + 0.5, epsilon = 1e-6);
}

#[test]
fn quadratic_hessian() {
    let bounds = [(-10.0, 10.0), (-10.0, 10.0)];
    let hessian = numerical_hessian(quadratic, &[0.5, -1.5], &bounds).unwrap();
    assert_relative_eq!(hessian[(0, 0)], 2.0, epsilon = 1e-4);
    assert_relative_eq!(hessian[(1, 1)], 6.0, epsilon = 1e-4);
    assert_relative_eq!(hessian[(0, 1)], 1.0, epsilon = 1e-4);
    assert_eq!(hessian[(0, 1)], hessian[(1, 0)]);
}

#[test]
fn derivatives_stay_within_bounds() {
    let bounds = [(0.0, 10.0), (-2.0, 10.0)];
    let checked = |x: &[f64]| {
        assert!(x[0] >= -1e-12 && x[1] >= -2.0 - 1e-12);
        quadratic(x)
    };
    let gradient = numerical_gradient(checked, &[0.0, -2.0], &bounds).unwrap();
    assert_relative_eq!(gradient[0], -2.0 - 2.0, epsilon = 1e-3);
    assert_relative_eq!(gradient[1], 0.0, epsilon = 1e-3);
    let hessian = numerical_hessian(checked, &[0.0, -2.0], &bounds).unwrap();
    assert_relative_eq!(hessian[(0, 0)], 2.0, epsilon = 1e-3);
}

fn true_tree() -> Tree {
    tree!("((A:0.2,B:0.3):0.15,(C:0.25,D:0.4):0.1);")
}

fn simulated_engine(rate: &RateMatrix, descriptor: ModelDescriptor, start: &str) -> LikelihoodEngine {
    let (ids, seqs) = simulate_sequences(&true_tree(), rate, &Alphabet::Nucleotide, 2000, &[1.0], 3);
    let info = info_from_sequences(tree!(start), Alphabet::Nucleotide, ids, &seqs);
    EngineBuilder::new(info, descriptor).build().unwrap()
}

#[test]
fn recovers_branch_lengths() {
    let model = NucleotideModel::JC69;
    let rate = model
        .build_q(&[], &model.model_freqs().unwrap(), Scaling::Normalised)
        .unwrap();
    let mut engine = simulated_engine(
        &rate,
        ModelDescriptor::new(SubstModelKind::Nucleotide(model)),
        "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);",
    );
    let truth = {
        let tree = true_tree();
        let mut values = engine.initial_values().clone();
        for node in &tree.nodes {
            values.blens[usize::from(&node.idx)] = node.blen;
        }
        engine.layout().pack(&values, Phase::Final).unwrap()
    };
    let true_cost = engine.evaluate(&truth, Phase::Final).unwrap().neg_log_likelihood;

    let result = ParameterOptimiser::new(&mut engine).run().unwrap();
    assert!(!engine.in_run());
    assert!(result.final_cost < result.initial_cost);
    assert!(result.final_cost <= true_cost + 1e-3);
    assert_relative_eq!(
        result.final_cost,
        engine.evaluate(&result.params, Phase::Final).unwrap().neg_log_likelihood
    );
    for (fitted, expected) in result.params.iter().zip(&truth) {
        assert_relative_eq!(*fitted, *expected, max_relative = 0.2);
    }

    let x = engine
        .layout()
        .convert(&result.params, Phase::Final, Phase::Optimising)
        .unwrap();
    let objective = LikelihoodObjective::new(&engine);
    assert_relative_eq!(objective.cost(&x).unwrap(), result.final_cost, max_relative = 1e-12);
    let gradient = objective.gradient(&x).unwrap();
    let hessian = objective.hessian(&x).unwrap();
    for i in 0..x.len() {
        // curvature of order sites / t at the optimum dwarfs the remaining slope
        assert!(gradient[i].abs() < 1e-2 * hessian[(i, i)]);
        assert!(hessian[(i, i)] > 0.0);
    }
}

#[test]
fn recovers_kappa() {
    let model = NucleotideModel::HKY;
    let freqs = frequencies!(&[0.3, 0.2, 0.15, 0.35]);
    let rate = model.build_q(&[4.0], &freqs, Scaling::Normalised).unwrap();
    let mut engine = simulated_engine(
        &rate,
        ModelDescriptor::new(SubstModelKind::Nucleotide(model))
            .with_rate_params(vec![1.0])
            .with_freq_mode(FrequencyMode::Fixed(freqs))
            .with_fixed_branch_lengths(),
        "((A:0.2,B:0.3):0.15,(C:0.25,D:0.4):0.1);",
    );
    assert_eq!(engine.layout().names(), &["kappa".to_string()]);
    let result = ParameterOptimiser::new(&mut engine)
        .with_epsilon(1e-6)
        .run()
        .unwrap();
    assert!(result.final_cost < result.initial_cost);
    assert_relative_eq!(result.values.rate_params[0], 4.0, max_relative = 0.3);
    assert_eq!(result.params, result.values.rate_params);
}

#[test]
fn estimated_frequencies_stay_a_distribution() {
    let model = NucleotideModel::F81;
    let freqs = frequencies!(&[0.4, 0.1, 0.2, 0.3]);
    let rate = model.build_q(&[], &freqs, Scaling::Normalised).unwrap();
    let mut engine = simulated_engine(
        &rate,
        ModelDescriptor::new(SubstModelKind::Nucleotide(model))
            .with_freq_mode(FrequencyMode::Estimated)
            .with_fixed_branch_lengths(),
        "((A:0.2,B:0.3):0.15,(C:0.25,D:0.4):0.1);",
    );
    let result = ParameterOptimiser::new(&mut engine).run().unwrap();
    let fitted = &result.values.freqs;
    assert_relative_eq!(fitted.sum(), 1.0, epsilon = 1e-12);
    for (f, expected) in fitted.iter().zip(freqs.iter()) {
        assert_relative_eq!(*f, *expected, epsilon = 0.05);
    }
}
