//! Tests for the L1 imbalance measure

mod common;

use cem::pipeline::{
    imbalance, imbalance_params, match_weights, retained_rows, univariate_imbalance, Coarsening, CutMethod,
    Granularity, ImbalanceMeasure, ImbalanceParams, ImbalanceScore, MatchOptions,
};
use cem::CemError;
use common::{create_balanced_dataframe, create_disjoint_dataframe, create_observational_dataframe};
use polars::prelude::*;

#[test]
fn test_identical_distributions_score_zero() {
    let df = create_balanced_dataframe();
    let params = imbalance_params(&df, "treated", ImbalanceMeasure::L1, &["x".to_string()], 2).unwrap();
    let report = imbalance(&df, "treated", ImbalanceMeasure::L1, &params).unwrap();
    assert!(report.score.value().abs() < 1e-12);
}

#[test]
fn test_disjoint_support_scores_one() {
    let df = create_disjoint_dataframe();
    let params = imbalance_params(&df, "treated", ImbalanceMeasure::L1, &[], 5).unwrap();
    assert_eq!(params.bins, vec![2]);
    assert_eq!(params.ranges, vec![(0.0, 1.0)]);

    let report = imbalance(&df, "treated", ImbalanceMeasure::L1, &params).unwrap();
    assert!((report.score.value() - 1.0).abs() < 1e-12);
}

#[test]
fn test_imbalance_within_bounds() {
    let df = create_observational_dataframe(300, 5).drop("outcome").unwrap();
    let continuous = vec!["age".to_string(), "income".to_string()];
    let params = imbalance_params(&df, "treated", ImbalanceMeasure::L1, &continuous, 5).unwrap();
    assert_eq!(params.bins, vec![5, 5, 4]);

    let report = imbalance(&df, "treated", ImbalanceMeasure::L1, &params).unwrap();
    let value = report.score.value();
    assert!((0.0..=1.0).contains(&value), "imbalance {}", value);
}

#[test]
fn test_matching_reduces_imbalance() {
    // Scenario A: balanced frame, coarse bins, near-zero imbalance after matching
    let df = create_balanced_dataframe();
    let params = imbalance_params(&df, "treated", ImbalanceMeasure::L1, &["x".to_string()], 2).unwrap();
    let coarsening = Coarsening::new()
        .with("x", CutMethod::Cut, Granularity::Bins(2))
        .with("y", CutMethod::Cut, Granularity::Bins(2));
    let weights = match_weights(&df, "treated", &coarsening, &MatchOptions::default()).unwrap();
    let matched = retained_rows(&df, &weights).unwrap();

    assert_eq!(matched.height(), df.height());
    let report = imbalance(&matched, "treated", ImbalanceMeasure::L1, &params).unwrap();
    assert!(report.score.value() < 1e-9);
}

#[test]
fn test_single_level_degrades_to_worst() {
    let df = df! {
        "x" => [1.0f64, 2.0, 3.0],
        "treated" => [1i32, 1, 1],
    }
    .unwrap();
    let params = ImbalanceParams {
        covariates: vec!["x".to_string()],
        bins: vec![3],
        ranges: vec![(1.0, 3.0)],
    };
    let score = ImbalanceMeasure::L1.evaluate(&df, "treated", &params).unwrap();
    assert_eq!(score, ImbalanceScore::WORST);
}

#[test]
fn test_multilevel_treatment_reports_pairs() {
    let df = df! {
        "x" => [0.0f64, 0.0, 1.0, 1.0, 0.0, 1.0],
        "treated" => [0i32, 0, 1, 1, 2, 2],
    }
    .unwrap();
    let params = imbalance_params(&df, "treated", ImbalanceMeasure::L1, &[], 5).unwrap();
    let report = imbalance(&df, "treated", ImbalanceMeasure::L1, &params).unwrap();

    let ImbalanceScore::Pairwise(pairs) = &report.score else {
        panic!("expected pairwise score, got {:?}", report.score);
    };
    assert_eq!(pairs.len(), 3);
    assert_eq!(pairs[0].levels, (0.0, 1.0));
    assert!((pairs[0].imbalance - 1.0).abs() < 1e-12);
    assert!((pairs[1].imbalance - 0.5).abs() < 1e-12);
    assert!((report.score.value() - 1.0).abs() < 1e-12);
}

#[test]
fn test_marginal_imbalance() {
    let df = df! {
        "same" => [1.0f64, 2.0, 1.0, 2.0],
        "apart" => [0.0f64, 0.0, 1.0, 1.0],
        "treated" => [0i32, 0, 1, 1],
    }
    .unwrap();
    let params = imbalance_params(&df, "treated", ImbalanceMeasure::L1, &[], 5).unwrap();
    let marginal = univariate_imbalance(&df, "treated", ImbalanceMeasure::L1, &params.bins, &params.ranges).unwrap();

    assert_eq!(marginal.len(), 2);
    assert_eq!(marginal[0].covariate, "same");
    assert!(marginal[0].imbalance.value().abs() < 1e-12);
    assert!((marginal[1].imbalance.value() - 1.0).abs() < 1e-12);

    let err = univariate_imbalance(&df, "treated", ImbalanceMeasure::L1, &[2], &params.ranges).unwrap_err();
    assert!(matches!(err, CemError::Precondition(_)));
}

#[test]
fn test_unknown_measure_not_implemented() {
    let err = "mahalanobis".parse::<ImbalanceMeasure>().unwrap_err();
    assert!(matches!(err, CemError::NotImplemented(_)));
}
