//! Equivalent model specifications must produce the same fit.

mod common;

use approx::assert_relative_eq;
use mixedlm::{FitOptions, MixedLm, MixedLmParams, ObservationSet, VarianceComponentDesign};
use ndarray::{Array1, Array2, array};

#[test]
fn default_random_intercept_equals_an_explicit_column_of_ones() {
    let sim = common::random_slopes(3, 100, 3, 4, 1);
    let implicit = ObservationSet::builder(sim.endog.clone(), sim.exog.clone(), &sim.groups)
        .build()
        .unwrap();
    let explicit = sim.with_exog_re();
    assert_eq!(implicit.exog_re(), explicit.exog_re());

    let options = FitOptions::default();
    let a = MixedLm::new(implicit).fit(&options).unwrap();
    let b = MixedLm::new(explicit).fit(&options).unwrap();

    for (x, y) in a.fe_params().iter().zip(b.fe_params()) {
        assert!((x - y).abs() < 1e-8);
    }
    assert!((a.cov_re()[[0, 0]] - b.cov_re()[[0, 0]]).abs() < 1e-8);
    assert!((a.scale() - b.scale()).abs() < 1e-8);
    assert!((a.llf() - b.llf()).abs() < 1e-8);
}

#[test]
fn independent_random_effects_equal_two_variance_components() {
    let sim = common::random_slopes(5, 100, 4, 2, 2);
    let options = FitOptions::default();

    // Only the variances are estimated; the covariance stays at its zero start.
    let diagonal = FitOptions {
        free: Some(MixedLmParams::new(
            Array1::ones(2),
            Array2::eye(2),
            Array1::zeros(0),
        )),
        ..options.clone()
    };
    let full = MixedLm::new(sim.with_exog_re()).fit(&diagonal).unwrap();
    let components = MixedLm::new(sim.as_variance_components()).fit(&options).unwrap();

    for (x, y) in full.fe_params().iter().zip(components.fe_params()) {
        assert!((x - y).abs() < 1e-4, "fe {x} vs {y}");
    }
    assert_eq!(full.cov_re()[[1, 0]], 0.0);

    let vcomp = components.vcomp();
    for j in 0..2 {
        let expected = full.cov_re()[[j, j]];
        assert!(
            (vcomp[j] - expected).abs() < 1e-2
                || (vcomp[j] - expected).abs() < 1e-4 * expected.abs(),
            "vcomp[{j}] = {} vs cov_re = {expected}",
            vcomp[j]
        );
    }

    // [fe0, fe1, cov00, cov10, cov11] against [fe0, fe1, vc_a, vc_b].
    let bse_full = full.bse();
    let bse_vc = components.bse();
    for (i, j) in [(0, 0), (1, 1), (2, 2), (4, 3)] {
        let (x, y) = (bse_full[i], bse_vc[j]);
        assert!(
            (x - y).abs() < 1e-1 || (x - y).abs() < 1e-2 * y.abs(),
            "bse {x} vs {y}"
        );
    }
    assert_eq!(bse_full[3], 0.0);
}

#[test]
fn nested_variance_component_with_several_columns_fits() {
    let sim = common::random_slopes(9, 40, 6, 2, 1);
    // Two subgroups of three rows inside every group.
    let subgroups: VarianceComponentDesign = (0..40)
        .map(|g| {
            let block = Array2::from_shape_fn((6, 2), |(i, j)| if i / 3 == j { 1.0 } else { 0.0 });
            (g.to_string(), block)
        })
        .collect();
    let data = ObservationSet::builder(sim.endog.clone(), sim.exog.clone(), &sim.groups)
        .exog_re(sim.exog_re.clone())
        .variance_component("subgroup", subgroups)
        .build()
        .unwrap();
    assert_eq!((data.k_re(), data.k_vc()), (1, 1));

    let results = MixedLm::new(data).fit(&FitOptions::default()).unwrap();
    assert!(results.llf().is_finite());
    assert!(results.vcomp()[0] >= 0.0);
    assert!(results.cov_re()[[0, 0]] >= 0.0);
    for effects in results.random_effects() {
        assert_eq!(effects.mean.len(), 3);
        assert_eq!(effects.cov.dim(), (3, 3));
    }
}

#[test]
fn direct_and_cholesky_parametrizations_agree() {
    let sim = common::random_slopes(17, 80, 5, 2, 2);
    let options = FitOptions::default();
    let sqrt = MixedLm::new(sim.with_exog_re()).fit(&options).unwrap();
    let direct = MixedLm::new(sim.with_exog_re())
        .with_use_sqrt(false)
        .fit(&options)
        .unwrap();

    assert_relative_eq!(sqrt.llf(), direct.llf(), epsilon = 1e-6, max_relative = 1e-8);
    for (x, y) in sqrt.fe_params().iter().zip(direct.fe_params()) {
        assert!((x - y).abs() < 1e-4);
    }
    let diff = sqrt.cov_re() - direct.cov_re();
    assert!(diff.iter().all(|d| d.abs() < 1e-3), "cov_re differs by {diff}");
}

#[test]
fn variance_component_groups_missing_from_the_data_are_rejected() {
    let endog = array![1.0, 2.0, 3.0, 4.0];
    let exog = Array2::ones((4, 1));
    let mut blocks = VarianceComponentDesign::default();
    blocks.insert("a".to_string(), Array2::ones((2, 1)));
    blocks.insert("z".to_string(), Array2::ones((2, 1)));
    let built = ObservationSet::builder(endog, exog, &["a", "a", "b", "b"])
        .variance_component("v", blocks)
        .build();
    assert!(matches!(
        built,
        Err(mixedlm::EstimationError::UnknownGroup { .. })
    ));
}
