//! Fit bookkeeping: iteration history, profile likelihoods, persistence and
//! the command-line front end.

mod common;

use mixedlm::{EstimationError, FitOptions, MixedLm, MixedLmResults, ProfileOptions};
use std::fs;
use std::process::Command;
use tempfile::tempdir;

fn model() -> MixedLm {
    MixedLm::new(common::random_slopes(41, 40, 5, 2, 2).with_exog_re())
}

#[test]
fn full_output_logs_every_evaluation() {
    let model = model();
    let quiet = model.fit(&FitOptions::default()).unwrap();
    assert!(quiet.history().is_none());

    let results = model
        .fit(&FitOptions {
            full_output: true,
            ..FitOptions::default()
        })
        .unwrap();
    let history = results.history().unwrap();
    assert!(!history.is_empty());
    for (i, record) in history.iter().enumerate() {
        assert_eq!(record.evaluation, i + 1);
        assert_eq!(record.params.len(), model.layout(false).len());
        match &record.failure {
            None => assert!(record.llf.is_finite()),
            Some(reason) => assert!(record.llf.is_nan(), "failed evaluation: {reason}"),
        }
    }
    assert_eq!(history.len(), results.evaluations());
    let failed = history.iter().filter(|r| r.failure.is_some()).count();
    assert_eq!(failed, results.failed_evaluations());
    assert!((quiet.llf() - results.llf()).abs() < 1e-10);
}

#[test]
fn profile_is_centred_on_the_estimate() {
    let model = model();
    let results = model.fit(&FitOptions::default()).unwrap();
    assert!(results.gradient_norm() < 1e-4);

    for re_ix in [0, 1] {
        let estimate = results.cov_re()[[re_ix, re_ix]];
        let options = ProfileOptions {
            num_low: 2,
            dist_low: 0.5 * estimate,
            num_high: 2,
            dist_high: 0.5 * estimate,
            ..ProfileOptions::default()
        };
        let points = model.profile_re(&results, re_ix, &options).unwrap();
        assert_eq!(points.len(), 5);

        let centre = points[2];
        assert!((centre.variance - estimate).abs() < 1e-4 * estimate.max(1.0));
        assert!((centre.llf - results.llf()).abs() < 1e-4);
        for pair in points.windows(2) {
            assert!(pair[0].variance < pair[1].variance);
        }
        for point in &points {
            assert!(point.llf <= centre.llf + 1e-6, "{point:?} above {centre:?}");
        }
    }
}

#[test]
fn profile_range_must_stay_positive() {
    let model = model();
    let results = model.fit(&FitOptions::default()).unwrap();
    let options = ProfileOptions {
        dist_low: 10.0 * results.cov_re()[[0, 0]],
        ..ProfileOptions::default()
    };
    assert!(matches!(
        model.profile_re(&results, 0, &options),
        Err(EstimationError::InvalidProfileRange { .. })
    ));
    assert!(matches!(
        model.profile_re(&results, 2, &ProfileOptions::default()),
        Err(EstimationError::DimensionMismatch { .. })
    ));
}

#[test]
fn results_round_trip_through_toml() {
    let model = model();
    let results = model
        .fit(&FitOptions {
            full_output: true,
            ..FitOptions::default()
        })
        .unwrap();
    let dir = tempdir().unwrap();
    let path = dir.path().join("fit.toml");
    results.save(&path).unwrap();
    let loaded = MixedLmResults::load(&path).unwrap();

    assert_eq!(loaded.fe_params(), results.fe_params());
    assert_eq!(loaded.cov_re(), results.cov_re());
    assert_eq!(loaded.scale(), results.scale());
    assert_eq!(loaded.llf(), results.llf());
    assert_eq!(loaded.cov_params(), results.cov_params());
    assert_eq!(loaded.status(), results.status());
    assert_eq!(loaded.evaluations(), results.evaluations());
    assert_eq!(loaded.n_fallback_groups(), results.n_fallback_groups());
    assert_eq!(loaded.history().map(<[_]>::len), results.history().map(<[_]>::len));
    assert_eq!(loaded.random_effects().len(), results.random_effects().len());
    assert_eq!(loaded.bse(), results.bse());
}

#[test]
fn fit_options_load_from_a_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("options.toml");
    fs::write(
        &path,
        "reml = false\nmax_iter = 50\n\n[cov_penalty]\npenalty = { type = \"psd\" }\nweight = 2.0\n",
    )
    .unwrap();
    let options = FitOptions::load(&path).unwrap();
    assert!(!options.reml);
    assert_eq!(options.max_iter, 50);
    assert_eq!(options.cov_penalty, Some(mixedlm::PenaltySpec::psd(2.0)));
}

#[test]
fn cli_fits_a_csv_file_and_writes_results() {
    let sim = common::random_slopes(53, 20, 5, 2, 1);
    let dir = tempdir().unwrap();
    let data_path = dir.path().join("data.csv");
    let mut csv = String::from("endog,groups,exog_fe0,exog_fe1\n");
    for row in 0..sim.endog.len() {
        csv.push_str(&format!(
            "{},{},{},{}\n",
            sim.endog[row], sim.groups[row], sim.exog[[row, 0]], sim.exog[[row, 1]]
        ));
    }
    fs::write(&data_path, csv).unwrap();
    let output = dir.path().join("fit.toml");

    let status = Command::new(env!("CARGO_BIN_EXE_mixedlm"))
        .args([
            "fit",
            data_path.to_str().unwrap(),
            "--ml",
            "--output",
            output.to_str().unwrap(),
        ])
        .status()
        .unwrap();
    assert!(status.success(), "CLI exited with status {status:?}");

    let saved = MixedLmResults::load(&output).unwrap();
    assert!(!saved.reml());
    assert_eq!(saved.fe_params().len(), 2);
    assert_eq!(saved.cov_re().dim(), (1, 1));
}
