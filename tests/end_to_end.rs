use brightspot::config::AnalysisConfig;
use brightspot::pipeline::run_analysis;
use brightspot::synthetic::SyntheticTableBuilder;
use std::fs;
use tempfile::tempdir;

fn quick_config(seed: u64) -> AnalysisConfig {
    let mut config = AnalysisConfig::default();
    config.sampler.n_warmup = 300;
    config.sampler.n_samples = 300;
    config.sampler.seed = seed;
    config.sampler.show_progress = false;
    config
}

#[test]
fn synthetic_table_with_missing_cells_runs_to_completion() {
    let tmp = tempdir().expect("temporary directory");
    let builder = SyntheticTableBuilder::new(60)
        .with_missing_fraction(0.1)
        .with_small_territories(4)
        .with_missing_responses(2)
        .with_seed(11);
    let (table, _) = builder.build().expect("synthetic table");

    let mut config = quick_config(5);
    config.output.directory = tmp.path().join("plots");
    let (outputs, written) = run_analysis(&table, &config, None).expect("analysis succeeds");

    assert_eq!(written.len(), 6);
    for suffix in [
        "coefficients.csv",
        "quantiles.csv",
        "forest.toml",
        "map.toml",
        "scatter.toml",
        "manifest.toml",
    ] {
        let path = tmp.path().join("plots").join(format!("catch_quality_{suffix}"));
        assert!(path.exists(), "{} missing", path.display());
    }

    let prepared = &outputs.prepared;
    assert_eq!(prepared.n_rows(), 60);
    assert_eq!(outputs.manifest.rows.dropped_small, 4);
    assert_eq!(outputs.manifest.rows.dropped_missing_response, 2);
    assert_eq!(outputs.manifest.missing_cells, prepared.design.n_latent());
    assert!(prepared.design.n_latent() > 0);
    assert!(prepared.response.iter().all(|&y| y > 0.0 && y <= 1.0));
    assert!(prepared.response.iter().any(|&y| y == 1.0));

    let rows = outputs.coefficients.rows();
    assert_eq!(rows.len(), 10);
    assert_eq!(rows[0].label, "Voice accountability");
    assert_eq!(rows[9].label, "Gender wealth gap");
    for row in rows {
        assert!(row.lower95 <= row.lower50, "{row:?}");
        assert!(row.lower50 <= row.median, "{row:?}");
        assert!(row.median <= row.upper50, "{row:?}");
        assert!(row.upper50 <= row.upper95, "{row:?}");
        assert!((0.0..=1.0).contains(&row.p_positive));
        // At least 97.5% of the draws lie above the lower 95% bound.
        if row.lower95 > 0.0 {
            assert!(row.p_positive >= 0.975, "{row:?}");
        }
        if row.upper95 < 0.0 {
            assert!(row.p_positive <= 0.025, "{row:?}");
        }
        assert!(row.rhat.is_finite());
    }

    let quantiles = &outputs.quantiles;
    assert_eq!(quantiles.rows.len(), 60);
    let missing = prepared.design.missing_per_row();
    for (row, &n_missing) in quantiles.rows.iter().zip(&missing) {
        assert!((0.0..=1.0).contains(&row.quantile));
        assert_eq!(row.n_missing, n_missing);
    }

    assert_eq!(outputs.draws.latent.shape()[2], prepared.design.n_latent());
    assert_eq!(outputs.draws.n_chains(), 2);
    assert_eq!(outputs.draws.n_draws(), 300);
    assert_eq!(outputs.forest.rows.len(), 10);
    assert_eq!(outputs.scatter.y_breaks, vec![0, 2, 4, 6, 8, 10]);

    let manifest_text = fs::read_to_string(
        tmp.path().join("plots").join("catch_quality_manifest.toml"),
    )
    .expect("manifest readable");
    assert!(manifest_text.contains("[sampler]"));
    assert!(manifest_text.contains("n_chains = 2"));
}

#[test]
fn identical_seeds_give_identical_outputs() {
    let (table, _) = SyntheticTableBuilder::new(30)
        .with_predictors(3)
        .with_seed(12)
        .build()
        .expect("synthetic table");
    let tmp = tempdir().expect("temporary directory");
    let mut config = quick_config(77);
    config.data = SyntheticTableBuilder::new(30).with_predictors(3).data_config();
    config.sampler.n_warmup = 150;
    config.sampler.n_samples = 100;

    config.output.directory = tmp.path().join("a");
    let (first, _) = run_analysis(&table, &config, None).expect("first run");
    config.output.directory = tmp.path().join("b");
    let (second, _) = run_analysis(&table, &config, None).expect("second run");

    assert_eq!(first.draws.beta, second.draws.beta);
    assert_eq!(first.quantiles.quantiles(), second.quantiles.quantiles());
    let read = |dir: &str| {
        fs::read_to_string(tmp.path().join(dir).join("catch_quality_coefficients.csv"))
            .expect("coefficients readable")
    };
    assert_eq!(read("a"), read("b"));
}
