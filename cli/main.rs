#![deny(unused_variables)]
#![deny(dead_code)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use ndarray::Array2;
use std::path::PathBuf;
use std::process;

use mixedlm::data::load_csv;
use mixedlm::{FitOptions, MixedLm, MixedLmParams, MixedLmResults, ProfileOptions};

#[derive(Parser)]
#[command(
    name = "mixedlm",
    about = "Linear mixed-effects models fitted by ML or REML",
    long_about = "Fits linear mixed-effects models to a numeric CSV file with the columns \
                 endog, groups, exog_fe* and optionally exog_re*. Without exog_re* columns \
                 a random intercept is used."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct ModelArgs {
    /// Path to the CSV file
    #[arg(value_name = "DATA")]
    data: PathBuf,

    /// TOML file with fit options; command-line flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximise the likelihood instead of the restricted likelihood
    #[arg(long)]
    ml: bool,

    /// Convergence tolerance for the gradient norm
    #[arg(long)]
    gtol: Option<f64>,

    /// Maximum number of BFGS iterations
    #[arg(long)]
    max_iter: Option<usize>,

    /// Estimate only the variances of the random effects, fixing covariances at zero
    #[arg(long)]
    independent: bool,

    /// Optimise over cov_re directly instead of its Cholesky factor
    #[arg(long)]
    direct: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model and print the estimates
    Fit {
        #[command(flatten)]
        model: ModelArgs,

        /// Write the fit results to this TOML file
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Record every objective evaluation in the results
        #[arg(long)]
        full_output: bool,
    },

    /// Profile the likelihood over the variance of one random effect
    Profile {
        #[command(flatten)]
        model: ModelArgs,

        /// Column of exog_re* whose variance is profiled
        #[arg(long, default_value = "0")]
        re_index: usize,

        #[arg(long, default_value = "5")]
        num_low: usize,

        /// Distance below the estimate, in scaled variance units
        #[arg(long, default_value = "1.0")]
        dist_low: f64,

        #[arg(long, default_value = "5")]
        num_high: usize,

        /// Distance above the estimate, in scaled variance units
        #[arg(long, default_value = "1.0")]
        dist_high: f64,
    },

    /// Print version information
    Version,
}

fn build_model(args: &ModelArgs) -> Result<(MixedLm, FitOptions), Box<dyn std::error::Error>> {
    let data = load_csv(&args.data)?;
    let mut options = match &args.config {
        Some(path) => FitOptions::load(path)?,
        None => FitOptions::default(),
    };
    if args.ml {
        options.reml = false;
    }
    if let Some(gtol) = args.gtol {
        options.gtol = gtol;
    }
    if let Some(max_iter) = args.max_iter {
        options.max_iter = max_iter;
    }
    if args.independent {
        let k_re = data.k_re();
        options.free = Some(MixedLmParams::new(
            ndarray::Array1::ones(data.k_fe()),
            Array2::eye(k_re),
            ndarray::Array1::ones(data.k_vc()),
        ));
    }
    let model = MixedLm::new(data).with_use_sqrt(!args.direct);
    Ok((model, options))
}

fn print_summary(results: &MixedLmResults) {
    println!(
        "Method: {}    Converged: {:?}    Iterations: {}",
        if results.reml() { "REML" } else { "ML" },
        results.status(),
        results.iterations()
    );
    println!("Log-likelihood: {:.6}    Scale: {:.6}", results.llf(), results.scale());
    println!(
        "Evaluations: {} ({} failed)    Dense-fallback groups: {}",
        results.evaluations(),
        results.failed_evaluations(),
        results.n_fallback_groups()
    );
    println!();
    println!("{:>10} {:>14} {:>12} {:>10}", "", "estimate", "std.err", "t");
    let bse = results.bse_fe();
    for (j, beta) in results.fe_params().iter().enumerate() {
        println!(
            "{:>10} {:>14.6} {:>12.6} {:>10.3}",
            format!("fe[{j}]"),
            beta,
            bse[j],
            beta / bse[j]
        );
    }
    let cov_re = results.cov_re();
    for i in 0..cov_re.nrows() {
        for j in 0..=i {
            println!("{:>10} {:>14.6}", format!("re[{i},{j}]"), cov_re[[i, j]]);
        }
    }
    for (j, v) in results.vcomp().iter().enumerate() {
        println!("{:>10} {:>14.6}", format!("vc[{j}]"), v);
    }
}

fn run_fit(
    model: ModelArgs,
    output: Option<PathBuf>,
    full_output: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mixed, mut options) = build_model(&model)?;
    options.full_output |= full_output;
    let results = mixed.fit(&options)?;
    print_summary(&results);
    if let Some(path) = output {
        results.save(&path)?;
        println!("\nResults written to {}", path.display());
    }
    Ok(())
}

fn run_profile(
    model: ModelArgs,
    re_index: usize,
    grid: ProfileOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mixed, options) = build_model(&model)?;
    let results = mixed.fit(&options)?;
    let points = mixed.profile_re(&results, re_index, &grid)?;
    println!("{:>14} {:>16}", "variance", "llf");
    for point in points {
        println!("{:>14.6} {:>16.6}", point.variance, point.llf);
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Fit {
            model,
            output,
            full_output,
        }) => run_fit(model, output, full_output),
        Some(Commands::Profile {
            model,
            re_index,
            num_low,
            dist_low,
            num_high,
            dist_high,
        }) => run_profile(
            model,
            re_index,
            ProfileOptions {
                num_low,
                dist_low,
                num_high,
                dist_high,
                ..ProfileOptions::default()
            },
        ),
        Some(Commands::Version) => {
            println!("mixedlm {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let mut command = Cli::command();
            command.print_help().map_err(Into::into)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
