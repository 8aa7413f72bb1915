use crate::cpa_batch::CellBatch;
use crate::cpa_config::{CovariateVocab, Likelihood};

use candle_core::{Device, Result, Tensor};
use log::info;
use rand::SeedableRng;
use rand_distr::{Bernoulli, Distribution, Gamma, Normal, Poisson, Uniform};

pub struct SimArgs {
    pub n_cells: usize,
    pub n_genes: usize,
    pub n_drugs: usize,
    pub covariates: CovariateVocab,
    /// probability that a cell receives no drug at all
    pub control_fraction: f64,
    /// doses of treated cells are drawn from [0.1, max_dose]
    pub max_dose: f32,
    /// expected total count per cell
    pub depth: f32,
    pub rseed: u64,
}

pub struct SimOut {
    pub batch: CellBatch,
    /// true log fold change per drug at saturating dose (drugs x genes)
    pub ln_drug_effect_dg: Tensor,
}

fn sim_err<E: std::fmt::Display>(e: E) -> candle_core::Error {
    candle_core::Error::Msg(format!("simulation: {}", e))
}

/// Simulate a batch of perturbed cells
///
/// ```text
/// Y(j,g) ~ Poisson( depth * rho(g) * exp( eta(j,g) ) )
/// eta(j,g) = sum_c gamma(c, L(j,c), g) + sum_d h(D(j,d)) * tau(d,g)
/// h(x) = x / (1 + x)
/// ```
///
/// Each treated cell receives exactly one drug. Under the Gaussian
/// likelihood `X` holds `log1p(Y)`, otherwise the raw counts.
pub fn simulate_cells(args: &SimArgs, likelihood: Likelihood, device: &Device) -> Result<SimOut> {
    let nn = args.n_cells;
    let gg = args.n_genes;
    let dd = args.n_drugs;

    if gg == 0 || dd == 0 {
        candle_core::bail!("need at least one gene and one drug");
    }
    if args.max_dose.is_nan() || args.max_dose < 0.1 || args.depth.is_nan() || args.depth <= 0. {
        candle_core::bail!(
            "need max dose >= 0.1 and positive depth: {}, {}",
            args.max_dose,
            args.depth
        );
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(args.rseed);

    // 1. baseline gene frequencies
    let rgamma = Gamma::new(1_f32, 1_f32).map_err(sim_err)?;
    let mut rho_g: Vec<f32> = (0..gg).map(|_| rgamma.sample(&mut rng)).collect();
    let tot: f32 = rho_g.iter().sum();
    rho_g.iter_mut().for_each(|x| *x /= tot);

    // 2. drug and covariate effects
    let rnorm = Normal::new(0_f32, 1_f32).map_err(sim_err)?;
    let tau_dg: Vec<f32> = (0..(dd * gg)).map(|_| rnorm.sample(&mut rng)).collect();

    let rnorm_cov = Normal::new(0_f32, 0.5_f32).map_err(sim_err)?;
    let gamma: Vec<Vec<f32>> = args
        .covariates
        .iter()
        .map(|(_, n_levels)| (0..(n_levels * gg)).map(|_| rnorm_cov.sample(&mut rng)).collect())
        .collect();

    // 3. cell-level design
    let is_control = Bernoulli::new(args.control_fraction.clamp(0., 1.)).map_err(sim_err)?;
    let rdrug = Uniform::new(0, dd).map_err(sim_err)?;
    let rdose = Uniform::new_inclusive(0.1_f32, args.max_dose).map_err(sim_err)?;

    let mut doses_nd = vec![0_f32; nn * dd];
    for j in 0..nn {
        if !is_control.sample(&mut rng) {
            let d = rdrug.sample(&mut rng);
            doses_nd[j * dd + d] = rdose.sample(&mut rng);
        }
    }

    let mut levels: Vec<Vec<u32>> = vec![];
    for (_, n_levels) in args.covariates.iter() {
        let rlevel = Uniform::new(0, n_levels).map_err(sim_err)?;
        levels.push((0..nn).map(|_| rlevel.sample(&mut rng) as u32).collect());
    }

    // 4. putting them all together
    let mut x_ng = Vec::with_capacity(nn * gg);
    for j in 0..nn {
        for g in 0..gg {
            let mut ln_fold = 0_f32;
            for (c, levels_n) in levels.iter().enumerate() {
                ln_fold += gamma[c][levels_n[j] as usize * gg + g];
            }
            for d in 0..dd {
                let dose = doses_nd[j * dd + d];
                if dose > 0. {
                    ln_fold += dose / (1. + dose) * tau_dg[d * gg + g];
                }
            }
            let lambda = (args.depth * rho_g[g] * ln_fold.exp()).max(1e-8);
            let y = Poisson::new(lambda).map_err(sim_err)?.sample(&mut rng);
            x_ng.push(match likelihood {
                Likelihood::Gaussian => y.ln_1p(),
                Likelihood::NegativeBinomial => y,
            });
        }
    }

    let mut batch = CellBatch::new(
        Tensor::from_vec(x_ng, (nn, gg), device)?,
        Tensor::from_vec(doses_nd, (nn, dd), device)?,
    );
    for ((name, _), levels_n) in args.covariates.iter().zip(levels) {
        batch.insert(name, Tensor::from_vec(levels_n, nn, device)?);
    }

    info!(
        "simulated {} cells x {} genes, {} drugs, {} covariates",
        nn,
        gg,
        dd,
        args.covariates.len()
    );

    Ok(SimOut {
        batch,
        ln_drug_effect_dg: Tensor::from_vec(tau_dg, (dd, gg), device)?,
    })
}
