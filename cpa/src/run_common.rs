use cpa::cpa_module::*;
use cpa::simulate::*;
use cpa::{CellBatch, CovariateVocab, CpaConfig, DoserType, Likelihood};

use candle_core::Device;
use candle_nn::{AdamW, Optimizer};
use candle_util::candle_aux_layers::NormKind;
use clap::{Args, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Args, Debug)]
pub struct ModelArgs {
    #[arg(long, default_value_t = 500, help = "Number of simulated cells")]
    pub cells: usize,

    #[arg(long, default_value_t = 200, help = "Number of genes")]
    pub genes: usize,

    #[arg(long, default_value_t = 3, help = "Number of drugs")]
    pub drugs: usize,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "batch:2,cell_type:3",
        help = "Covariates as name:levels",
        long_help = "Comma-separated covariate vocabulary.\n\
		     Each entry is `name:levels`, e.g., `batch:2,cell_type:3`.\n\
		     Give an empty string for no covariates."
    )]
    pub covariates: Vec<Box<str>>,

    #[arg(long, default_value_t = 0.3, help = "Fraction of control cells")]
    pub control_fraction: f64,

    #[arg(long, default_value_t = 10., help = "Maximum simulated dose")]
    pub max_dose: f32,

    #[arg(long, default_value_t = 5000., help = "Expected counts per cell")]
    pub depth: f32,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    pub rseed: u64,

    #[arg(long, short = 'k', default_value_t = 32, help = "Latent dimension")]
    pub latent: usize,

    #[arg(
        long,
        value_enum,
        default_value = "gauss",
        help = "Observation model",
        long_help = "Observation model of the decoder.\n\
		     gauss: log1p expression with per-gene mean and variance\n\
		     nb: raw counts with a negative binomial and library size"
    )]
    pub likelihood: Likelihood,

    #[arg(long, value_enum, default_value = "linear", help = "Dose-response curve")]
    pub doser: DoserType,

    #[arg(long, default_value_t = 128, help = "Autoencoder hidden width")]
    pub ae_width: usize,

    #[arg(long, default_value_t = 2, help = "Autoencoder depth")]
    pub ae_depth: usize,

    #[arg(long, default_value_t = 64, help = "Adversary hidden width")]
    pub adv_width: usize,

    #[arg(long, default_value_t = 2, help = "Adversary depth")]
    pub adv_depth: usize,

    #[arg(long, value_enum, default_value = "batch", help = "Hidden layer normalization")]
    pub norm: NormKind,

    #[arg(long, default_value_t = 0., help = "Dropout rate")]
    pub dropout: f64,

    #[arg(long, default_value_t = false, help = "Variational basal encoder")]
    pub variational: bool,

    #[arg(long, default_value_t = 100, help = "Training epochs (full batch)")]
    pub epochs: usize,

    #[arg(long, default_value_t = 1e-3, help = "Learning rate")]
    pub learning_rate: f64,

    #[arg(
        long,
        default_value_t = 3,
        help = "Adversary update interval",
        long_help = "Every `adversary_steps`-th epoch updates the adversaries;\n\
		     the other epochs update the autoencoder. At least 2."
    )]
    pub adversary_steps: usize,

    #[arg(long, default_value_t = 1., help = "Weight of the adversarial term")]
    pub adversary_weight: f64,

    #[arg(long, default_value_t = 1., help = "Weight of the gradient penalty")]
    pub penalty_weight: f64,

    #[arg(long, default_value_t = 1e-2, help = "Weight of the KL term")]
    pub kl_weight: f64,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    pub device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "A device for cuda or metal")]
    pub device_no: usize,

    #[arg(long, short, help = "Verbosity")]
    pub verbose: bool,
}

impl ModelArgs {
    pub fn device(&self) -> anyhow::Result<Device> {
        Ok(match self.device {
            ComputeDevice::Metal => Device::new_metal(self.device_no)?,
            ComputeDevice::Cuda => Device::new_cuda(self.device_no)?,
            _ => Device::Cpu,
        })
    }

    pub fn vocab(&self) -> anyhow::Result<CovariateVocab> {
        let mut vocab = CovariateVocab::new();
        for entry in self.covariates.iter().filter(|s| !s.is_empty()) {
            let (name, levels) = entry
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("expected `name:levels`, got `{}`", entry))?;
            vocab.insert(name, levels.parse()?)?;
        }
        Ok(vocab)
    }

    pub fn config(&self) -> anyhow::Result<CpaConfig> {
        let mut config = CpaConfig::new(self.genes, self.drugs, self.vocab()?);
        config.n_latent = self.latent;
        config.likelihood = self.likelihood;
        config.doser = self.doser;
        config.autoencoder_width = self.ae_width;
        config.autoencoder_depth = self.ae_depth;
        config.adversary_width = self.adv_width;
        config.adversary_depth = self.adv_depth;
        config.norm = self.norm;
        config.dropout = self.dropout;
        config.variational = self.variational;
        Ok(config)
    }

    pub fn simulate(&self, dev: &Device) -> anyhow::Result<SimOut> {
        let sim_args = SimArgs {
            n_cells: self.cells,
            n_genes: self.genes,
            n_drugs: self.drugs,
            covariates: self.vocab()?,
            control_fraction: self.control_fraction,
            max_dose: self.max_dose,
            depth: self.depth,
            rseed: self.rseed,
        };
        Ok(simulate_cells(&sim_args, self.likelihood, dev)?)
    }
}

pub struct TrainScores {
    pub recon: Vec<f32>,
    pub adversary: Vec<f32>,
}

/// Alternate between the autoencoder and the adversaries on one batch
///
/// * autoencoder: recon - w_adv * adv_loss (+ w_kl * kl)
/// * adversary: adv_loss + w_pen * penalty
pub fn train_cpa(
    model: &CpaModule,
    parameters: &candle_nn::VarMap,
    batch: &CellBatch,
    args: &ModelArgs,
) -> anyhow::Result<TrainScores> {
    let groups = parameter_groups(parameters)?;
    info!(
        "{} autoencoder and {} adversary variables",
        groups.autoencoder.len(),
        groups.adversary.len()
    );

    let mut adam_ae = AdamW::new_lr(groups.autoencoder, args.learning_rate)?;
    let mut adam_adv = AdamW::new_lr(groups.adversary, args.learning_rate)?;

    let pb = ProgressBar::new(args.epochs as u64);
    if args.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    anyhow::ensure!(
        args.adversary_steps >= 2,
        "adversary steps must be at least 2, got {}",
        args.adversary_steps
    );
    let adversary_steps = args.adversary_steps;
    let mut recon_trace = Vec::with_capacity(args.epochs);
    let mut adv_trace = Vec::with_capacity(args.epochs);

    info!("Start training CPA...");

    for epoch in 0..args.epochs {
        let (inference, generative) = model.forward(batch, true)?;
        let recon = model.loss(batch, &inference, &generative)?;
        let (adv_loss, adv_penalty) = model.adversarial_loss(batch, &inference, &generative)?;

        recon_trace.push(recon.to_scalar::<f32>()?);
        adv_trace.push(adv_loss.to_scalar::<f32>()?);

        if epoch % adversary_steps == adversary_steps - 1 {
            let loss = (&adv_loss + (&adv_penalty * args.penalty_weight)?)?;
            adam_adv.backward_step(&loss)?;
        } else {
            let mut loss = (&recon - (&adv_loss * args.adversary_weight)?)?;
            if let Some(kl) = model.kl_divergence(&inference)? {
                loss = (loss + (kl * args.kl_weight)?)?;
            }
            adam_ae.backward_step(&loss)?;
        }

        pb.inc(1);

        if args.verbose {
            info!(
                "[{}] recon {:.4} adversary {:.4} penalty {:.4}",
                epoch,
                recon.to_scalar::<f32>()?,
                adv_loss.to_scalar::<f32>()?,
                adv_penalty.to_scalar::<f32>()?
            );
        }
    }
    pb.finish_and_clear();

    info!("done model training");
    Ok(TrainScores {
        recon: recon_trace,
        adversary: adv_trace,
    })
}
