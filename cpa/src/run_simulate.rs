use crate::run_common::*;

use cpa::cpa_module::CpaModule;
use cpa::Likelihood;

use clap::Args;
use log::info;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub model: ModelArgs,
}

/// Simulate perturbed cells, fit a model and report the loss terms on
/// the training cells in evaluation mode
pub fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    let args = &args.model;
    let dev = args.device()?;

    let parameters = candle_nn::VarMap::new();
    let param_builder =
        candle_nn::VarBuilder::from_varmap(&parameters, candle_core::DType::F32, &dev);
    let model = CpaModule::new(args.config()?, param_builder)?;

    let sim = args.simulate(&dev)?;
    let batch = &sim.batch;

    let scores = train_cpa(&model, &parameters, batch, args)?;
    if let (Some(first), Some(last)) = (scores.recon.first(), scores.recon.last()) {
        info!("reconstruction loss: {:.4} -> {:.4}", first, last);
    }

    let (inference, generative) = model.forward(batch, false)?;
    info!(
        "latent {:?}, basal {:?}",
        inference.latent.dims(),
        inference.latent_basal.dims()
    );

    let recon = model.loss(batch, &inference, &generative)?;
    let (adv_loss, adv_penalty) = model.adversarial_loss(batch, &inference, &generative)?;
    info!("reconstruction: {:.4}", recon.to_scalar::<f32>()?);
    info!("adversary: {:.4}", adv_loss.to_scalar::<f32>()?);
    info!("penalty: {:.6}", adv_penalty.to_scalar::<f32>()?);

    if let Some(kl) = model.kl_divergence(&inference)? {
        info!("KL: {:.4}", kl.to_scalar::<f32>()?);
    }

    if args.likelihood == Likelihood::Gaussian {
        let (mean_nd, var_nd) = model.get_expression(batch)?;
        info!(
            "expression {:?}, mean variance {:.4}",
            mean_nd.dims(),
            var_nd.mean_all()?.to_scalar::<f32>()?
        );
    } else {
        info!(
            "mean log dispersion {:.4}",
            model.dispersion().mean_all()?.to_scalar::<f32>()?
        );
    }

    Ok(())
}
