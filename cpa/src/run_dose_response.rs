use crate::run_common::*;

use cpa::cpa_module::{Counterfactual, CpaModule};

use candle_core::{DType, Tensor};
use clap::Args;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use std::io::{BufWriter, Write};

#[derive(Args, Debug)]
pub struct DoseResponseArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    #[arg(long, default_value_t = 0, help = "Index of the drug to sweep")]
    pub drug: usize,

    #[arg(long, default_value_t = 20, help = "Number of grid points")]
    pub grid: usize,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header.\n\
		     Writes `{out}.dose_response.tsv` with one row per dose:\n\
		     dose, dose response, then the mean decoded expression of each gene."
    )]
    pub out: Box<str>,
}

/// Fit on simulated cells, then decode every cell under a grid of doses
/// of one drug, keeping the basal states and covariates
pub fn run_dose_response(args: &DoseResponseArgs) -> anyhow::Result<()> {
    let margs = &args.model;
    if args.drug >= margs.drugs {
        anyhow::bail!("drug {} out of {} drugs", args.drug, margs.drugs);
    }
    if args.grid < 2 {
        anyhow::bail!("need at least two grid points");
    }

    let dev = margs.device()?;
    let parameters = candle_nn::VarMap::new();
    let param_builder = candle_nn::VarBuilder::from_varmap(&parameters, DType::F32, &dev);
    let model = CpaModule::new(margs.config()?, param_builder)?;

    let sim = margs.simulate(&dev)?;
    train_cpa(&model, &parameters, &sim.batch, margs)?;

    let n_cells = sim.batch.num_cells()?;
    let n_drugs = margs.drugs;
    let doses: Vec<f32> = (0..args.grid)
        .map(|i| margs.max_dose * i as f32 / (args.grid - 1) as f32)
        .collect();

    let pb = ProgressBar::new(doses.len() as u64);
    if margs.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut rows = Vec::with_capacity(doses.len());
    for &dose in doses.iter() {
        let mut dose_row = vec![0f32; n_drugs];
        dose_row[args.drug] = dose;

        let doses_1d = Tensor::from_vec(dose_row, (1, n_drugs), &dev)?;
        let response = model
            .dose_response(&doses_1d)?
            .narrow(1, args.drug, 1)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let counterfactual = Counterfactual {
            doses_nd: Some(doses_1d.repeat((n_cells, 1))?),
            ..Default::default()
        };
        let recon = model.predict_counterfactual(&sim.batch, &counterfactual)?;
        let mean_g = recon.mean().mean(0)?.to_vec1::<f32>()?;

        rows.push((dose, response[0], mean_g));
        pb.inc(1);
    }
    pb.finish_and_clear();

    let out_file = format!("{}.dose_response.tsv", args.out);
    let mut writer = BufWriter::new(std::fs::File::create(&out_file)?);

    let header: Vec<String> = ["dose".to_string(), "response".to_string()]
        .into_iter()
        .chain((0..margs.genes).map(|g| format!("gene_{}", g)))
        .collect();
    writeln!(writer, "{}", header.join("\t"))?;

    for (dose, response, mean_g) in rows {
        let fields: Vec<String> = [dose, response]
            .into_iter()
            .chain(mean_g)
            .map(|x| x.to_string())
            .collect();
        writeln!(writer, "{}", fields.join("\t"))?;
    }
    writer.flush()?;

    info!("wrote {}", out_file);
    Ok(())
}
