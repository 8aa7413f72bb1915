mod run_common;
mod run_dose_response;
mod run_simulate;

use run_dose_response::*;
use run_simulate::*;

use clap::{Parser, Subcommand};
use log::info;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "CPA",
    long_about = "Compositional Perturbation Autoencoder\n\
		  Disentangles basal cell states from drug dose and covariate effects\n\
		  and predicts expression under unseen combinations."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Fit a model on simulated cells and report the loss terms",
        long_about = "Simulate perturbed single cells in three stages:\n\
		      (1) Draw covariate levels, drugs and doses\n\
		      (2) Draw counts from dose-dependent fold changes\n\
		      (3) Fit the autoencoder against the adversaries.\n"
    )]
    Simulate(SimulateArgs),

    #[command(
        about = "Sweep the dose of one drug and write decoded expression",
        long_about = "Fit a model on simulated cells, then predict every cell\n\
		      under a grid of doses of one drug while keeping\n\
		      the basal states and covariates fixed.\n"
    )]
    DoseResponse(DoseResponseArgs),
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.commands {
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
        Commands::DoseResponse(args) => {
            run_dose_response(args)?;
        }
    }

    info!("Done");
    Ok(())
}
