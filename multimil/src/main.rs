mod fit_multimil;
mod multimil_input;
mod routines_inference;

use clap::{Parser, Subcommand};
use fit_multimil::*;
use routines_inference::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "MULTIMIL",
    long_about = "Multi-modal variational autoencoder with multiple-instance learning\n\
		  Feature matrices and cell annotations are read from TSV or TSV.GZ files."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Train a model",
        long_about = "Train a multi-modal VAE, with a MIL head when any of\n\
		      --class-keys, --ord-keys or --regression-keys is given.\n\
		      Saves parameters, configuration, history and latent states.\n"
    )]
    Train(TrainArgs),

    /// latent representation of every cell with a saved model
    Latent(LatentArgs),

    #[command(
        about = "Impute a target modality",
        long_about = "Translate the other modalities of every cell into the target\n\
		      modality and report provenance (bag, barcode, cell type).\n"
    )]
    Impute(ImputeArgs),

    /// per-bag predictions of a saved MIL model
    Predict(PredictArgs),

    /// print the loss history of a saved model
    History(HistoryArgs),

    /// simulate a small two-modality data set with labelled bags
    Simulate(SimArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Train(args) => {
            fit_multimil(args)?;
        }
        Commands::Latent(args) => {
            run_latent(args)?;
        }
        Commands::Impute(args) => {
            run_impute(args)?;
        }
        Commands::Predict(args) => {
            run_predict(args)?;
        }
        Commands::History(args) => {
            run_history(args)?;
        }
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
    }

    Ok(())
}
