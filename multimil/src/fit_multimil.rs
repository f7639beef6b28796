use crate::multimil_input::*;

use clap::Args;
use log::info;
use multimil::config::*;
use multimil::io::write_named_matrix;
use multimil::{MultiMil, TrainConfig};
use std::str::FromStr;

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[arg(
        long,
        short,
        required = true,
        help = "Output directory",
        long_help = "Output directory for:\n\
		     - last-model.safetensors\n\
		     - config.json\n\
		     - history.csv\n\
		     - latent.tsv.gz\n"
    )]
    out: Box<str>,

    #[arg(
        long,
        value_delimiter(','),
        help = "Loss family of every modality (mse, bce, nb, zinb)"
    )]
    losses: Vec<Box<str>>,

    #[arg(
        long,
        value_delimiter(','),
        help = "Output activation of every modality (linear, leakyrelu, relu, sigmoid)"
    )]
    output_activations: Vec<Box<str>>,

    #[arg(long, value_delimiter(','), help = "Hidden layers of every modality encoder")]
    hiddens: Vec<usize>,

    #[arg(long, value_delimiter(','), help = "Hidden layers of the shared decoder")]
    shared_hiddens: Vec<usize>,

    #[arg(long, default_value_t = 16, help = "Latent dimension")]
    z_dim: usize,

    #[arg(long, default_value_t = 32, help = "Shared decoder output dimension")]
    h_dim: usize,

    #[arg(long, default_value_t = 16, help = "Covariate embedding dimension")]
    cond_dim: usize,

    #[arg(long, default_value_t = 0.2)]
    dropout: f32,

    #[arg(long, default_value = "layer", help = "Normalization (layer, batch, none)")]
    normalization: Box<str>,

    #[arg(long, default_value_t = false, help = "Condition encoders on covariates")]
    condition_encoders: bool,

    #[arg(long, default_value_t = false, help = "Do not condition decoders on covariates")]
    no_condition_decoders: bool,

    #[arg(long, default_value_t = false, help = "Skip the shared decoder")]
    no_shared_decoder: bool,

    #[arg(long, default_value = "gaussian", help = "Kernel (gaussian, moment-matching)")]
    kernel_type: Box<str>,

    #[arg(long, default_value = "latent", help = "MMD mode (latent, marginal, both)")]
    mmd: Box<str>,

    #[arg(
        long,
        value_delimiter(','),
        help = "Loss coefficient overrides",
        long_help = "Loss coefficient overrides as name=value pairs.\n\
		     Names: recon, kl, integ, cycle, nb, zinb, mse, bce\n\
		     Example: kl=1e-5,integ=1"
    )]
    loss_coefs: Vec<Box<str>>,

    #[arg(long, help = "Categorical covariate defining integration groups")]
    integrate_on: Option<Box<str>>,

    #[arg(long, default_value = "logsigm", help = "Continuous covariate embedding")]
    cont_cov_type: Box<str>,

    #[arg(long, value_delimiter(','), help = "Categorical covariates to classify")]
    class_keys: Vec<Box<str>>,

    #[arg(long, value_delimiter(','), help = "Categorical covariates as ordinal targets")]
    ord_keys: Vec<Box<str>>,

    #[arg(long, value_delimiter(','), help = "Continuous covariates to regress")]
    regression_keys: Vec<Box<str>>,

    #[arg(long, help = "Categorical covariate holding the patient identity")]
    patient_key: Option<Box<str>>,

    #[arg(long, default_value = "gated_attn", help = "Bag scoring (sum, attn, gated_attn, mlp)")]
    scoring: Box<str>,

    #[arg(long, default_value_t = 16)]
    attn_dim: usize,

    #[arg(long, default_value_t = 128, help = "Cells per bag slice")]
    patient_batch_size: usize,

    #[arg(long, default_value_t = 1.0)]
    class_loss_coef: f64,

    #[arg(long, default_value_t = 1.0)]
    regression_loss_coef: f64,

    #[arg(long, default_value_t = 1.0, help = "Orthogonality penalty coefficient")]
    reg_coef: f64,

    #[arg(long, default_value_t = false)]
    flat_attn: bool,

    #[arg(long, default_value_t = false)]
    regularize_cell_attn: bool,

    #[arg(long, default_value_t = false)]
    regularize_cov_attn: bool,

    #[arg(long, default_value_t = false)]
    regularize_vae: bool,

    #[arg(long, default_value_t = 200)]
    epochs: usize,

    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f32,

    #[arg(long, default_value_t = 1e-3)]
    weight_decay: f32,

    #[arg(long, default_value_t = 256, help = "Cells per minibatch without MIL")]
    batch_size: usize,

    #[arg(long, default_value_t = 1, help = "Bag slices per minibatch")]
    bags_per_batch: usize,

    #[arg(long, default_value_t = 0.1, help = "Fraction of bags for validation")]
    validation_split: f32,

    #[arg(long, default_value_t = false)]
    early_stopping: bool,

    #[arg(long, default_value_t = 5)]
    patience: usize,

    #[arg(long, help = "KL warmup epochs")]
    kl_warmup: Option<usize>,

    #[arg(long, value_enum, default_value = "cpu")]
    device: ComputeDevice,

    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

fn column_indices(
    keys: &[Box<str>],
    lookup: impl Fn(&str) -> Option<usize>,
) -> anyhow::Result<Vec<usize>> {
    keys.iter()
        .map(|k| lookup(k).ok_or_else(|| anyhow::anyhow!("unknown covariate `{}`", k)))
        .collect()
}

pub fn fit_multimil(args: &TrainArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let data = read_multimodal_data(&args.data)?;

    let mut vae = VaeConfig::new(args.data.modality_lengths.clone());
    vae.modality_names = data.modality_names.clone();
    vae.losses = args
        .losses
        .iter()
        .map(|s| LossFamily::from_str(s))
        .collect::<Result<_, _>>()?;
    vae.output_activations = args
        .output_activations
        .iter()
        .map(|s| OutputActivation::from_str(s))
        .collect::<Result<_, _>>()?;
    vae.hiddens = vec![args.hiddens.clone(); vae.n_modality()];
    vae.shared_hiddens = args.shared_hiddens.clone();
    vae.z_dim = args.z_dim;
    vae.h_dim = args.h_dim;
    vae.cond_dim = args.cond_dim;
    vae.dropout = args.dropout;
    vae.normalization = NormalizationType::from_str(&args.normalization)?;
    vae.condition_encoders = args.condition_encoders;
    vae.condition_decoders = !args.no_condition_decoders;
    vae.add_shared_decoder = !args.no_shared_decoder;
    vae.kernel_type = KernelType::from_str(&args.kernel_type)?;
    vae.mmd = MmdMode::from_str(&args.mmd)?;
    vae.loss_coefs = LossCoefs::parse_overrides(&args.loss_coefs)?;
    vae.cat_covariate_dims = data.categorical_dims();
    vae.n_cont_covariates = data.n_cont_covariates();
    vae.cont_cov_type = ContCovType::from_str(&args.cont_cov_type)?;
    vae.integrate_on_idx = args
        .integrate_on
        .as_deref()
        .map(|k| {
            data.categorical_index(k)
                .ok_or_else(|| anyhow::anyhow!("unknown integration covariate `{}`", k))
        })
        .transpose()?;

    let supervised =
        !(args.class_keys.is_empty() && args.ord_keys.is_empty() && args.regression_keys.is_empty());

    let mil = if supervised {
        Some(MilConfig {
            class_idx: column_indices(&args.class_keys, |k| data.categorical_index(k))?,
            ord_idx: column_indices(&args.ord_keys, |k| data.categorical_index(k))?,
            reg_idx: column_indices(&args.regression_keys, |k| data.continuous_index(k))?,
            patient_idx: args
                .patient_key
                .as_deref()
                .map(|k| {
                    data.categorical_index(k)
                        .ok_or_else(|| anyhow::anyhow!("unknown patient covariate `{}`", k))
                })
                .transpose()?,
            scoring: Scoring::from_str(&args.scoring)?,
            attn_dim: args.attn_dim,
            patient_batch_size: args.patient_batch_size,
            class_loss_coef: args.class_loss_coef,
            regression_loss_coef: args.regression_loss_coef,
            reg_coef: args.reg_coef,
            hierarchical_attn: !args.flat_attn,
            regularize_cell_attn: args.regularize_cell_attn,
            regularize_cov_attn: args.regularize_cov_attn,
            regularize_vae: args.regularize_vae,
            ..Default::default()
        })
    } else {
        None
    };

    let device = args.device.device()?;
    let mut model = MultiMil::new(MultiMilConfig { vae, mil }, &device)?;

    let train_config = TrainConfig {
        num_epochs: args.epochs,
        learning_rate: args.learning_rate,
        weight_decay: args.weight_decay,
        batch_size: args.batch_size,
        bags_per_batch: args.bags_per_batch,
        validation_split: args.validation_split,
        early_stopping: args.early_stopping,
        patience: args.patience,
        kl_warmup: args.kl_warmup,
        verbose: args.verbose,
        show_progress: true,
    };
    model.train(&data, &train_config)?;
    model.save(&args.out)?;

    let latent = model.get_latent_representation(&data, args.batch_size)?;
    let latent_file = format!("{}/latent.tsv.gz", args.out);
    let cols: Vec<String> = (0..latent.ncols()).map(|k| format!("z{}", k)).collect();
    write_named_matrix(&latent_file, &data.barcodes, &cols, &latent)?;

    info!("done: {}", args.out);
    Ok(())
}
