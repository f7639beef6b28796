use crate::multimil_input::*;

use clap::Args;
use log::info;
use multimil::history::History;
use multimil::io::{write_named_matrix, write_table};
use multimil::simulate::{simulate, SimulateArgs};
use multimil::MultiMil;

#[derive(Args, Debug)]
pub struct LatentArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[arg(long, short, required = true, help = "Directory of a saved model")]
    model_dir: Box<str>,

    #[arg(long, short, required = true, help = "Output file (.tsv.gz recommended)")]
    out: Box<str>,

    #[arg(long, default_value_t = 256)]
    batch_size: usize,

    #[arg(long, value_enum, default_value = "cpu")]
    device: ComputeDevice,
}

pub fn run_latent(args: &LatentArgs) -> anyhow::Result<()> {
    env_logger::init();
    let data = read_multimodal_data(&args.data)?;
    let model = MultiMil::from_dir(&args.model_dir, &args.device.device()?)?;
    let latent = model.get_latent_representation(&data, args.batch_size)?;
    let cols: Vec<String> = (0..latent.ncols()).map(|k| format!("z{}", k)).collect();
    write_named_matrix(&args.out, &data.barcodes, &cols, &latent)?;
    info!("wrote {} latent rows to {}", latent.nrows(), args.out);
    Ok(())
}

#[derive(Args, Debug)]
pub struct ImputeArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[arg(long, short, required = true, help = "Directory of a saved model")]
    model_dir: Box<str>,

    #[arg(long, short, required = true, help = "Target modality name")]
    target: Box<str>,

    #[arg(long, help = "Impute the cells of this bag only")]
    bag: Option<Box<str>>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output file",
        long_help = "Output file (.tsv.gz recommended).\n\
		     Columns: barcode, bag, cell_type, source_modalities,\n\
		     then one column per target feature."
    )]
    out: Box<str>,

    #[arg(long, default_value_t = 256)]
    batch_size: usize,

    #[arg(long, value_enum, default_value = "cpu")]
    device: ComputeDevice,
}

pub fn run_impute(args: &ImputeArgs) -> anyhow::Result<()> {
    env_logger::init();
    let data = read_multimodal_data(&args.data)?;
    let model = MultiMil::from_dir(&args.model_dir, &args.device.device()?)?;
    let table = model.impute(&data, &args.target, args.bag.as_deref(), args.batch_size)?;

    let mut header: Vec<String> = ["barcode", "bag", "cell_type", "source_modalities"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend((0..table.values.ncols()).map(|k| format!("{}_{}", table.target, k)));

    let sources = table.source_modalities.join("+");
    let rows: Vec<Vec<String>> = (0..table.values.nrows())
        .map(|r| {
            let mut row = vec![
                table.barcodes[r].clone(),
                table.bags[r].clone(),
                table
                    .cell_types
                    .as_ref()
                    .map(|ct| ct[r].clone())
                    .unwrap_or_else(|| "NA".into()),
                sources.clone(),
            ];
            row.extend(table.values.row(r).iter().map(|v| v.to_string()));
            row
        })
        .collect();

    write_table(&args.out, &header, &rows, '\t')?;
    info!("wrote {} imputed cells to {}", rows.len(), args.out);
    Ok(())
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[arg(long, short, required = true, help = "Directory of a saved model")]
    model_dir: Box<str>,

    #[arg(long, short, required = true, help = "Output file, one row per bag")]
    out: Box<str>,

    #[arg(long, value_enum, default_value = "cpu")]
    device: ComputeDevice,
}

pub fn run_predict(args: &PredictArgs) -> anyhow::Result<()> {
    env_logger::init();
    let data = read_multimodal_data(&args.data)?;
    let model = MultiMil::from_dir(&args.model_dir, &args.device.device()?)?;
    let pred = model.predict(&data)?;

    let mut header = vec!["bag".to_string()];
    header.extend(pred.tasks.iter().cloned());
    let rows: Vec<Vec<String>> = pred
        .bags
        .iter()
        .zip(pred.values.iter())
        .map(|(b, v)| {
            let mut row = vec![b.clone()];
            row.extend(v.iter().cloned());
            row
        })
        .collect();
    write_table(&args.out, &header, &rows, '\t')?;
    Ok(())
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[arg(long, short, required = true, help = "Directory of a saved model")]
    model_dir: Box<str>,

    #[arg(
        long,
        value_delimiter(','),
        default_value = "loss,recon_loss",
        help = "Loss terms to print"
    )]
    terms: Vec<Box<str>>,
}

/// Print the selected loss columns of a saved history
pub fn run_history(args: &HistoryArgs) -> anyhow::Result<()> {
    env_logger::init();
    let file = format!("{}/{}", args.model_dir, multimil::model::HISTORY_FILE);
    let history = History::from_csv(&file)?;

    let mut header = vec!["epoch".to_string()];
    for t in args.terms.iter() {
        for split in ["train", "validation"] {
            let col = format!("{}_{}", t, split);
            if history.column(&col).is_some() {
                header.push(col);
            }
        }
    }
    let columns: Vec<Vec<f32>> = header
        .iter()
        .map(|c| history.column(c).unwrap_or_default())
        .collect();

    let rows: Vec<Vec<String>> = (0..history.num_epochs())
        .map(|e| columns.iter().map(|c| c[e].to_string()).collect())
        .collect();
    write_table("stdout", &header, &rows, '\t')
}

#[derive(Args, Debug)]
pub struct SimArgs {
    #[arg(long, short, required = true, help = "Output header: {out}.data.tsv.gz, {out}.obs.tsv.gz")]
    out: Box<str>,

    #[arg(long, default_value_t = 8)]
    bags: usize,

    #[arg(long, default_value_t = 32)]
    cells_per_bag: usize,

    #[arg(long, default_value_t = 50)]
    rna_features: usize,

    #[arg(long, default_value_t = 10)]
    protein_features: usize,

    #[arg(long, default_value_t = 2)]
    groups: usize,

    #[arg(long, default_value_t = 2)]
    classes: usize,

    #[arg(long, default_value_t = 0.0, help = "Fraction of cells without protein")]
    protein_missing: f32,

    #[arg(long, default_value_t = 42)]
    rseed: u64,
}

pub fn run_simulate(args: &SimArgs) -> anyhow::Result<()> {
    env_logger::init();
    let data = simulate(&SimulateArgs {
        bags: args.bags,
        cells_per_bag: args.cells_per_bag,
        rna_features: args.rna_features,
        protein_features: args.protein_features,
        groups: args.groups,
        classes: args.classes,
        protein_missing: args.protein_missing,
        rseed: args.rseed,
        ..Default::default()
    })?;

    let features: Vec<String> = (0..args.rna_features)
        .map(|g| format!("gene{}", g))
        .chain((0..args.protein_features).map(|p| format!("protein{}", p)))
        .collect();
    write_named_matrix(
        &format!("{}.data.tsv.gz", args.out),
        &data.barcodes,
        &features,
        &data.x,
    )?;

    let mut header = vec!["barcode".to_string(), "bag".to_string()];
    header.extend(data.categorical.iter().map(|c| c.name.clone()));
    header.extend(data.continuous.iter().map(|c| c.name.clone()));
    let rows: Vec<Vec<String>> = (0..data.num_cells())
        .map(|j| {
            let mut row = vec![data.barcodes[j].clone(), data.bags[j].clone()];
            row.extend(
                data.categorical
                    .iter()
                    .map(|c| c.levels[c.codes[j] as usize].clone()),
            );
            row.extend(data.continuous.iter().map(|c| c.values[j].to_string()));
            row
        })
        .collect();
    write_table(&format!("{}.obs.tsv.gz", args.out), &header, &rows, '\t')?;

    info!("wrote {}.data.tsv.gz and {}.obs.tsv.gz", args.out, args.out);
    Ok(())
}
