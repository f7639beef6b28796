use clap::{Args, ValueEnum};
use log::info;
use multimil::dataset::{CategoricalColumn, ContinuousColumn, MultimodalData, SetupArgs};
use multimil::io::{read_named_matrix, read_table};
use std::collections::HashMap;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    pub fn device(&self) -> anyhow::Result<candle_util::candle_core::Device> {
        use candle_util::candle_core::Device;
        Ok(match self {
            ComputeDevice::Metal => Device::new_metal(0)?,
            ComputeDevice::Cuda => Device::new_cuda(0)?,
            ComputeDevice::Cpu => Device::Cpu,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct DataArgs {
    #[arg(
        long,
        short = 'x',
        required = true,
        help = "Feature matrix (cells x features)",
        long_help = "Feature matrix, TSV or TSV.GZ.\n\
		     The first column holds cell barcodes, the header feature names.\n\
		     Modality blocks are laid side by side."
    )]
    pub data: Box<str>,

    #[arg(
        long,
        required = true,
        help = "Cell annotation table",
        long_help = "Cell annotations, TSV or TSV.GZ, with a header line.\n\
		     The first column holds cell barcodes matching the feature matrix."
    )]
    pub obs: Box<str>,

    #[arg(
        long,
        value_delimiter(','),
        required = true,
        help = "Width of every modality block (comma-separated)"
    )]
    pub modality_lengths: Vec<usize>,

    #[arg(long, value_delimiter(','), help = "Name of every modality")]
    pub modality_names: Option<Vec<Box<str>>>,

    #[arg(long, default_value = "bag", help = "Bag (sample) column of the annotations")]
    pub bag_key: Box<str>,

    #[arg(long, value_delimiter(','), help = "Categorical covariate columns")]
    pub categorical_keys: Vec<Box<str>>,

    #[arg(long, value_delimiter(','), help = "Continuous covariate columns")]
    pub continuous_keys: Vec<Box<str>>,

    #[arg(long, help = "Cell type column reported with imputed values")]
    pub cell_type_key: Option<Box<str>>,

    #[arg(
        long,
        help = "Continuous column holding size factors",
        long_help = "Continuous covariate holding precomputed size factors.\n\
		     Exclusive with --rna-indices-end."
    )]
    pub size_factor_key: Option<Box<str>>,

    #[arg(
        long,
        help = "Size factors as row sums of the first N features",
        long_help = "Compute size factors as row sums over features [0, N).\n\
		     Exclusive with --size-factor-key."
    )]
    pub rna_indices_end: Option<usize>,
}

/// Read the feature matrix and annotations, then run `setup`
pub fn read_multimodal_data(args: &DataArgs) -> anyhow::Result<MultimodalData> {
    let x = read_named_matrix(&args.data)?;
    let obs = read_table(&args.obs, '\t')?;

    let barcode_to_obs: HashMap<&str, usize> = obs
        .rows
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.first().map(|b| (b.as_ref(), i)))
        .collect();

    let obs_rows: Vec<usize> = x
        .rows
        .iter()
        .map(|b| {
            barcode_to_obs
                .get(b.as_str())
                .copied()
                .ok_or_else(|| anyhow::anyhow!("cell `{}` is missing in {}", b, args.obs))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let column = |name: &str| -> anyhow::Result<Vec<String>> {
        let col = obs.column(name)?;
        Ok(obs_rows.iter().map(|&i| col[i].to_string()).collect())
    };

    let mut data = MultimodalData::new(x.data, args.modality_lengths.clone());
    if let Some(names) = &args.modality_names {
        data.modality_names = names.iter().map(|s| s.to_string()).collect();
    }
    data.barcodes = x.rows;
    data.bags = column(&args.bag_key)?;
    if let Some(key) = &args.cell_type_key {
        data.cell_types = Some(column(key)?);
    }

    for key in args.categorical_keys.iter() {
        data.categorical
            .push(CategoricalColumn::from_labels(key, &column(key)?));
    }

    let mut cont_keys: Vec<&str> = args.continuous_keys.iter().map(|k| k.as_ref()).collect();
    if let Some(sf) = args.size_factor_key.as_deref() {
        if !cont_keys.contains(&sf) {
            cont_keys.push(sf);
        }
    }
    for key in cont_keys {
        let values = column(key)?
            .iter()
            .map(|v| {
                v.parse::<f32>()
                    .map_err(|e| anyhow::anyhow!("column `{}`: `{}` {}", key, v, e))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        data.continuous.push(ContinuousColumn {
            name: key.to_string(),
            values,
        });
    }

    data.setup(&SetupArgs {
        size_factor_key: args.size_factor_key.as_ref().map(|s| s.to_string()),
        rna_indices_end: args.rna_indices_end,
    })?;

    info!(
        "read {} cells x {} features from {}",
        data.num_cells(),
        data.num_features(),
        args.data
    );
    Ok(data)
}
