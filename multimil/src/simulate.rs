use crate::common::*;
use crate::dataset::{CategoricalColumn, ContinuousColumn, MultimodalData};

use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Poisson};

pub struct SimulateArgs {
    pub bags: usize,
    pub cells_per_bag: usize,
    pub rna_features: usize,
    pub protein_features: usize,
    pub latent_dim: usize,
    pub groups: usize,
    pub classes: usize,
    /// distance between class centroids in the latent space
    pub class_shift: f32,
    /// fraction of cells without the protein block
    pub protein_missing: f32,
    pub depth: f32,
    pub rseed: u64,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            bags: 8,
            cells_per_bag: 32,
            rna_features: 50,
            protein_features: 10,
            latent_dim: 4,
            groups: 2,
            classes: 2,
            class_shift: 3.0,
            protein_missing: 0.0,
            depth: 200.0,
            rseed: 42,
        }
    }
}

/// Simulate bags of two-modality cells whose bag class shifts the
/// latent state
///
/// ```text
/// z(j) ~ N(shift * class(bag(j)), I)
/// rna(j,g) ~ Poisson( depth * softmax_g( z(j) W / sqrt(K) + group(j) delta ) )
/// prot(j,p) = z(j) V / sqrt(K) + N(0, 0.1^2)
/// ```
///
/// Categorical covariates: `group` (batch) and `class` (per bag).
/// Continuous covariate: `size_factor` (RNA row sums).
pub fn simulate(args: &SimulateArgs) -> anyhow::Result<MultimodalData> {
    let nn = args.bags * args.cells_per_bag;
    let kk = args.latent_dim.max(1);
    let (d_rna, d_prot) = (args.rna_features, args.protein_features);
    if nn == 0 || d_rna + d_prot == 0 {
        return Err(anyhow::anyhow!("nothing to simulate"));
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(args.rseed);
    let rnorm = Normal::new(0_f32, 1_f32)?;
    let noise = Normal::new(0_f32, 0.1_f32)?;

    let w_rna = Mat::from_fn(kk, d_rna, |_, _| rnorm.sample(&mut rng));
    let w_prot = Mat::from_fn(kk, d_prot, |_, _| rnorm.sample(&mut rng));
    let n_groups = args.groups.max(1);
    let delta = Mat::from_fn(n_groups, d_rna, |_, _| 0.5 * rnorm.sample(&mut rng));

    let n_classes = args.classes.max(1);
    let bag_class: Vec<usize> = (0..args.bags).map(|b| b % n_classes).collect();

    let mut x = Mat::zeros(nn, d_rna + d_prot);
    let mut bags = Vec::with_capacity(nn);
    let mut classes = Vec::with_capacity(nn);
    let mut groups = Vec::with_capacity(nn);
    let scale = 1.0 / (kk as f32).sqrt();

    for j in 0..nn {
        let b = j / args.cells_per_bag;
        let g = rng.random_range(0..n_groups);
        let shift = args.class_shift * bag_class[b] as f32;
        let z: Vec<f32> = (0..kk).map(|_| shift + rnorm.sample(&mut rng)).collect();

        if d_rna > 0 {
            let logits: Vec<f32> = (0..d_rna)
                .map(|f| {
                    (0..kk).map(|k| z[k] * w_rna[(k, f)]).sum::<f32>() * scale + delta[(g, f)]
                })
                .collect();
            let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let denom: f32 = logits.iter().map(|l| (l - max).exp()).sum();
            for (f, l) in logits.iter().enumerate() {
                let rate = (args.depth * (l - max).exp() / denom).max(1e-4);
                x[(j, f)] = Poisson::new(rate)?.sample(&mut rng);
            }
        }

        if d_prot > 0 && rng.random::<f32>() >= args.protein_missing {
            for p in 0..d_prot {
                let mean = (0..kk).map(|k| z[k] * w_prot[(k, p)]).sum::<f32>() * scale;
                x[(j, d_rna + p)] = mean + noise.sample(&mut rng);
            }
        }

        bags.push(format!("bag{}", b));
        classes.push(format!("class{}", bag_class[b]));
        groups.push(format!("group{}", g));
    }

    let size_factor: Vec<f32> = (0..nn)
        .map(|j| x.view((j, 0), (1, d_rna)).sum().max(1.0))
        .collect();

    let mut data = MultimodalData::new(x, vec![d_rna, d_prot]);
    data.modality_names = vec!["rna".into(), "protein".into()];
    data.bags = bags;
    data.barcodes = (0..nn).map(|j| format!("cell{}", j)).collect();
    data.categorical = vec![
        CategoricalColumn::from_labels("group", &groups),
        CategoricalColumn::from_labels("class", &classes),
    ];
    data.continuous = vec![ContinuousColumn {
        name: "size_factor".into(),
        values: size_factor,
    }];

    info!(
        "simulated {} cells in {} bags ({} RNA, {} protein features)",
        nn, args.bags, d_rna, d_prot
    );
    Ok(data)
}
