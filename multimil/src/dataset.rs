use crate::aggregator::BagLayout;
use crate::common::*;

use candle_core::{DType, Device, Tensor};
use candle_util::candle_data_loader::{take_rows, BagMinibatches, RowsToTensorVec};
use rand::prelude::SliceRandom;
use rayon::prelude::*;
use std::collections::HashMap;
use std::ops::Range;

/// Categorical covariate: per-cell codes into sorted `levels`
#[derive(Clone, Debug)]
pub struct CategoricalColumn {
    pub name: String,
    pub levels: Vec<String>,
    pub codes: Vec<u32>,
}

impl CategoricalColumn {
    pub fn from_labels<S: AsRef<str>>(name: &str, labels: &[S]) -> Self {
        let mut levels: Vec<String> = labels.iter().map(|s| s.as_ref().to_string()).collect();
        levels.sort();
        levels.dedup();
        let lookup: HashMap<&str, u32> = levels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i as u32))
            .collect();
        let codes = labels.iter().map(|s| lookup[s.as_ref()]).collect();
        Self {
            name: name.to_string(),
            levels,
            codes,
        }
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }
}

#[derive(Clone, Debug)]
pub struct ContinuousColumn {
    pub name: String,
    pub values: Vec<f32>,
}

/// How `setup` finds the per-cell size factor; exactly one must be given
#[derive(Clone, Debug, Default)]
pub struct SetupArgs {
    /// continuous column holding precomputed size factors
    pub size_factor_key: Option<String>,
    /// row sums over features `0..rna_indices_end`
    pub rna_indices_end: Option<usize>,
}

/// State attached by [`MultimodalData::setup`]
struct Registry {
    size_factor: Vec<f32>,
    /// continuous covariate columns, size-factor column excluded
    cont_columns: Vec<usize>,
    /// bag-grouped position -> input row
    order: Vec<usize>,
    /// bag of each bag-grouped position
    bag_of: Vec<usize>,
    bag_ranges: Vec<Range<usize>>,
    bag_labels: Vec<String>,
    x_rows: Vec<Tensor>,
    cat_rows: Option<Vec<Tensor>>,
    cont_rows: Vec<Tensor>,
}

/// In-memory multimodal single-cell data
///
/// `x` is cells × features with modality blocks laid side by side as
/// given by `modality_lengths`.
pub struct MultimodalData {
    pub x: Mat,
    pub modality_lengths: Vec<usize>,
    pub modality_names: Vec<String>,
    pub categorical: Vec<CategoricalColumn>,
    pub continuous: Vec<ContinuousColumn>,
    pub bags: Vec<String>,
    pub barcodes: Vec<String>,
    pub cell_types: Option<Vec<String>>,
    registry: Option<Registry>,
}

/// Tensors of one minibatch, rows grouped by bag
pub struct CellBatch {
    /// (n, Σ modality_lengths)
    pub x: Tensor,
    /// (n, n_cat) `u32`
    pub cat_covs: Option<Tensor>,
    /// (n, n_cont + 1), size factor last
    pub cont_covs: Tensor,
    pub layout: BagLayout,
    /// bag-grouped positions of the rows
    pub positions: Vec<usize>,
}

impl CellBatch {
    /// (n,) `u32` codes of the integration covariate, zeros without one
    pub fn groups(&self, integrate_on_idx: Option<usize>) -> Result<Tensor> {
        match (integrate_on_idx, self.cat_covs.as_ref()) {
            (Some(g), Some(cat)) => Ok(cat.narrow(1, g, 1)?.squeeze(1)?.contiguous()?),
            _ => Ok(Tensor::zeros(self.x.dim(0)?, DType::U32, self.x.device())?),
        }
    }

    /// (n, 1) size factor
    pub fn size_factor(&self) -> Result<Tensor> {
        let w = self.cont_covs.dim(1)?;
        Ok(self.cont_covs.narrow(1, w - 1, 1)?.contiguous()?)
    }
}

impl MultimodalData {
    pub fn new(x: Mat, modality_lengths: Vec<usize>) -> Self {
        let n = x.nrows();
        Self {
            x,
            modality_names: (0..modality_lengths.len())
                .map(|i| format!("mod{}", i))
                .collect(),
            modality_lengths,
            categorical: vec![],
            continuous: vec![],
            bags: vec!["0".to_string(); n],
            barcodes: (0..n).map(|i| format!("cell{}", i)).collect(),
            cell_types: None,
            registry: None,
        }
    }

    pub fn num_cells(&self) -> usize {
        self.x.nrows()
    }

    pub fn num_features(&self) -> usize {
        self.x.ncols()
    }

    pub fn is_setup(&self) -> bool {
        self.registry.is_some()
    }

    pub fn categorical_dims(&self) -> Vec<usize> {
        self.categorical.iter().map(|c| c.n_levels()).collect()
    }

    pub fn categorical_index(&self, name: &str) -> Option<usize> {
        self.categorical.iter().position(|c| c.name == name)
    }

    /// index among the continuous covariates (size factor excluded)
    pub fn continuous_index(&self, name: &str) -> Option<usize> {
        let cols = self.continuous_covariate_columns();
        cols.iter().position(|&c| self.continuous[c].name == name)
    }

    /// columns of `continuous` used as covariates, in covariate order
    pub fn continuous_covariate_columns(&self) -> Vec<usize> {
        match &self.registry {
            Some(reg) => reg.cont_columns.clone(),
            None => (0..self.continuous.len()).collect(),
        }
    }

    /// number of continuous covariates, size factor excluded
    pub fn n_cont_covariates(&self) -> usize {
        self.continuous_covariate_columns().len()
    }

    /// Validate the annotations, compute size factors and group cells by
    /// bag (stable, in order of first appearance)
    pub fn setup(&mut self, args: &SetupArgs) -> Result<()> {
        let n = self.num_cells();

        let total: usize = self.modality_lengths.iter().sum();
        if total != self.num_features() {
            return Err(MultimilError::config(format!(
                "modality_lengths sum to {} but the data has {} features",
                total,
                self.num_features()
            )));
        }
        if self.modality_names.len() != self.modality_lengths.len() {
            return Err(MultimilError::config(format!(
                "modality_names must be the same length as modality_lengths: {} != {}",
                self.modality_names.len(),
                self.modality_lengths.len()
            )));
        }
        for (what, len) in [
            ("bags", self.bags.len()),
            ("barcodes", self.barcodes.len()),
            (
                "cell_types",
                self.cell_types.as_ref().map(|c| c.len()).unwrap_or(n),
            ),
        ] {
            if len != n {
                return Err(MultimilError::config(format!(
                    "{} has {} entries for {} cells",
                    what, len, n
                )));
            }
        }
        for c in self.categorical.iter() {
            if c.codes.len() != n {
                return Err(MultimilError::config(format!(
                    "categorical covariate `{}` has {} entries for {} cells",
                    c.name,
                    c.codes.len(),
                    n
                )));
            }
        }
        for c in self.continuous.iter() {
            if c.values.len() != n {
                return Err(MultimilError::config(format!(
                    "continuous covariate `{}` has {} entries for {} cells",
                    c.name,
                    c.values.len(),
                    n
                )));
            }
        }

        let (size_factor, sf_column) = match (&args.size_factor_key, args.rna_indices_end) {
            (Some(_), Some(_)) => {
                return Err(MultimilError::config(
                    "only one of size_factor_key and rna_indices_end can be given, found both",
                ))
            }
            (None, None) => {
                return Err(MultimilError::config(
                    "one of size_factor_key and rna_indices_end has to be given, found neither",
                ))
            }
            (Some(key), None) => {
                let col = self
                    .continuous
                    .iter()
                    .position(|c| &c.name == key)
                    .ok_or_else(|| {
                        MultimilError::config(format!(
                            "size_factor_key `{}` is not a continuous covariate",
                            key
                        ))
                    })?;
                (self.continuous[col].values.clone(), Some(col))
            }
            (None, Some(end)) => {
                if end == 0 || end > self.num_features() {
                    return Err(MultimilError::config(format!(
                        "rna_indices_end {} is out of range (1..={})",
                        end,
                        self.num_features()
                    )));
                }
                let x = &self.x;
                let sf: Vec<f32> = (0..n)
                    .into_par_iter()
                    .map(|i| x.view((i, 0), (1, end)).sum())
                    .collect();
                (sf, None)
            }
        };

        let cont_columns: Vec<usize> = (0..self.continuous.len())
            .filter(|&c| Some(c) != sf_column)
            .collect();

        // group by bag, stable
        let mut bag_labels: Vec<String> = vec![];
        let mut members: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, b) in self.bags.iter().enumerate() {
            members
                .entry(b.as_str())
                .or_insert_with(|| {
                    bag_labels.push(b.clone());
                    vec![]
                })
                .push(i);
        }
        let mut order = Vec::with_capacity(n);
        let mut bag_ranges = Vec::with_capacity(bag_labels.len());
        let mut bag_of = Vec::with_capacity(n);
        for (b, label) in bag_labels.iter().enumerate() {
            let lb = order.len();
            order.extend(members[label.as_str()].iter().copied());
            bag_ranges.push(lb..order.len());
            bag_of.extend(std::iter::repeat(b).take(order.len() - lb));
        }

        let x_sorted = Mat::from_fn(n, self.num_features(), |r, c| self.x[(order[r], c)]);
        let x_rows = x_sorted.rows_to_tensor_vec()?;

        let cat_rows = if self.categorical.is_empty() {
            None
        } else {
            let cat = Mat::from_fn(n, self.categorical.len(), |r, c| {
                self.categorical[c].codes[order[r]] as f32
            });
            Some(cat.rows_to_tensor_vec()?)
        };

        let n_cont = cont_columns.len();
        let cont = Mat::from_fn(n, n_cont + 1, |r, c| {
            if c < n_cont {
                self.continuous[cont_columns[c]].values[order[r]]
            } else {
                size_factor[order[r]]
            }
        });
        let cont_rows = cont.rows_to_tensor_vec()?;

        info!(
            "setup: {} cells, {} features, {} bags, {} categorical and {} continuous covariates",
            n,
            self.num_features(),
            bag_ranges.len(),
            self.categorical.len(),
            n_cont
        );

        self.registry = Some(Registry {
            size_factor,
            cont_columns,
            order,
            bag_of,
            bag_ranges,
            bag_labels,
            x_rows,
            cat_rows,
            cont_rows,
        });
        Ok(())
    }

    fn registry(&self) -> Result<&Registry> {
        self.registry
            .as_ref()
            .ok_or_else(|| MultimilError::precondition("data has not been set up; call setup() first"))
    }

    pub fn size_factor(&self) -> Result<&[f32]> {
        Ok(&self.registry()?.size_factor)
    }

    pub fn num_bags(&self) -> Result<usize> {
        Ok(self.registry()?.bag_ranges.len())
    }

    pub fn bag_labels(&self) -> Result<&[String]> {
        Ok(&self.registry()?.bag_labels)
    }

    pub fn bag_index(&self, label: &str) -> Result<usize> {
        self.registry()?
            .bag_labels
            .iter()
            .position(|b| b == label)
            .ok_or_else(|| MultimilError::precondition(format!("unknown bag `{}`", label)))
    }

    /// bag-grouped position ranges of the given bags
    pub fn bag_ranges(&self, bags: &[usize]) -> Result<Vec<Range<usize>>> {
        let reg = self.registry()?;
        bags.iter()
            .map(|&b| {
                reg.bag_ranges.get(b).cloned().ok_or_else(|| {
                    MultimilError::precondition(format!("bag index {} out of range", b))
                })
            })
            .collect()
    }

    /// input row of a bag-grouped position
    pub fn input_row(&self, position: usize) -> Result<usize> {
        Ok(self.registry()?.order[position])
    }

    /// Gather a minibatch of bag-grouped positions and validate its bag
    /// layout against `stride`
    pub fn cell_batch(
        &self,
        positions: &[usize],
        stride: usize,
        target_device: &Device,
    ) -> anyhow::Result<CellBatch> {
        let reg = self.registry()?;
        let x = take_rows(positions, &reg.x_rows, target_device)?;
        let cat_covs = reg
            .cat_rows
            .as_ref()
            .map(|rows| -> anyhow::Result<Tensor> {
                Ok(take_rows(positions, rows, target_device)?.to_dtype(DType::U32)?)
            })
            .transpose()?;
        let cont_covs = take_rows(positions, &reg.cont_rows, target_device)?;

        let bag_ids: Vec<usize> = positions.iter().map(|&p| reg.bag_of[p]).collect();
        let layout = BagLayout::from_bag_ids(&bag_ids, stride)?;

        Ok(CellBatch {
            x,
            cat_covs,
            cont_covs,
            layout,
            positions: positions.to_vec(),
        })
    }

    /// Random split of bag indices into (train, validation)
    ///
    /// At least one bag stays in training; a positive fraction keeps at
    /// least one validation bag when there are two or more bags.
    pub fn split_bags(&self, validation_fraction: f32) -> Result<(Vec<usize>, Vec<usize>)> {
        let n_bags = self.num_bags()?;
        let mut bags: Vec<usize> = (0..n_bags).collect();
        let mut rng = rand::rng();
        bags.shuffle(&mut rng);

        let mut n_valid = (validation_fraction.clamp(0.0, 1.0) * n_bags as f32).round() as usize;
        if validation_fraction > 0.0 && n_bags > 1 {
            n_valid = n_valid.max(1);
        }
        n_valid = n_valid.min(n_bags.saturating_sub(1));

        let valid = bags.split_off(n_bags - n_valid);
        Ok((bags, valid))
    }
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device)
        -> anyhow::Result<CellBatch>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, bags_per_batch: usize) -> anyhow::Result<()>;
}

/// Bag-aware loader over a subset of bags
///
/// Each minibatch holds `bags_per_batch` full strides of
/// `patient_batch_size` cells; shorter trailing pieces of a bag become
/// single-bag minibatches at the end of a pass.
pub struct BagLoader<'a> {
    data: &'a MultimodalData,
    minibatches: BagMinibatches,
    stride: usize,
}

impl<'a> BagLoader<'a> {
    pub fn new(data: &'a MultimodalData, bags: &[usize], stride: usize) -> anyhow::Result<Self> {
        let ranges = data.bag_ranges(bags)?;
        Ok(Self {
            data,
            minibatches: BagMinibatches::new(ranges),
            stride: stride.max(1),
        })
    }

    /// keep the bag-grouped order
    pub fn sequential_minibatch(&mut self, bags_per_batch: usize) {
        self.minibatches
            .sequential_minibatch(self.stride, bags_per_batch);
    }

    pub fn num_cells(&self) -> usize {
        self.minibatches.size()
    }
}

impl DataLoader for BagLoader<'_> {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<CellBatch> {
        let positions = self.minibatches.chunks.get(batch_idx).ok_or_else(|| {
            anyhow::anyhow!(
                "invalid minibatch index {} vs. {}",
                batch_idx,
                self.num_minibatch()
            )
        })?;
        self.data.cell_batch(positions, self.stride, target_device)
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, bags_per_batch: usize) -> anyhow::Result<()> {
        self.minibatches
            .shuffle_minibatch(self.stride, bags_per_batch);
        Ok(())
    }
}
