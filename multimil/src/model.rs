use crate::aggregator::BagLayout;
use crate::common::*;
use crate::config::{CovariateLayout, MultiMilConfig};
use crate::dataset::{BagLoader, CellBatch, DataLoader, MultimodalData};
use crate::history::History;
use crate::integration::{calc_cycle_loss, integration_loss};
use crate::loss::{LossOutput, LossTerms, LossWeights};
use crate::mil::{orthogonal_regularization, MilModule, MilOutput};
use crate::modality::ModalityOutput;
use crate::train::TrainConfig;
use crate::vae::{MultiVae, VaeInference};

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use candle_util::candle_loss_functions::gaussian_kl_loss;
use std::path::Path;

pub const MODEL_FILE: &str = "last-model.safetensors";
pub const HISTORY_FILE: &str = "history.csv";
pub const CONFIG_FILE: &str = "config.json";

/// Everything one forward pass produces
pub struct ForwardOutput {
    pub inference: VaeInference,
    pub reconstructions: Vec<Option<ModalityOutput>>,
    pub mil: Option<MilOutput>,
}

/// Translated values of one target modality with their provenance
pub struct ImputedTable {
    pub target: String,
    pub source_modalities: Vec<String>,
    /// (cells, target features)
    pub values: Mat,
    pub barcodes: Vec<String>,
    pub bags: Vec<String>,
    pub cell_types: Option<Vec<String>>,
}

/// Per-bag predictions of every supervised task
pub struct BagPredictions {
    pub bags: Vec<String>,
    pub tasks: Vec<String>,
    /// class labels for classification tasks, numbers otherwise
    pub values: Vec<Vec<String>>,
}

/// Multi-modal VAE with an optional MIL head
///
/// All parameters live in one [`VarMap`]: `vae.*` for the autoencoder
/// and `mil.*` for the aggregation and prediction heads.
pub struct MultiMil {
    config: MultiMilConfig,
    layout: CovariateLayout,
    varmap: VarMap,
    vae: MultiVae,
    mil: Option<MilModule>,
    device: Device,
    history: History,
    is_trained: bool,
}

impl MultiMil {
    pub fn new(config: MultiMilConfig, device: &Device) -> Result<Self> {
        let vae_config = config.vae.clone().resolved()?;
        let layout = CovariateLayout::new(&vae_config, config.mil.as_ref())?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let vae = MultiVae::new(&vae_config, &layout, vb.pp("vae"))?;
        let mil = config
            .mil
            .as_ref()
            .map(|m| MilModule::new(m, &vae_config, &layout, vb.pp("mil")))
            .transpose()?;

        info!(
            "built a model with {} modalities, z_dim {}, {}",
            vae_config.n_modality(),
            vae_config.z_dim,
            if mil.is_some() { "with MIL" } else { "without MIL" }
        );

        Ok(Self {
            config: MultiMilConfig {
                vae: vae_config,
                mil: config.mil,
            },
            layout,
            varmap,
            vae,
            mil,
            device: device.clone(),
            history: History::new(),
            is_trained: false,
        })
    }

    pub fn config(&self) -> &MultiMilConfig {
        &self.config
    }

    pub fn vae(&self) -> &MultiVae {
        &self.vae
    }

    pub fn mil(&self) -> Option<&MilModule> {
        self.mil.as_ref()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn is_trained(&self) -> bool {
        self.is_trained
    }

    pub(crate) fn finish_training(&mut self, history: History) {
        self.history = history;
        self.is_trained = true;
    }

    fn require_trained(&self, what: &str) -> Result<()> {
        if !self.is_trained {
            return Err(MultimilError::precondition(format!(
                "{} needs a trained model; call train() or load() first",
                what
            )));
        }
        Ok(())
    }

    /// Check that `data` was set up with the registered layout
    pub fn check_data(&self, data: &MultimodalData) -> Result<()> {
        if !data.is_setup() {
            return Err(MultimilError::precondition(
                "data has not been set up; call setup() first",
            ));
        }
        let vae = &self.config.vae;
        if data.modality_lengths != vae.modality_lengths {
            return Err(MultimilError::precondition(format!(
                "data modality_lengths {:?} differ from the model {:?}",
                data.modality_lengths, vae.modality_lengths
            )));
        }
        if data.categorical_dims() != vae.cat_covariate_dims {
            return Err(MultimilError::precondition(format!(
                "data categorical levels {:?} differ from the model {:?}",
                data.categorical_dims(),
                vae.cat_covariate_dims
            )));
        }
        if data.n_cont_covariates() != vae.n_cont_covariates {
            return Err(MultimilError::precondition(format!(
                "data has {} continuous covariates after size-factor exclusion, the model {}",
                data.n_cont_covariates(),
                vae.n_cont_covariates
            )));
        }
        Ok(())
    }

    /// cells per bag slice; minibatches of a VAE-only model are cut at
    /// `batch_size`
    pub fn stride(&self, batch_size: usize) -> usize {
        match &self.mil {
            Some(mil) => mil.stride(),
            None => batch_size.max(1),
        }
    }

    pub fn forward(&self, batch: &CellBatch, train: bool) -> Result<ForwardOutput> {
        let cat = batch.cat_covs.as_ref();
        let inference = self.vae.inference(&batch.x, cat, &batch.cont_covs, train)?;
        let reconstructions =
            self.vae
                .generative(&inference.z_joint, inference.cond.as_ref(), train)?;
        let mil = match &self.mil {
            Some(mil) => Some(mil.forward_t(
                &inference.z_joint,
                self.vae.covariates(),
                cat,
                &batch.cont_covs,
                &batch.layout,
                train,
            )?),
            None => None,
        };
        Ok(ForwardOutput {
            inference,
            reconstructions,
            mil,
        })
    }

    /// Composite loss of one minibatch
    ///
    /// * `kl_weight` - multiplies the `kl` coefficient (warmup)
    pub fn loss(&self, batch: &CellBatch, train: bool, kl_weight: f64) -> Result<LossOutput> {
        let vae_config = &self.config.vae;
        let coefs = &vae_config.loss_coefs;
        let out = self.forward(batch, train)?;
        let inf = &out.inference;

        let xs = self.vae.split_modalities(&batch.x)?;
        let groups = batch.groups(vae_config.integrate_on_idx)?;
        let size_factor = batch.size_factor()?;

        let (recon, _) = self.vae.recon_loss(
            &xs,
            &out.reconstructions,
            &inf.masks,
            &groups,
            &size_factor,
        )?;
        let kl = gaussian_kl_loss(&inf.mu, &inf.logvar)?;

        let zero = Tensor::new(0f32, &self.device)?;

        let integ = if coefs.integ > 0.0 {
            let labels: Vec<u32> = groups.to_vec1()?;
            integration_loss(vae_config.kernel_type, vae_config.mmd, inf, &labels)?
        } else {
            zero.clone()
        };

        let cycle = if coefs.cycle > 0.0 {
            calc_cycle_loss(&self.vae, &xs, inf, &groups, &size_factor, train)?
        } else {
            zero.clone()
        };

        let (classification, regression, accuracy) = match (&self.mil, &out.mil) {
            (Some(mil), Some(mil_out)) => {
                let l = mil.loss(mil_out, batch.cat_covs.as_ref(), &batch.cont_covs)?;
                (l.classification, l.regression, l.accuracy)
            }
            _ => (zero.clone(), zero.clone(), None),
        };

        let reg = match &self.mil {
            Some(mil) => {
                let mut weights = mil.regularized_weights();
                if mil.config().regularize_vae {
                    weights.extend(self.vae.first_layer_weights());
                }
                orthogonal_regularization(&weights, &self.device)?
            }
            None => zero,
        };

        let (class, regression_coef, reg_coef) = match &self.config.mil {
            Some(m) => (m.class_loss_coef, m.regression_loss_coef, m.reg_coef),
            None => (0.0, 0.0, 0.0),
        };

        let weights = LossWeights {
            recon: coefs.recon,
            kl: coefs.kl * kl_weight,
            integ: coefs.integ,
            cycle: coefs.cycle,
            class,
            regression: regression_coef,
            reg: reg_coef,
        };

        LossTerms {
            recon,
            kl,
            integ,
            cycle,
            classification,
            regression,
            reg,
            accuracy,
        }
        .combine(&weights)
    }

    pub fn train(&mut self, data: &MultimodalData, config: &TrainConfig) -> anyhow::Result<&History> {
        let history = crate::train::fit(self, data, config)?;
        self.finish_training(history);
        Ok(&self.history)
    }

    /// Joint posterior mean of every cell, rows in input order
    pub fn get_latent_representation(
        &self,
        data: &MultimodalData,
        batch_size: usize,
    ) -> anyhow::Result<Mat> {
        self.require_trained("get_latent_representation")?;
        self.check_data(data)?;

        let z_dim = self.vae.z_dim();
        let mut latent = Mat::zeros(data.num_cells(), z_dim);

        let bags: Vec<usize> = (0..data.num_bags()?).collect();
        let stride = self.stride(batch_size);
        let mut loader = BagLoader::new(data, &bags, stride)?;
        loader.sequential_minibatch(1);

        for b in 0..loader.num_minibatch() {
            let batch = loader.minibatch_data(b, &self.device)?;
            let inf = self.vae.inference(
                &batch.x,
                batch.cat_covs.as_ref(),
                &batch.cont_covs,
                false,
            )?;
            let mu: Vec<Vec<f32>> = inf.mu.to_dtype(DType::F32)?.to_vec2()?;
            for (pos, row) in batch.positions.iter().zip(mu) {
                let r = data.input_row(*pos)?;
                for (k, v) in row.into_iter().enumerate() {
                    latent[(r, k)] = v;
                }
            }
        }
        Ok(latent)
    }

    /// Translate every other modality into `target`
    ///
    /// Cells of one bag when `bag` is given, every cell otherwise; rows
    /// follow the bag-grouped order.
    pub fn impute(
        &self,
        data: &MultimodalData,
        target: &str,
        bag: Option<&str>,
        batch_size: usize,
    ) -> anyhow::Result<ImputedTable> {
        self.require_trained("impute")?;
        self.check_data(data)?;

        let names = &self.config.vae.modality_names;
        let t = names.iter().position(|n| n == target).ok_or_else(|| {
            MultimilError::precondition(format!(
                "unknown target modality `{}`; expected one of {:?}",
                target, names
            ))
        })?;
        let codec = self.vae.codec(t)?;

        let sources: Vec<usize> = (0..self.vae.n_modality())
            .filter(|&i| i != t && self.vae.codecs()[i].is_some())
            .collect();
        if sources.is_empty() {
            return Err(MultimilError::precondition(format!(
                "imputing `{}` needs at least one other modality",
                target
            ))
            .into());
        }

        let bags: Vec<usize> = match bag {
            Some(label) => vec![data.bag_index(label)?],
            None => (0..data.num_bags()?).collect(),
        };
        let mut loader = BagLoader::new(data, &bags, self.stride(batch_size))?;
        loader.sequential_minibatch(1);

        let mut values = Mat::zeros(loader.num_cells(), codec.x_dim());
        let mut rows = Vec::with_capacity(loader.num_cells());

        for b in 0..loader.num_minibatch() {
            let batch = loader.minibatch_data(b, &self.device)?;
            let inf = self.vae.to_latent(
                &batch.x,
                batch.cat_covs.as_ref(),
                &batch.cont_covs,
                &sources,
                false,
            )?;
            let out = self.vae.decode(&inf.z_joint, t, inf.cond.as_ref(), false)?;
            let expected: Vec<Vec<f32>> = out
                .expected_value(&batch.size_factor()?)?
                .to_dtype(DType::F32)?
                .to_vec2()?;
            for (pos, row) in batch.positions.iter().zip(expected) {
                let r = rows.len();
                for (k, v) in row.into_iter().enumerate() {
                    values[(r, k)] = v;
                }
                rows.push(data.input_row(*pos)?);
            }
        }

        Ok(ImputedTable {
            target: target.to_string(),
            source_modalities: sources.iter().map(|&i| names[i].clone()).collect(),
            values,
            barcodes: rows.iter().map(|&r| data.barcodes[r].clone()).collect(),
            bags: rows.iter().map(|&r| data.bags[r].clone()).collect(),
            cell_types: data
                .cell_types
                .as_ref()
                .map(|ct| rows.iter().map(|&r| ct[r].clone()).collect()),
        })
    }

    /// Predictions of every supervised task, one row per bag; each bag
    /// is aggregated over all of its cells
    pub fn predict(&self, data: &MultimodalData) -> anyhow::Result<BagPredictions> {
        self.require_trained("predict")?;
        self.check_data(data)?;
        let mil = self
            .mil
            .as_ref()
            .ok_or_else(|| MultimilError::precondition("predict needs a model with a MIL head"))?;

        let cont_cols = data.continuous_covariate_columns();
        let mut tasks: Vec<String> = vec![];
        for &c in self.layout.class_idx.iter().chain(self.layout.ord_idx.iter()) {
            tasks.push(data.categorical[c].name.clone());
        }
        for &c in self.layout.reg_idx.iter() {
            tasks.push(data.continuous[cont_cols[c]].name.clone());
        }
        let n_class = self.layout.class_idx.len();

        let n_bags = data.num_bags()?;
        let mut values = Vec::with_capacity(n_bags);
        for b in 0..n_bags {
            let positions: Vec<usize> = data
                .bag_ranges(&[b])?
                .into_iter()
                .flatten()
                .collect();
            let mut batch = data.cell_batch(&positions, mil.stride(), &self.device)?;
            batch.layout = BagLayout {
                n_bags: 1,
                bag_len: positions.len(),
            };
            let out = self.forward(&batch, false)?;
            let mil_out = out
                .mil
                .ok_or_else(|| anyhow::anyhow!("missing MIL output"))?;

            let mut row = Vec::with_capacity(tasks.len());
            for (t, pred) in mil_out.predictions.iter().enumerate() {
                if t < n_class {
                    let k = pred.argmax(D::Minus1)?.flatten_all()?.to_vec1::<u32>()?;
                    let levels = &data.categorical[self.layout.class_idx[t]].levels;
                    let k = k.first().copied().unwrap_or(0) as usize;
                    row.push(levels.get(k).cloned().unwrap_or_else(|| k.to_string()));
                } else {
                    let v = pred.flatten_all()?.to_vec1::<f32>()?;
                    row.push(v.first().copied().unwrap_or(f32::NAN).to_string());
                }
            }
            values.push(row);
        }

        Ok(BagPredictions {
            bags: data.bag_labels()?.to_vec(),
            tasks,
            values,
        })
    }

    /// Write `last-model.safetensors`, `history.csv` and `config.json`
    /// into `dir`
    pub fn save(&self, dir: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        let dir = Path::new(dir);
        self.varmap.save(dir.join(MODEL_FILE))?;
        self.history.to_csv(&path_str(&dir.join(HISTORY_FILE))?)?;
        let file = std::fs::File::create(dir.join(CONFIG_FILE))?;
        serde_json::to_writer_pretty(file, &self.config)?;
        info!("saved the model in {}", dir.display());
        Ok(())
    }

    /// Restore parameters (and history, when present) saved by
    /// [`MultiMil::save`] into this model
    pub fn load(&mut self, dir: &str) -> anyhow::Result<()> {
        let dir = Path::new(dir);
        let saved = candle_core::safetensors::load(dir.join(MODEL_FILE), &self.device)?;

        {
            let vars = self
                .varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("parameter map lock poisoned"))?;
            let mut names: Vec<&String> = vars.keys().collect();
            names.sort();

            for name in names.iter() {
                let var = &vars[*name];
                let tensor = saved.get(*name).ok_or_else(|| {
                    MultimilError::precondition(format!("parameter `{}` is missing", name))
                })?;
                if tensor.dims() != var.dims() {
                    return Err(MultimilError::precondition(format!(
                        "parameter `{}` has shape {:?}, the model expects {:?}",
                        name,
                        tensor.dims(),
                        var.dims()
                    ))
                    .into());
                }
            }
            for name in names {
                vars[name].set(&saved[name].to_dtype(vars[name].dtype())?)?;
            }
        }

        let history_file = dir.join(HISTORY_FILE);
        self.history = if history_file.exists() {
            History::from_csv(&path_str(&history_file)?)?
        } else {
            History::new()
        };
        self.is_trained = true;
        info!("loaded the model from {}", dir.display());
        Ok(())
    }

    /// Rebuild a model from `config.json` and load its parameters
    pub fn from_dir(dir: &str, device: &Device) -> anyhow::Result<Self> {
        let file = std::fs::File::open(Path::new(dir).join(CONFIG_FILE))?;
        let config: MultiMilConfig = serde_json::from_reader(std::io::BufReader::new(file))?;
        let mut model = Self::new(config, device)?;
        model.load(dir)?;
        Ok(model)
    }
}

fn path_str(path: &Path) -> anyhow::Result<String> {
    path.to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("non-UTF-8 path {}", path.display()))
}
