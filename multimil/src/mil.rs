use crate::aggregator::*;
use crate::common::*;
use crate::config::{CovariateLayout, MilConfig, VaeConfig};
use crate::covariates::{CovSlot, CovariateEmbedding};

use candle_core::{DType, Tensor, D};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};
use candle_util::candle_aux_layers::{stack_relu_layers, Normalization, StackLayers};

/// Linear head, or an MLP followed by a linear projection
enum Head {
    Linear(Linear),
    Mlp(StackLayers, Linear),
}

impl Head {
    fn new(
        in_dim: usize,
        out_dim: usize,
        n_layers: usize,
        n_hidden: usize,
        norm: Normalization,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if n_layers <= 1 {
            Ok(Self::Linear(candle_nn::linear(in_dim, out_dim, vb)?))
        } else {
            let mlp = stack_relu_layers(
                in_dim,
                n_hidden,
                n_layers - 1,
                n_hidden,
                norm,
                dropout,
                vb.pp("mlp"),
            )?;
            Ok(Self::Mlp(mlp, candle_nn::linear(n_hidden, out_dim, vb.pp("out"))?))
        }
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        Ok(match self {
            Self::Linear(l) => l.forward(x)?,
            Self::Mlp(mlp, l) => l.forward(&mlp.forward_t(x, train)?)?,
        })
    }
}

/// Bag-level outputs of the MIL part
pub struct MilOutput {
    pub layout: BagLayout,
    /// (n_bags, cond_dim) input of the heads
    pub bag_embedding: Tensor,
    /// one tensor per task: classifiers (n_bags, n_classes) first,
    /// then ordinal and regression heads (n_bags, 1)
    pub predictions: Vec<Tensor>,
    /// (n_bags, bag_len) cell attention
    pub cell_attention: Option<Tensor>,
    /// (n_bags, n_slots) attention over the molecular and covariate slots
    pub cov_attention: Option<Tensor>,
}

/// Supervised loss terms of one minibatch
pub struct MilLoss {
    pub classification: Tensor,
    pub regression: Tensor,
    /// mean exact-match accuracy over classification tasks
    pub accuracy: Option<f32>,
}

/// Cell-to-bag aggregation with supervised heads
pub struct MilModule {
    config: MilConfig,
    layout: CovariateLayout,
    cell_mlp: StackLayers,
    cell_aggregator: Aggregator,
    cov_level: Option<(StackLayers, Aggregator)>,
    classifiers: Vec<Head>,
    regressors: Vec<Head>,
}

impl MilModule {
    /// Will create variables:
    ///
    /// * `cell.mlp.*`, `cell.aggr.*` cell-level aggregation
    /// * `cov.mlp.*`, `cov.aggr.*` covariate-level aggregation
    /// * `classifier.{}.*`, `regressor.{}.*` heads
    pub fn new(
        config: &MilConfig,
        vae: &VaeConfig,
        layout: &CovariateLayout,
        vb: VarBuilder,
    ) -> Result<Self> {
        if config.patient_batch_size == 0 {
            return Err(MultimilError::config("patient_batch_size must be positive"));
        }
        if config.scoring != crate::config::Scoring::Sum && config.attn_dim == 0 {
            return Err(MultimilError::config("attn_dim must be positive"));
        }

        let norm: Normalization = vae.normalization.into();
        let cond_dim = vae.cond_dim;

        let aggr_args = |scale: bool| AggregatorArgs {
            n_input: cond_dim,
            scoring: config.scoring,
            attn_dim: config.attn_dim,
            stride: config.patient_batch_size,
            scale,
            attention_dropout: config.attention_dropout,
            drop_attn: config.drop_attn,
            dropout: vae.dropout,
            n_layers_mlp_attn: config.n_layers_mlp_attn,
            n_hidden_mlp_attn: config.n_hidden_mlp_attn,
            normalization: norm,
        };

        let cell_mlp = stack_relu_layers(
            vae.z_dim,
            cond_dim,
            config.n_layers_cell_aggregator,
            config.n_hidden_cell_aggregator,
            norm,
            vae.dropout,
            vb.pp("cell.mlp"),
        )?;
        let cell_aggregator = Aggregator::new(&aggr_args(true), vb.pp("cell.aggr"))?;

        let cov_level = if config.hierarchical_attn {
            let mlp = stack_relu_layers(
                cond_dim,
                cond_dim,
                config.n_layers_cov_aggregator,
                config.n_hidden_cov_aggregator,
                norm,
                vae.dropout,
                vb.pp("cov.mlp"),
            )?;
            let aggr = Aggregator::new(&aggr_args(false), vb.pp("cov.aggr"))?;
            Some((mlp, aggr))
        } else {
            None
        };

        let classifiers = layout
            .class_idx
            .iter()
            .enumerate()
            .map(|(t, &c)| {
                Head::new(
                    cond_dim,
                    vae.cat_covariate_dims[c],
                    config.n_layers_classifier,
                    config.n_hidden_classifier,
                    norm,
                    vae.dropout,
                    vb.pp(format!("classifier.{}", t)),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let regressors = (0..layout.ord_idx.len() + layout.reg_idx.len())
            .map(|t| {
                Head::new(
                    cond_dim,
                    1,
                    config.n_layers_regressor,
                    config.n_hidden_regressor,
                    norm,
                    vae.dropout,
                    vb.pp(format!("regressor.{}", t)),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config: config.clone(),
            layout: layout.clone(),
            cell_mlp,
            cell_aggregator,
            cov_level,
            classifiers,
            regressors,
        })
    }

    pub fn config(&self) -> &MilConfig {
        &self.config
    }

    pub fn stride(&self) -> usize {
        self.config.patient_batch_size
    }

    pub fn num_classifiers(&self) -> usize {
        self.classifiers.len()
    }

    fn keep_slot(&self, slot: CovSlot) -> bool {
        match slot {
            CovSlot::Categorical(c) => {
                self.config.add_patient_to_classifier || Some(c) != self.config.patient_idx
            }
            CovSlot::Continuous => true,
        }
    }

    /// Aggregate the joint latent per bag and apply every head
    ///
    /// * `z_joint` - (n, z) rows grouped by bag, `n` fitting `layout`
    pub fn forward_t(
        &self,
        z_joint: &Tensor,
        covariates: &CovariateEmbedding,
        cat_covs: Option<&Tensor>,
        cont_covs: &Tensor,
        layout: &BagLayout,
        train: bool,
    ) -> Result<MilOutput> {
        let cells = split_bags(&self.cell_mlp.forward_t(z_joint, train)?, layout)?;
        let (zs, cell_attention) = self.cell_aggregator.forward_t(&cells, train)?;

        let (bag_embedding, cov_attention) = match &self.cov_level {
            Some((mlp, aggr)) => {
                let first = Tensor::from_vec(layout.first_rows(), layout.n_bags, z_joint.device())?;
                let mut slots = vec![zs];
                for (slot, emb) in covariates.slots(cat_covs, cont_covs, train)? {
                    if self.keep_slot(slot) {
                        slots.push(emb.index_select(&first, 0)?);
                    }
                }
                // (n_bags, 1 + n_covariate_slots, cond_dim)
                let stacked = Tensor::stack(&slots, 1)?;
                let (emb, attn) = aggr.forward_t(&mlp.forward_t(&stacked, train)?, train)?;
                (emb, attn)
            }
            None => (zs, None),
        };

        let mut predictions = Vec::with_capacity(self.classifiers.len() + self.regressors.len());
        for head in self.classifiers.iter().chain(self.regressors.iter()) {
            predictions.push(head.forward_t(&bag_embedding, train)?);
        }

        Ok(MilOutput {
            layout: *layout,
            bag_embedding,
            predictions,
            cell_attention,
            cov_attention,
        })
    }

    /// Cross-entropy over classification tasks and squared error over
    /// ordinal and regression tasks; targets come from the first cell of
    /// each bag
    pub fn loss(
        &self,
        output: &MilOutput,
        cat_covs: Option<&Tensor>,
        cont_covs: &Tensor,
    ) -> Result<MilLoss> {
        let dev = cont_covs.device();
        let first = Tensor::from_vec(output.layout.first_rows(), output.layout.n_bags, dev)?;
        let zero = Tensor::new(0f32, dev)?;

        let bag_cat = match cat_covs {
            Some(c) => Some(c.index_select(&first, 0)?),
            None => None,
        };
        let require_cat = || {
            bag_cat.as_ref().ok_or_else(|| {
                MultimilError::precondition("classification targets need categorical covariates")
            })
        };

        let mut classification = zero.clone();
        let mut accuracies = vec![];
        for (t, &c) in self.layout.class_idx.iter().enumerate() {
            let target = require_cat()?.narrow(1, c, 1)?.squeeze(1)?.contiguous()?;
            let logits = &output.predictions[t];
            classification =
                (classification + candle_nn::loss::cross_entropy(logits, &target)?)?;
            let hits = logits
                .argmax(D::Minus1)?
                .eq(&target)?
                .to_dtype(DType::F32)?
                .mean_all()?
                .to_scalar::<f32>()?;
            accuracies.push(hits);
        }
        let accuracy = if accuracies.is_empty() {
            None
        } else {
            Some(accuracies.iter().sum::<f32>() / accuracies.len() as f32)
        };

        let n_class = self.layout.class_idx.len();
        let mut regression = zero;
        for (t, &c) in self.layout.ord_idx.iter().enumerate() {
            let target = require_cat()?
                .narrow(1, c, 1)?
                .squeeze(1)?
                .to_dtype(DType::F32)?;
            let pred = output.predictions[n_class + t].squeeze(1)?;
            regression = (regression + candle_nn::loss::mse(&pred, &target)?)?;
        }
        let n_ord = self.layout.ord_idx.len();
        if !self.layout.reg_idx.is_empty() {
            let bag_cont = cont_covs.index_select(&first, 0)?;
            for (t, &c) in self.layout.reg_idx.iter().enumerate() {
                let target = bag_cont.narrow(1, c, 1)?.squeeze(1)?;
                let pred = output.predictions[n_class + n_ord + t].squeeze(1)?;
                regression = (regression + candle_nn::loss::mse(&pred, &target)?)?;
            }
        }

        Ok(MilLoss {
            classification,
            regression,
            accuracy,
        })
    }

    /// Weights selected for the orthogonality penalty
    pub fn regularized_weights(&self) -> Vec<Tensor> {
        let mut ret = vec![];
        if self.config.regularize_cov_attn {
            if let Some((_, aggr)) = &self.cov_level {
                ret.extend(aggr.scorer_weights());
            }
        }
        if self.config.regularize_cell_attn {
            ret.extend(self.cell_aggregator.scorer_weights());
        }
        ret
    }
}

/// `Σ sqrt(Σ (WᵀW - I)²)` over the given (out, in) weight matrices
pub fn orthogonal_regularization(weights: &[Tensor], device: &candle_core::Device) -> Result<Tensor> {
    let mut loss = Tensor::new(0f32, device)?;
    for w in weights {
        let dim = w.dim(1)?;
        let gram = w.t()?.contiguous()?.matmul(w)?;
        let eye = Tensor::eye(dim, w.dtype(), w.device())?;
        let dev = (gram - eye)?.sqr()?.sum_all()?.sqrt()?;
        loss = (loss + dev)?;
    }
    Ok(loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn orthonormal_columns_have_no_penalty() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::eye(3, DType::F32, &dev)?;
        let zero = orthogonal_regularization(&[w], &dev)?.to_scalar::<f32>()?;
        assert_abs_diff_eq!(zero, 0.0);

        let w = (Tensor::eye(2, DType::F32, &dev)? * 2.0)?;
        let v = orthogonal_regularization(&[w], &dev)?.to_scalar::<f32>()?;
        // WᵀW - I = 3 I
        assert_abs_diff_eq!(v, (18f32).sqrt(), epsilon = 1e-5);
        Ok(())
    }
}
