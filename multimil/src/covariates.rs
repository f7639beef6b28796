use crate::common::*;
use crate::config::{ContCovType, CovariateLayout, VaeConfig};

use candle_core::{Tensor, D};
use candle_nn::{Embedding, Init, Module, ModuleT, VarBuilder};
use candle_util::candle_aux_layers::{stack_relu_layers, StackLayers};

/// Which covariate an embedding slot came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CovSlot {
    /// index into the full list of categorical columns
    Categorical(usize),
    Continuous,
}

enum ContinuousEmbedding {
    /// `f(x) @ E` with a per-covariate generalized sigmoid `f`
    Sigmoid {
        kind: ContCovType,
        beta: Tensor,
        bias: Tensor,
        weight: Tensor,
    },
    Mlp(StackLayers),
}

impl ContinuousEmbedding {
    fn new(config: &VaeConfig, n_cont: usize, vb: VarBuilder) -> Result<Self> {
        let cond_dim = config.cond_dim;
        match config.cont_cov_type {
            ContCovType::Mlp => Ok(Self::Mlp(stack_relu_layers(
                n_cont,
                cond_dim,
                config.n_layers_cont_embed,
                config.n_hidden_cont_embed,
                config.normalization.into(),
                config.dropout,
                vb.pp("mlp"),
            )?)),
            kind => {
                let beta = vb.get_with_hints((1, n_cont), "beta", Init::Const(1.0))?;
                let bias = vb.get_with_hints((1, n_cont), "bias", Init::Const(0.0))?;
                let weight = vb.get_with_hints(
                    (n_cont, cond_dim),
                    "weight",
                    Init::Randn {
                        mean: 0.0,
                        stdev: 1.0,
                    },
                )?;
                Ok(Self::Sigmoid {
                    kind,
                    beta,
                    bias,
                    weight,
                })
            }
        }
    }

    fn forward_t(&self, cont: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Mlp(mlp) => Ok(mlp.forward_t(cont, train)?),
            Self::Sigmoid {
                kind,
                beta,
                bias,
                weight,
            } => {
                let squashed = match kind {
                    ContCovType::Logsigm => candle_nn::ops::sigmoid(
                        &cont
                            .affine(1.0, 1.0)?
                            .log()?
                            .broadcast_mul(beta)?
                            .broadcast_add(bias)?,
                    )?,
                    ContCovType::Sigm => candle_nn::ops::sigmoid(
                        &cont.broadcast_mul(beta)?.broadcast_add(bias)?,
                    )?,
                    _ => cont.clone(),
                };
                Ok(squashed.matmul(weight)?)
            }
        }
    }
}

/// Learned embeddings of the conditioning covariates, one `cond_dim`
/// slot per categorical column and one shared slot for all continuous
/// columns
pub struct CovariateEmbedding {
    cond_dim: usize,
    n_cat: usize,
    n_cont: usize,
    categorical: Vec<(usize, Embedding)>,
    cont_idx: Option<Tensor>,
    continuous: Option<ContinuousEmbedding>,
}

impl CovariateEmbedding {
    pub fn new(config: &VaeConfig, layout: &CovariateLayout, vb: VarBuilder) -> Result<Self> {
        let categorical = layout
            .cat_cond_idx
            .iter()
            .map(|&c| -> Result<(usize, Embedding)> {
                let n_levels = config.cat_covariate_dims[c];
                let emb =
                    candle_nn::embedding(n_levels, config.cond_dim, vb.pp(format!("cat.{}", c)))?;
                Ok((c, emb))
            })
            .collect::<Result<Vec<_>>>()?;

        let (cont_idx, continuous) = if layout.cont_cond_idx.is_empty() {
            (None, None)
        } else {
            let idx: Vec<u32> = layout.cont_cond_idx.iter().map(|&i| i as u32).collect();
            let idx = Tensor::from_vec(idx, layout.cont_cond_idx.len(), vb.device())?;
            let emb = ContinuousEmbedding::new(config, layout.cont_cond_idx.len(), vb.pp("cont"))?;
            (Some(idx), Some(emb))
        };

        Ok(Self {
            cond_dim: config.cond_dim,
            n_cat: layout.n_cat,
            n_cont: layout.n_cont,
            categorical,
            cont_idx,
            continuous,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.categorical.is_empty() && self.continuous.is_none()
    }

    /// total width of the concatenated embedding
    pub fn width(&self) -> usize {
        self.cond_dim * (self.categorical.len() + usize::from(self.continuous.is_some()))
    }

    /// Check the covariate tensors against the expected widths
    ///
    /// * `cat_covs` - (n, n_cat) codes of every categorical column
    /// * `cont_covs` - (n, n_cont + 1), the size factor in the last column
    pub fn check_widths(&self, cat_covs: Option<&Tensor>, cont_covs: &Tensor) -> Result<()> {
        let cat_width = match cat_covs {
            Some(c) => c.dim(D::Minus1)?,
            None => 0,
        };
        if cat_width != self.n_cat {
            return Err(MultimilError::precondition(format!(
                "categorical covariates have {} columns, expected {}",
                cat_width, self.n_cat
            )));
        }
        let cont_width = cont_covs.dim(D::Minus1)?;
        if cont_width != self.n_cont + 1 {
            return Err(MultimilError::precondition(format!(
                "continuous covariates have {} columns after size-factor exclusion, expected {}",
                cont_width.saturating_sub(1),
                self.n_cont
            )));
        }
        Ok(())
    }

    /// One (n, cond_dim) embedding per conditioning covariate
    pub fn slots(
        &self,
        cat_covs: Option<&Tensor>,
        cont_covs: &Tensor,
        train: bool,
    ) -> Result<Vec<(CovSlot, Tensor)>> {
        self.check_widths(cat_covs, cont_covs)?;
        let mut ret = Vec::with_capacity(self.categorical.len() + 1);

        if let Some(cat_covs) = cat_covs {
            for (c, emb) in self.categorical.iter() {
                let codes = cat_covs.narrow(1, *c, 1)?.squeeze(1)?.contiguous()?;
                ret.push((CovSlot::Categorical(*c), emb.forward(&codes)?));
            }
        }

        if let (Some(idx), Some(emb)) = (self.cont_idx.as_ref(), self.continuous.as_ref()) {
            let cont = cont_covs.index_select(idx, 1)?;
            ret.push((CovSlot::Continuous, emb.forward_t(&cont, train)?));
        }
        Ok(ret)
    }

    /// Concatenated condition embedding (n, width), `None` without
    /// conditioning covariates
    pub fn forward_t(
        &self,
        cat_covs: Option<&Tensor>,
        cont_covs: &Tensor,
        train: bool,
    ) -> Result<Option<Tensor>> {
        let slots = self.slots(cat_covs, cont_covs, train)?;
        if slots.is_empty() {
            return Ok(None);
        }
        let embs: Vec<Tensor> = slots.into_iter().map(|(_, e)| e).collect();
        Ok(Some(Tensor::cat(&embs, 1)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn slots_follow_conditioning_columns() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);

        let mut config = VaeConfig::new(vec![3]);
        config.cat_covariate_dims = vec![2, 4];
        config.n_cont_covariates = 1;
        config.cond_dim = 5;
        let layout = CovariateLayout::new(&config, None)?;
        let emb = CovariateEmbedding::new(&config, &layout, vb)?;
        assert_eq!(emb.width(), 15);

        let cat = Tensor::from_vec(vec![0u32, 3, 1, 2], (2, 2), &dev)?;
        let cont = Tensor::from_vec(vec![0.5f32, 100.0, 2.0, 50.0], (2, 2), &dev)?;
        let slots = emb.slots(Some(&cat), &cont, false)?;
        let kinds: Vec<CovSlot> = slots.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                CovSlot::Categorical(0),
                CovSlot::Categorical(1),
                CovSlot::Continuous
            ]
        );
        assert_eq!(emb.forward_t(Some(&cat), &cont, false)?.unwrap().dims(), &[2, 15]);

        // missing size-factor column
        let bad = Tensor::from_vec(vec![0.5f32, 2.0], (2, 1), &dev)?;
        assert!(matches!(
            emb.slots(Some(&cat), &bad, false),
            Err(MultimilError::Precondition(_))
        ));
        Ok(())
    }
}
