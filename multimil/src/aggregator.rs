use crate::common::*;
use crate::config::Scoring;

use candle_core::{Tensor, D};
use candle_nn::{Activation, Dropout, Linear, Module, ModuleT, VarBuilder};
use candle_util::candle_aux_layers::{Normalization, StackConfig, StackLayers};

/// How a minibatch of `n` cells splits into bags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BagLayout {
    pub n_bags: usize,
    pub bag_len: usize,
}

impl BagLayout {
    /// `n / stride` bags of `stride` cells, or a single bag of `n` cells
    /// when `n` is not a multiple of `stride`
    pub fn from_stride(n: usize, stride: usize) -> Self {
        if stride == 0 || n % stride != 0 || n == 0 {
            Self {
                n_bags: 1,
                bag_len: n,
            }
        } else {
            Self {
                n_bags: n / stride,
                bag_len: stride,
            }
        }
    }

    /// Validate the bag membership of a minibatch before aggregation
    ///
    /// A batch drawn from one bag follows [`BagLayout::from_stride`].
    /// Otherwise the batch is cut into slices of `stride` cells and each
    /// slice must come from a single bag; slices of the same bag need not
    /// sit next to each other.
    pub fn from_bag_ids<T: PartialEq + std::fmt::Debug>(ids: &[T], stride: usize) -> Result<Self> {
        let first = ids
            .first()
            .ok_or_else(|| MultimilError::precondition("empty minibatch"))?;

        if ids.iter().all(|id| id == first) {
            return Ok(Self::from_stride(ids.len(), stride));
        }

        if stride == 0 || ids.len() % stride != 0 {
            return Err(MultimilError::precondition(format!(
                "a minibatch of {} cells spanning several bags needs a multiple of {} cells",
                ids.len(),
                stride
            )));
        }

        for (s, slice) in ids.chunks(stride).enumerate() {
            if let Some(other) = slice.iter().find(|id| *id != &slice[0]) {
                return Err(MultimilError::precondition(format!(
                    "slice {} of the minibatch mixes bags {:?} and {:?}",
                    s, slice[0], other
                )));
            }
        }

        Ok(Self {
            n_bags: ids.len() / stride,
            bag_len: stride,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.n_bags * self.bag_len
    }

    /// row of the first cell of every bag
    pub fn first_rows(&self) -> Vec<u32> {
        (0..self.n_bags).map(|b| (b * self.bag_len) as u32).collect()
    }
}

enum Scorer {
    Sum,
    Attn {
        v: Linear,
        dropout: Option<Dropout>,
        w: Linear,
    },
    Gated {
        v: Linear,
        u: Linear,
        dropout: Option<Dropout>,
        w: Linear,
    },
    Mlp(StackLayers),
}

/// Settings of one aggregator
#[derive(Clone, Debug)]
pub struct AggregatorArgs {
    pub n_input: usize,
    pub scoring: Scoring,
    pub attn_dim: usize,
    /// cells per bag the weights are rescaled against
    pub stride: usize,
    pub scale: bool,
    pub attention_dropout: bool,
    pub drop_attn: bool,
    pub dropout: f32,
    pub n_layers_mlp_attn: usize,
    pub n_hidden_mlp_attn: usize,
    pub normalization: Normalization,
}

/// Pools an ordered set of embeddings per bag into one embedding
pub struct Aggregator {
    scorer: Scorer,
    stride: usize,
    scale: bool,
    weight_dropout: Option<Dropout>,
}

impl Aggregator {
    pub fn new(args: &AggregatorArgs, vb: VarBuilder) -> Result<Self> {
        let dropout = if args.attention_dropout && args.dropout > 0.0 {
            Some(Dropout::new(args.dropout))
        } else {
            None
        };

        let scorer = match args.scoring {
            Scoring::Sum => Scorer::Sum,
            Scoring::Attn => Scorer::Attn {
                v: candle_nn::linear(args.n_input, args.attn_dim, vb.pp("attention_v"))?,
                dropout,
                w: candle_nn::linear_no_bias(args.attn_dim, 1, vb.pp("attention_w"))?,
            },
            Scoring::GatedAttn => Scorer::Gated {
                v: candle_nn::linear(args.n_input, args.attn_dim, vb.pp("attention_v"))?,
                u: candle_nn::linear(args.n_input, args.attn_dim, vb.pp("attention_u"))?,
                dropout,
                w: candle_nn::linear_no_bias(args.attn_dim, 1, vb.pp("attention_w"))?,
            },
            Scoring::Mlp => {
                let hiddens = vec![args.n_hidden_mlp_attn; args.n_layers_mlp_attn.max(1) - 1];
                let config = StackConfig {
                    norm: args.normalization,
                    dropout: args.dropout,
                    hidden_activation: Activation::Relu,
                    output_activation: None,
                    regularize_last_layer: false,
                };
                Scorer::Mlp(StackLayers::new(
                    args.n_input,
                    1,
                    &hiddens,
                    &config,
                    vb.pp("attention"),
                )?)
            }
        };

        let weight_dropout = if args.drop_attn && args.dropout > 0.0 {
            Some(Dropout::new(args.dropout))
        } else {
            None
        };

        Ok(Self {
            scorer,
            stride: args.stride,
            scale: args.scale,
            weight_dropout,
        })
    }

    /// Pool `x` of shape (n_bags, bag_len, d) into (n_bags, d)
    ///
    /// Returns the bag embeddings and, for attention scorers, the
    /// softmax-normalized weights (n_bags, bag_len) before rescaling and
    /// dropout.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<(Tensor, Option<Tensor>)> {
        let scores = match &self.scorer {
            Scorer::Sum => return Ok((x.sum(1)?, None)),
            Scorer::Attn { v, dropout, w } => {
                let mut h = v.forward(x)?.tanh()?;
                if let Some(d) = dropout {
                    h = d.forward_t(&h, train)?;
                }
                w.forward(&h)?
            }
            Scorer::Gated { v, u, dropout, w } => {
                let mut a_v = v.forward(x)?.tanh()?;
                let mut a_u = candle_nn::ops::sigmoid(&u.forward(x)?)?;
                if let Some(d) = dropout {
                    a_v = d.forward_t(&a_v, train)?;
                    a_u = d.forward_t(&a_u, train)?;
                }
                w.forward(&a_v.mul(&a_u)?)?
            }
            Scorer::Mlp(mlp) => mlp.forward_t(x, train)?,
        };

        // (n_bags, bag_len, 1) -> (n_bags, 1, bag_len)
        let weights = candle_nn::ops::softmax(&scores.transpose(1, 2)?.contiguous()?, D::Minus1)?;

        let mut pooled_weights = weights.clone();
        if self.scale {
            let bag_len = x.dim(1)?;
            pooled_weights = (pooled_weights * (bag_len as f64 / self.stride.max(1) as f64))?;
        }
        if let Some(d) = &self.weight_dropout {
            pooled_weights = d.forward_t(&pooled_weights, train)?;
        }

        let emb = pooled_weights.matmul(&x.contiguous()?)?.squeeze(1)?;
        Ok((emb, Some(weights.squeeze(1)?)))
    }

    /// first layer weights of the scoring network
    pub fn scorer_weights(&self) -> Vec<Tensor> {
        match &self.scorer {
            Scorer::Sum => vec![],
            Scorer::Attn { v, .. } => vec![v.weight().clone()],
            Scorer::Gated { v, u, .. } => vec![u.weight().clone(), v.weight().clone()],
            Scorer::Mlp(mlp) => vec![mlp.first_weight().clone()],
        }
    }
}

/// Reshape (n, d) rows into (n_bags, bag_len, d)
pub fn split_bags(z: &Tensor, layout: &BagLayout) -> Result<Tensor> {
    let (n, d) = z.dims2()?;
    if n != layout.n_cells() {
        return Err(MultimilError::precondition(format!(
            "{} rows do not fit {} bags of {} cells",
            n, layout.n_bags, layout.bag_len
        )));
    }
    Ok(z.reshape((layout.n_bags, layout.bag_len, d))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn args(scoring: Scoring) -> AggregatorArgs {
        AggregatorArgs {
            n_input: 4,
            scoring,
            attn_dim: 8,
            stride: 3,
            scale: false,
            attention_dropout: true,
            drop_attn: false,
            dropout: 0.2,
            n_layers_mlp_attn: 2,
            n_hidden_mlp_attn: 5,
            normalization: Normalization::Layer,
        }
    }

    #[test]
    fn irregular_batches_are_one_bag() {
        assert_eq!(
            BagLayout::from_stride(12, 4),
            BagLayout {
                n_bags: 3,
                bag_len: 4
            }
        );
        assert_eq!(
            BagLayout::from_stride(7, 4),
            BagLayout {
                n_bags: 1,
                bag_len: 7
            }
        );
    }

    #[test]
    fn slices_mixing_bags_are_rejected() {
        assert!(BagLayout::from_bag_ids(&["a", "b", "b", "a"], 2).is_err());
        assert!(BagLayout::from_bag_ids(&["a", "a", "a", "b"], 2).is_err());
        assert!(BagLayout::from_bag_ids(&["a", "a", "b"], 2).is_err());
        // pieces of one bag may be separated by another bag's piece
        assert_eq!(
            BagLayout::from_bag_ids(&["a", "a", "b", "b", "a", "a"], 2).unwrap(),
            BagLayout {
                n_bags: 3,
                bag_len: 2
            }
        );
        assert_eq!(
            BagLayout::from_bag_ids(&["a", "a", "b", "b"], 2).unwrap(),
            BagLayout {
                n_bags: 2,
                bag_len: 2
            }
        );
        assert_eq!(
            BagLayout::from_bag_ids(&[7, 7, 7], 2).unwrap(),
            BagLayout {
                n_bags: 1,
                bag_len: 3
            }
        );
    }

    #[test]
    fn every_scorer_pools_to_bag_width() -> Result<()> {
        let dev = Device::Cpu;
        for scoring in [Scoring::Sum, Scoring::Attn, Scoring::GatedAttn, Scoring::Mlp] {
            let vm = VarMap::new();
            let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
            let aggr = Aggregator::new(&args(scoring), vb)?;
            let x = Tensor::randn(0f32, 1f32, (2, 3, 4), &dev)?;
            let (emb, weights) = aggr.forward_t(&x, true)?;
            assert_eq!(emb.dims(), &[2, 4]);
            assert_eq!(weights.is_some(), scoring != Scoring::Sum);
        }
        Ok(())
    }
}
