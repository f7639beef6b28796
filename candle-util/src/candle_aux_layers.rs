use candle_core::{Result, Tensor};
use candle_nn::{Activation, BatchNorm, Dropout, LayerNorm, Linear, Module, ModuleT, VarBuilder};

/// Normalization applied after each fully connected layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Normalization {
    Layer,
    Batch,
    None,
}

#[derive(Clone, Debug)]
pub enum NormLayer {
    Layer(LayerNorm),
    Batch(BatchNorm),
}

impl NormLayer {
    pub fn new(norm: Normalization, dim: usize, vb: VarBuilder) -> Result<Option<Self>> {
        match norm {
            Normalization::Layer => Ok(Some(Self::Layer(candle_nn::layer_norm(dim, 1e-5, vb)?))),
            Normalization::Batch => {
                let bn_config = candle_nn::BatchNormConfig {
                    eps: 1e-4,
                    remove_mean: true,
                    affine: true,
                    momentum: 0.1,
                };
                Ok(Some(Self::Batch(candle_nn::batch_norm(dim, bn_config, vb)?)))
            }
            Normalization::None => Ok(None),
        }
    }
}

impl ModuleT for NormLayer {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Layer(ln) => ln.forward(x),
            Self::Batch(bn) => {
                // batch norm wants (N, C); fold any leading dims into N
                if x.rank() > 2 {
                    let dims = x.dims().to_vec();
                    let d = dims[dims.len() - 1];
                    let x_nd = x.reshape(((), d))?;
                    bn.forward_t(&x_nd, train)?.reshape(dims)
                } else {
                    bn.forward_t(x, train)
                }
            }
        }
    }
}

/// linear -> norm -> activation -> dropout
#[derive(Clone, Debug)]
pub struct FcBlock {
    linear: Linear,
    norm: Option<NormLayer>,
    activation: Option<Activation>,
    dropout: Option<Dropout>,
}

impl FcBlock {
    pub fn weight(&self) -> &Tensor {
        self.linear.weight()
    }
}

impl ModuleT for FcBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = self.linear.forward(x)?;
        if let Some(norm) = &self.norm {
            h = norm.forward_t(&h, train)?;
        }
        if let Some(act) = &self.activation {
            h = act.forward(&h)?;
        }
        if let Some(dropout) = &self.dropout {
            h = dropout.forward_t(&h, train)?;
        }
        Ok(h)
    }
}

/// How to build a stack of fully connected layers
#[derive(Clone, Copy, Debug)]
pub struct StackConfig {
    pub norm: Normalization,
    pub dropout: f32,
    pub hidden_activation: Activation,
    pub output_activation: Option<Activation>,
    /// apply normalization and dropout to the output layer as well
    pub regularize_last_layer: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            norm: Normalization::Layer,
            dropout: 0.2,
            hidden_activation: Activation::LeakyRelu(0.01),
            output_activation: None,
            regularize_last_layer: false,
        }
    }
}

/// build a stack of alternating `Linear` and activation layers
#[derive(Clone, Debug)]
pub struct StackLayers {
    blocks: Vec<FcBlock>,
    in_dim: usize,
    out_dim: usize,
}

impl ModuleT for StackLayers {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for block in self.blocks.iter() {
            x = block.forward_t(&x, train)?;
        }
        Ok(x)
    }
}

impl StackLayers {
    /// Will create variables:
    ///
    /// * `fc.{}.weight`, `fc.{}.bias` where {} is the layer index
    /// * `fc.{}.norm.*` if normalization is requested
    ///
    /// # Arguments
    /// * `in_dim` - input dimension
    /// * `out_dim` - output dimension
    /// * `hiddens` - hidden layer dimensions (possibly empty)
    /// * `config` - normalization, dropout and activations
    /// * `vb` - variable builder
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        hiddens: &[usize],
        config: &StackConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut blocks = Vec::with_capacity(hiddens.len() + 1);
        let mut prev_dim = in_dim;

        let make_dropout = |p: f32| if p > 0.0 { Some(Dropout::new(p)) } else { None };

        for (j, &next_dim) in hiddens.iter().enumerate() {
            let vb_j = vb.pp(format!("fc.{}", j));
            blocks.push(FcBlock {
                linear: candle_nn::linear(prev_dim, next_dim, vb_j.clone())?,
                norm: NormLayer::new(config.norm, next_dim, vb_j.pp("norm"))?,
                activation: Some(config.hidden_activation),
                dropout: make_dropout(config.dropout),
            });
            prev_dim = next_dim;
        }

        let vb_out = vb.pp(format!("fc.{}", hiddens.len()));
        let (norm, dropout) = if config.regularize_last_layer {
            (
                NormLayer::new(config.norm, out_dim, vb_out.pp("norm"))?,
                make_dropout(config.dropout),
            )
        } else {
            (None, None)
        };

        blocks.push(FcBlock {
            linear: candle_nn::linear(prev_dim, out_dim, vb_out)?,
            norm,
            activation: config.output_activation,
            dropout,
        });

        Ok(Self {
            blocks,
            in_dim,
            out_dim,
        })
    }

    /// Weight matrix (out x in) of the first fully connected layer
    pub fn first_weight(&self) -> &Tensor {
        self.blocks[0].weight()
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn dim_in(&self) -> usize {
        self.in_dim
    }

    pub fn dim_out(&self) -> usize {
        self.out_dim
    }
}

/// `n_layers` fully connected layers of width `n_hidden`, the last one
/// projecting onto `out_dim`, every layer normalized and activated.
pub fn stack_relu_layers(
    in_dim: usize,
    out_dim: usize,
    n_layers: usize,
    n_hidden: usize,
    norm: Normalization,
    dropout: f32,
    vb: VarBuilder,
) -> Result<StackLayers> {
    let hiddens = vec![n_hidden; n_layers.max(1) - 1];
    let config = StackConfig {
        norm,
        dropout,
        hidden_activation: Activation::Relu,
        output_activation: Some(Activation::Relu),
        regularize_last_layer: true,
    };
    StackLayers::new(in_dim, out_dim, &hiddens, &config, vb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn stack_layers_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);

        let config = StackConfig {
            norm: Normalization::Batch,
            ..Default::default()
        };
        let stack = StackLayers::new(7, 3, &[16, 8], &config, vb.pp("enc"))?;
        assert_eq!(stack.num_layers(), 3);
        assert_eq!(stack.first_weight().dims(), &[16, 7]);

        let x = Tensor::randn(0f32, 1f32, (5, 7), &dev)?;
        assert_eq!(stack.forward_t(&x, true)?.dims(), &[5, 3]);

        // leading batch dims are carried through
        let x = Tensor::randn(0f32, 1f32, (2, 5, 7), &dev)?;
        assert_eq!(stack.forward_t(&x, false)?.dims(), &[2, 5, 3]);
        Ok(())
    }
}
