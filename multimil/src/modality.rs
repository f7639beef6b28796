use crate::common::*;
use crate::config::{LossFamily, OutputActivation, VaeConfig};

use candle_core::Tensor;
use candle_nn::{Init, Linear, Module, ModuleT, VarBuilder};
use candle_util::candle_aux_layers::StackLayers;
use candle_util::candle_loss_functions::*;

/// Raw decoder output of one modality, shaped by its loss family
pub enum ModalityOutput {
    Gaussian { mean: Tensor },
    Bernoulli { logits: Tensor },
    /// `scale` sums to one over features; multiply by the size factor
    NegBinomial { scale: Tensor },
    Zinb { scale: Tensor, dropout_logits: Tensor },
}

impl ModalityOutput {
    pub fn family(&self) -> LossFamily {
        match self {
            Self::Gaussian { .. } => LossFamily::Gaussian,
            Self::Bernoulli { .. } => LossFamily::Bernoulli,
            Self::NegBinomial { .. } => LossFamily::NegBinomial,
            Self::Zinb { .. } => LossFamily::Zinb,
        }
    }

    /// the main output tensor (mean, logits or normalized scale)
    pub fn raw(&self) -> &Tensor {
        match self {
            Self::Gaussian { mean } => mean,
            Self::Bernoulli { logits } => logits,
            Self::NegBinomial { scale } | Self::Zinb { scale, .. } => scale,
        }
    }

    /// Expected feature values
    ///
    /// * `size_factor` - (n, 1) per-cell library size, used by count families
    pub fn expected_value(&self, size_factor: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::Gaussian { mean } => mean.clone(),
            Self::Bernoulli { logits } => candle_nn::ops::sigmoid(logits)?,
            Self::NegBinomial { scale } => scale.broadcast_mul(size_factor)?,
            Self::Zinb {
                scale,
                dropout_logits,
            } => {
                let keep = candle_nn::ops::sigmoid(dropout_logits)?.affine(-1.0, 1.0)?;
                scale.broadcast_mul(size_factor)?.mul(&keep)?
            }
        })
    }
}

enum DecoderHead {
    Gaussian(Linear, Option<candle_nn::Activation>),
    Bernoulli(Linear),
    NegBinomial(Linear),
    Zinb(Linear, Linear),
}

/// Encoder, posterior heads and decoder of one modality
pub struct ModalityCodec {
    x_dim: usize,
    family: LossFamily,
    condition_encoder: bool,
    condition_decoder: bool,
    encoder: StackLayers,
    mu: Linear,
    logvar: Linear,
    decoder_body: Option<StackLayers>,
    head: DecoderHead,
    theta: Option<Tensor>,
}

impl ModalityCodec {
    /// Will create variables under `vb`:
    ///
    /// * `enc.fc.{}.*` encoder layers
    /// * `mu.*`, `logvar.*` posterior heads
    /// * `dec.fc.{}.*` decoder body (reversed encoder hiddens)
    /// * `head.*` loss-family head, `theta` for count families
    ///
    /// # Arguments
    /// * `i` - modality index in `config`
    /// * `cond_width` - width of the condition embedding
    /// * `dec_in` - width of the shared decoder output
    pub fn new(
        config: &VaeConfig,
        i: usize,
        cond_width: usize,
        dec_in: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let x_dim = config.modality_lengths[i];
        let family = config.losses[i];
        let hiddens = &config.hiddens[i];
        let z_dim = config.z_dim;

        let condition_encoder = config.condition_encoders && cond_width > 0;
        let condition_decoder = config.condition_decoders && cond_width > 0;

        let enc_in = x_dim + if condition_encoder { cond_width } else { 0 };
        let enc_config = config.stack_config(Some(candle_nn::Activation::LeakyRelu(0.01)));
        let encoder = StackLayers::new(enc_in, z_dim, hiddens, &enc_config, vb.pp("enc"))?;

        let mu = candle_nn::linear(z_dim, z_dim, vb.pp("mu"))?;
        let logvar = candle_nn::linear(z_dim, z_dim, vb.pp("logvar"))?;

        let dec_in = dec_in + if condition_decoder { cond_width } else { 0 };
        let reversed: Vec<usize> = hiddens.iter().rev().copied().collect();
        let (decoder_body, head_in) = match reversed.split_last() {
            Some((&last, inner)) => {
                let body_config =
                    config.stack_config(Some(candle_nn::Activation::LeakyRelu(0.01)));
                let body = StackLayers::new(dec_in, last, inner, &body_config, vb.pp("dec"))?;
                (Some(body), last)
            }
            None => (None, dec_in),
        };

        let vb_head = vb.pp("head");
        let head = match family {
            LossFamily::Gaussian => DecoderHead::Gaussian(
                candle_nn::linear(head_in, x_dim, vb_head)?,
                config.output_activations[i].activation(),
            ),
            LossFamily::Bernoulli => {
                if config.output_activations[i] != OutputActivation::Linear {
                    warn!(
                        "modality {}: output activation is ignored for bernoulli logits",
                        config.modality_names[i]
                    );
                }
                DecoderHead::Bernoulli(candle_nn::linear(head_in, x_dim, vb_head)?)
            }
            LossFamily::NegBinomial => {
                DecoderHead::NegBinomial(candle_nn::linear(head_in, x_dim, vb_head)?)
            }
            LossFamily::Zinb => DecoderHead::Zinb(
                candle_nn::linear(head_in, x_dim, vb_head.pp("scale"))?,
                candle_nn::linear(head_in, x_dim, vb_head.pp("dropout"))?,
            ),
        };

        let theta = if family.is_count() {
            Some(vb.get_with_hints(
                (config.num_groups(), x_dim),
                "theta",
                Init::Randn {
                    mean: 0.0,
                    stdev: 1.0,
                },
            )?)
        } else {
            None
        };

        Ok(Self {
            x_dim,
            family,
            condition_encoder,
            condition_decoder,
            encoder,
            mu,
            logvar,
            decoder_body,
            head,
            theta,
        })
    }

    pub fn x_dim(&self) -> usize {
        self.x_dim
    }

    pub fn family(&self) -> LossFamily {
        self.family
    }

    /// Posterior (mu, logvar) of this modality alone; logvar is clamped
    /// to [-8, 8]
    pub fn encode(
        &self,
        x: &Tensor,
        cond: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let h = match cond {
            Some(c) if self.condition_encoder => self.encoder.forward_t(&Tensor::cat(&[x, c], 1)?, train)?,
            _ => self.encoder.forward_t(x, train)?,
        };
        let mu = self.mu.forward(&h)?;
        let logvar = self.logvar.forward(&h)?.clamp(-8f32, 8f32)?;
        Ok((mu, logvar))
    }

    /// Decode a shared-decoder hidden code into this modality
    pub fn decode(&self, h: &Tensor, cond: Option<&Tensor>, train: bool) -> Result<ModalityOutput> {
        let h = match cond {
            Some(c) if self.condition_decoder => Tensor::cat(&[h, c], 1)?,
            _ => h.clone(),
        };
        let h = match self.decoder_body.as_ref() {
            Some(body) => body.forward_t(&h, train)?,
            None => h,
        };

        Ok(match &self.head {
            DecoderHead::Gaussian(linear, act) => {
                let mean = linear.forward(&h)?;
                let mean = match act {
                    Some(act) => act.forward(&mean)?,
                    None => mean,
                };
                ModalityOutput::Gaussian { mean }
            }
            DecoderHead::Bernoulli(linear) => ModalityOutput::Bernoulli {
                logits: linear.forward(&h)?,
            },
            DecoderHead::NegBinomial(linear) => ModalityOutput::NegBinomial {
                scale: candle_nn::ops::softmax_last_dim(&linear.forward(&h)?)?,
            },
            DecoderHead::Zinb(scale, dropout) => ModalityOutput::Zinb {
                scale: candle_nn::ops::softmax_last_dim(&scale.forward(&h)?)?,
                dropout_logits: dropout.forward(&h)?,
            },
        })
    }

    /// per-group inverse dispersion `exp(theta[group])`, (n, x_dim)
    fn dispersion(&self, groups: &Tensor) -> Result<Option<Tensor>> {
        match self.theta.as_ref() {
            Some(theta) => Ok(Some(theta.index_select(groups, 0)?.exp()?)),
            None => Ok(None),
        }
    }

    /// Per-cell reconstruction loss (n,), summed over features
    ///
    /// * `x` - observed block (n, x_dim)
    /// * `groups` - (n,) integration group codes
    /// * `size_factor` - (n, 1)
    pub fn recon_loss(
        &self,
        x: &Tensor,
        output: &ModalityOutput,
        groups: &Tensor,
        size_factor: &Tensor,
    ) -> Result<Tensor> {
        let loss = match output {
            ModalityOutput::Gaussian { mean } => squared_error_loss(x, mean)?,
            ModalityOutput::Bernoulli { logits } => bernoulli_logit_loss(x, logits)?,
            ModalityOutput::NegBinomial { scale } => {
                let theta = self.require_dispersion(groups)?;
                let mu = scale.broadcast_mul(size_factor)?;
                nb_likelihood(x, &mu, &theta)?.neg()?
            }
            ModalityOutput::Zinb {
                scale,
                dropout_logits,
            } => {
                let theta = self.require_dispersion(groups)?;
                let mu = scale.broadcast_mul(size_factor)?;
                zinb_likelihood(x, &mu, &theta, dropout_logits)?.neg()?
            }
        };
        Ok(loss)
    }

    fn require_dispersion(&self, groups: &Tensor) -> Result<Tensor> {
        self.dispersion(groups)?.ok_or_else(|| {
            MultimilError::precondition("count likelihood without a dispersion parameter")
        })
    }

    /// first fully connected weight of the encoder and of the decoder
    pub fn first_weights(&self) -> Vec<Tensor> {
        let dec = match (&self.decoder_body, &self.head) {
            (Some(body), _) => body.first_weight().clone(),
            (None, DecoderHead::Gaussian(l, _))
            | (None, DecoderHead::Bernoulli(l))
            | (None, DecoderHead::NegBinomial(l))
            | (None, DecoderHead::Zinb(l, _)) => l.weight().clone(),
        };
        vec![self.encoder.first_weight().clone(), dec]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LossFamily;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn codec(family: LossFamily, hiddens: Vec<usize>) -> Result<(VarMap, ModalityCodec)> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let mut config = VaeConfig::new(vec![6]);
        config.losses = vec![family];
        config.hiddens = vec![hiddens];
        config.z_dim = 3;
        let config = config.resolved()?;
        let codec = ModalityCodec::new(&config, 0, 0, config.h_dim, vb.pp("mod0"))?;
        Ok((vm, codec))
    }

    #[test]
    fn count_heads_carry_dispersion() -> Result<()> {
        let (vm, nb) = codec(LossFamily::NegBinomial, vec![8])?;
        assert!(vm.data().lock().unwrap().contains_key("mod0.theta"));

        let dev = Device::Cpu;
        let h = Tensor::randn(0f32, 1f32, (4, 32), &dev)?;
        let out = nb.decode(&h, None, false)?;
        let rows: Vec<f32> = out.raw().sum(1)?.to_vec1()?;
        for r in rows {
            approx::assert_abs_diff_eq!(r, 1.0, epsilon = 1e-5);
        }

        let x = Tensor::from_vec(vec![0f32, 1., 2., 0., 5., 1.].repeat(4), (4, 6), &dev)?;
        let groups = Tensor::zeros(4, DType::U32, &dev)?;
        let sf = Tensor::full(9f32, (4, 1), &dev)?;
        let loss: Vec<f32> = nb.recon_loss(&x, &out, &groups, &sf)?.to_vec1()?;
        assert_eq!(loss.len(), 4);
        assert!(loss.iter().all(|v| v.is_finite() && *v > 0.0));
        Ok(())
    }

    #[test]
    fn gaussian_without_hiddens_decodes_to_width() -> Result<()> {
        let (vm, g) = codec(LossFamily::Gaussian, vec![])?;
        assert!(!vm.data().lock().unwrap().contains_key("mod0.theta"));
        let x = Tensor::randn(0f32, 1f32, (5, 6), &Device::Cpu)?;
        let (mu, logvar) = g.encode(&x, None, true)?;
        assert_eq!(mu.dims(), &[5, 3]);
        let lv: Vec<f32> = logvar.flatten_all()?.to_vec1()?;
        assert!(lv.iter().all(|v| (-8.0..=8.0).contains(v)));
        Ok(())
    }
}
