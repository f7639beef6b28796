use crate::common::*;
use crate::config::VaeConfig;

use candle_core::Tensor;
use candle_nn::{ModuleT, VarBuilder};
use candle_util::candle_aux_layers::StackLayers;

/// Presence mask of a modality block: (n,) `u8`, one where the block
/// is not all zero
pub fn presence_mask(x: &Tensor) -> Result<Tensor> {
    Ok(x.abs()?.sum(1)?.gt(0f32)?)
}

/// Row indices where `mask` is set
pub fn mask_to_rows(mask: &Tensor) -> Result<Vec<u32>> {
    let mask: Vec<u8> = mask.to_vec1()?;
    Ok(mask
        .iter()
        .enumerate()
        .filter(|(_, &m)| m > 0)
        .map(|(i, _)| i as u32)
        .collect())
}

/// Product of Gaussian experts in precision space
///
/// ```text
/// prec = Σ_i m_i exp(-logvar_i)
/// mu   = Σ_i m_i mu_i exp(-logvar_i) / prec
/// logvar = -log(prec)
/// ```
///
/// A single expert is passed through unchanged on its present rows. Rows
/// without any present expert come out non-finite.
///
/// * `mus`, `logvars` - per-expert (n, z)
/// * `masks` - per-expert (n,) presence
pub fn product_of_experts(
    mus: &[Tensor],
    logvars: &[Tensor],
    masks: &[Tensor],
) -> Result<(Tensor, Tensor)> {
    if mus.is_empty() || mus.len() != logvars.len() || mus.len() != masks.len() {
        return Err(MultimilError::precondition(format!(
            "product of experts needs matching non-empty inputs: {} mus, {} logvars, {} masks",
            mus.len(),
            logvars.len(),
            masks.len()
        )));
    }

    if mus.len() == 1 {
        let present = masks[0]
            .unsqueeze(1)?
            .broadcast_as(mus[0].shape())?
            .contiguous()?;
        let nan = Tensor::full(f32::NAN, mus[0].shape(), mus[0].device())?.to_dtype(mus[0].dtype())?;
        return Ok((
            present.where_cond(&mus[0], &nan)?,
            present.where_cond(&logvars[0], &nan)?,
        ));
    }

    let mut prec = masked_precision(&logvars[0], &masks[0])?;
    let mut weighted = mus[0].mul(&prec)?;
    for k in 1..mus.len() {
        let prec_k = masked_precision(&logvars[k], &masks[k])?;
        weighted = (weighted + mus[k].mul(&prec_k)?)?;
        prec = (prec + prec_k)?;
    }

    let mu = weighted.div(&prec)?;
    let logvar = prec.log()?.neg()?;
    Ok((mu, logvar))
}

fn masked_precision(logvar: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let m = mask.to_dtype(logvar.dtype())?.unsqueeze(1)?;
    Ok(logvar.neg()?.exp()?.broadcast_mul(&m)?)
}

/// `mu + exp(logvar / 2) * eps` in training, `mu` otherwise
pub fn reparameterize(mu: &Tensor, logvar: &Tensor, train: bool) -> Result<Tensor> {
    if train {
        let eps = mu.randn_like(0., 1.)?;
        Ok((mu + (logvar * 0.5)?.exp()?.mul(&eps)?)?)
    } else {
        Ok(mu.clone())
    }
}

/// Shared decoder from the joint latent (plus modality one-hot) to the
/// hidden code consumed by every modality decoder
pub struct SharedDecoder {
    n_modality: usize,
    net: Option<StackLayers>,
    dim_out: usize,
}

impl SharedDecoder {
    pub fn new(config: &VaeConfig, vb: VarBuilder) -> Result<Self> {
        let n_modality = config.n_modality();
        if config.add_shared_decoder {
            let stack_config = config.stack_config(Some(candle_nn::Activation::LeakyRelu(0.01)));
            let net = StackLayers::new(
                config.z_dim + n_modality,
                config.h_dim,
                &config.shared_hiddens,
                &stack_config,
                vb,
            )?;
            Ok(Self {
                n_modality,
                net: Some(net),
                dim_out: config.h_dim,
            })
        } else {
            Ok(Self {
                n_modality,
                net: None,
                dim_out: config.z_dim,
            })
        }
    }

    pub fn dim_out(&self) -> usize {
        self.dim_out
    }

    /// Hidden code of modality `i` for every row of `z`
    pub fn forward_t(&self, z: &Tensor, i: usize, train: bool) -> Result<Tensor> {
        match self.net.as_ref() {
            Some(net) => {
                let n = z.dim(0)?;
                let one_hot = one_hot_rows(n, i, self.n_modality, z)?;
                Ok(net.forward_t(&Tensor::cat(&[z, &one_hot], 1)?, train)?)
            }
            None => Ok(z.clone()),
        }
    }

    pub fn first_weight(&self) -> Option<&Tensor> {
        self.net.as_ref().map(|n| n.first_weight())
    }
}

/// (n, k) matrix with ones in column `i`
fn one_hot_rows(n: usize, i: usize, k: usize, like: &Tensor) -> Result<Tensor> {
    let mut data = vec![0f32; n * k];
    for r in 0..n {
        data[r * k + i] = 1.0;
    }
    Ok(Tensor::from_vec(data, (n, k), like.device())?.to_dtype(like.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};

    #[test]
    fn masks_mark_nonzero_blocks() -> Result<()> {
        let x = Tensor::from_vec(vec![0f32, 0., 1., -1., 0., 2.], (3, 2), &Device::Cpu)?;
        let mask = presence_mask(&x)?;
        assert_eq!(mask.to_vec1::<u8>()?, vec![0, 0, 1]);
        assert_eq!(mask_to_rows(&mask)?, vec![2]);
        Ok(())
    }

    #[test]
    fn masked_expert_drops_out() -> Result<()> {
        let dev = Device::Cpu;
        let mu0 = Tensor::from_vec(vec![1f32, 2.0], (1, 2), &dev)?;
        let lv0 = Tensor::from_vec(vec![0.5f32, -1.0], (1, 2), &dev)?;
        let mu1 = Tensor::from_vec(vec![-3f32, 7.0], (1, 2), &dev)?;
        let lv1 = Tensor::from_vec(vec![2f32, 1.0], (1, 2), &dev)?;
        let on = Tensor::from_vec(vec![1u8], 1, &dev)?;
        let off = Tensor::from_vec(vec![0u8], 1, &dev)?;

        let (mu, lv) = product_of_experts(&[mu0, mu1], &[lv0, lv1], &[on, off])?;
        let mu = mu.flatten_all()?.to_vec1::<f32>()?;
        let lv = lv.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(mu[0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(mu[1], 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(lv[0], 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(lv[1], -1.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn lone_expert_without_its_block_is_undefined() -> Result<()> {
        let dev = Device::Cpu;
        let mu = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0], (2, 2), &dev)?;
        let lv = Tensor::from_vec(vec![0.1f32, 0.2, 0.3, 0.4], (2, 2), &dev)?;
        let mask = Tensor::from_vec(vec![1u8, 0], 2, &dev)?;
        let (m, l) = product_of_experts(&[mu], &[lv], &[mask])?;
        let m = m.to_vec2::<f32>()?;
        let l = l.to_vec2::<f32>()?;
        assert_eq!(m[0], vec![1.0, 2.0]);
        assert_eq!(l[0], vec![0.1, 0.2]);
        assert!(m[1].iter().chain(l[1].iter()).all(|v| v.is_nan()));
        Ok(())
    }

    #[test]
    fn equal_experts_halve_variance() -> Result<()> {
        let dev = Device::Cpu;
        let mu = Tensor::from_vec(vec![0.3f32, -0.7], (1, 2), &dev)?;
        let lv = Tensor::zeros((1, 2), DType::F32, &dev)?;
        let on = Tensor::from_vec(vec![1u8], 1, &dev)?;
        let (m, l) = product_of_experts(
            &[mu.clone(), mu.clone()],
            &[lv.clone(), lv.clone()],
            &[on.clone(), on],
        )?;
        let m = m.flatten_all()?.to_vec1::<f32>()?;
        let l = l.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(m[0], 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(l[0], -std::f32::consts::LN_2, epsilon = 1e-6);
        Ok(())
    }
}
