use crate::common::*;
use crate::config::{CovariateLayout, VaeConfig};
use crate::covariates::CovariateEmbedding;
use crate::fusion::*;
use crate::modality::{ModalityCodec, ModalityOutput};

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

/// Everything the inference pass produces for a minibatch of cells
pub struct VaeInference {
    /// joint posterior (n, z)
    pub mu: Tensor,
    pub logvar: Tensor,
    /// one sample per cell (the mean in evaluation)
    pub z_joint: Tensor,
    /// per-modality samples from each modality's own posterior
    pub z_marginal: Vec<Option<Tensor>>,
    /// per-modality (n,) `u8` presence masks
    pub masks: Vec<Tensor>,
    /// concatenated condition embedding
    pub cond: Option<Tensor>,
}

/// Multi-modal VAE: per-modality codecs fused into one joint latent
pub struct MultiVae {
    config: VaeConfig,
    codecs: Vec<Option<ModalityCodec>>,
    shared_decoder: SharedDecoder,
    covariates: CovariateEmbedding,
}

impl MultiVae {
    /// Will create variables:
    ///
    /// * `mod{i}.*` modality codecs (none for zero-width modalities)
    /// * `shared.*` shared decoder
    /// * `cov.*` covariate embeddings
    pub fn new(config: &VaeConfig, layout: &CovariateLayout, vb: VarBuilder) -> Result<Self> {
        let config = config.clone().resolved()?;

        let covariates = CovariateEmbedding::new(&config, layout, vb.pp("cov"))?;
        let shared_decoder = SharedDecoder::new(&config, vb.pp("shared"))?;
        let cond_width = covariates.width();

        let codecs = (0..config.n_modality())
            .map(|i| -> Result<Option<ModalityCodec>> {
                if config.modality_lengths[i] == 0 {
                    return Ok(None);
                }
                Ok(Some(ModalityCodec::new(
                    &config,
                    i,
                    cond_width,
                    shared_decoder.dim_out(),
                    vb.pp(format!("mod{}", i)),
                )?))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            codecs,
            shared_decoder,
            covariates,
        })
    }

    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    pub fn codecs(&self) -> &[Option<ModalityCodec>] {
        &self.codecs
    }

    pub fn covariates(&self) -> &CovariateEmbedding {
        &self.covariates
    }

    pub fn n_modality(&self) -> usize {
        self.codecs.len()
    }

    pub fn z_dim(&self) -> usize {
        self.config.z_dim
    }

    /// Split the concatenated feature matrix into modality blocks;
    /// zero-width modalities give `None`
    pub fn split_modalities(&self, x: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let total = self.config.total_features();
        if x.dim(1)? != total {
            return Err(MultimilError::precondition(format!(
                "feature width {} does not match the modality lengths (total {})",
                x.dim(1)?,
                total
            )));
        }
        let mut offset = 0;
        let mut ret = Vec::with_capacity(self.n_modality());
        for &len in self.config.modality_lengths.iter() {
            if len == 0 {
                ret.push(None);
            } else {
                ret.push(Some(x.narrow(1, offset, len)?.contiguous()?));
            }
            offset += len;
        }
        Ok(ret)
    }

    pub fn masks(&self, xs: &[Option<Tensor>]) -> Result<Vec<Tensor>> {
        let n = xs
            .iter()
            .flatten()
            .next()
            .map(|x| x.dim(0))
            .transpose()?
            .unwrap_or(0);
        xs.iter()
            .map(|x| match x {
                Some(x) => presence_mask(x),
                None => Ok(Tensor::zeros(n, DType::U8, &self.device_of(xs))?),
            })
            .collect()
    }

    fn device_of(&self, xs: &[Option<Tensor>]) -> candle_core::Device {
        xs.iter()
            .flatten()
            .next()
            .map(|x| x.device().clone())
            .unwrap_or(candle_core::Device::Cpu)
    }

    pub fn condition(
        &self,
        cat_covs: Option<&Tensor>,
        cont_covs: &Tensor,
        train: bool,
    ) -> Result<Option<Tensor>> {
        self.covariates.forward_t(cat_covs, cont_covs, train)
    }

    /// Encode all cells with every present modality and fuse
    ///
    /// * `x` - (n, Σ modality_lengths)
    /// * `cat_covs` - (n, n_cat) `u32`
    /// * `cont_covs` - (n, n_cont + 1), size factor last
    pub fn inference(
        &self,
        x: &Tensor,
        cat_covs: Option<&Tensor>,
        cont_covs: &Tensor,
        train: bool,
    ) -> Result<VaeInference> {
        let xs = self.split_modalities(x)?;
        let masks = self.masks(&xs)?;
        let cond = self.condition(cat_covs, cont_covs, train)?;
        self.inference_from_blocks(&xs, masks, cond, train)
    }

    fn inference_from_blocks(
        &self,
        xs: &[Option<Tensor>],
        masks: Vec<Tensor>,
        cond: Option<Tensor>,
        train: bool,
    ) -> Result<VaeInference> {
        let mut mus = vec![];
        let mut logvars = vec![];
        let mut present = vec![];
        let mut z_marginal = Vec::with_capacity(xs.len());

        for (i, (codec, x)) in self.codecs.iter().zip(xs).enumerate() {
            match (codec, x) {
                (Some(codec), Some(x)) => {
                    let (mu_i, lv_i) = codec.encode(x, cond.as_ref(), train)?;
                    z_marginal.push(Some(reparameterize(&mu_i, &lv_i, train)?));
                    mus.push(mu_i);
                    logvars.push(lv_i);
                    present.push(masks[i].clone());
                }
                _ => z_marginal.push(None),
            }
        }

        let (mu, logvar) = product_of_experts(&mus, &logvars, &present)?;
        let logvar = logvar.clamp(-8f32, 8f32)?;
        let z_joint = reparameterize(&mu, &logvar, train)?;

        Ok(VaeInference {
            mu,
            logvar,
            z_joint,
            z_marginal,
            masks,
            cond,
        })
    }

    /// Joint latent from a subset of source modalities; the other blocks
    /// are treated as absent
    pub fn to_latent(
        &self,
        x: &Tensor,
        cat_covs: Option<&Tensor>,
        cont_covs: &Tensor,
        sources: &[usize],
        train: bool,
    ) -> Result<VaeInference> {
        if let Some(&bad) = sources.iter().find(|&&s| s >= self.n_modality()) {
            return Err(MultimilError::precondition(format!(
                "source modality {} out of range ({} modalities)",
                bad,
                self.n_modality()
            )));
        }
        let xs = self
            .split_modalities(x)?
            .into_iter()
            .enumerate()
            .map(|(i, x)| if sources.contains(&i) { x } else { None })
            .collect::<Vec<_>>();
        if xs.iter().all(|x| x.is_none()) {
            return Err(MultimilError::precondition(
                "at least one configured source modality is required",
            ));
        }
        let masks = self.masks(&xs)?;
        let cond = self.condition(cat_covs, cont_covs, train)?;
        self.inference_from_blocks(&xs, masks, cond, train)
    }

    /// Decode `z` into modality `i`
    pub fn decode(
        &self,
        z: &Tensor,
        i: usize,
        cond: Option<&Tensor>,
        train: bool,
    ) -> Result<ModalityOutput> {
        let codec = self.codec(i)?;
        let h = self.shared_decoder.forward_t(z, i, train)?;
        codec.decode(&h, cond, train)
    }

    /// Decode `z` into every configured modality
    pub fn generative(
        &self,
        z: &Tensor,
        cond: Option<&Tensor>,
        train: bool,
    ) -> Result<Vec<Option<ModalityOutput>>> {
        (0..self.n_modality())
            .map(|i| match self.codecs[i] {
                Some(_) => Ok(Some(self.decode(z, i, cond, train)?)),
                None => Ok(None),
            })
            .collect()
    }

    /// Posterior of modality `i` alone
    pub fn encode_modality(
        &self,
        x_i: &Tensor,
        i: usize,
        cond: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        self.codec(i)?.encode(x_i, cond, train)
    }

    pub fn codec(&self, i: usize) -> Result<&ModalityCodec> {
        self.codecs
            .get(i)
            .and_then(|c| c.as_ref())
            .ok_or_else(|| {
                MultimilError::precondition(format!("modality {} has no codec (zero width)", i))
            })
    }

    /// Weighted reconstruction loss; each modality contributes the mean
    /// over the cells where it is present, times its family weight
    ///
    /// Returns the total and the per-modality terms.
    pub fn recon_loss(
        &self,
        xs: &[Option<Tensor>],
        outputs: &[Option<ModalityOutput>],
        masks: &[Tensor],
        groups: &Tensor,
        size_factor: &Tensor,
    ) -> Result<(Tensor, Vec<Option<Tensor>>)> {
        let mut total: Option<Tensor> = None;
        let mut per_modality = Vec::with_capacity(xs.len());

        for (i, codec) in self.codecs.iter().enumerate() {
            let (codec, x, out) = match (codec, &xs[i], &outputs[i]) {
                (Some(c), Some(x), Some(o)) => (c, x, o),
                _ => {
                    per_modality.push(None);
                    continue;
                }
            };
            let rows = mask_to_rows(&masks[i])?;
            if rows.is_empty() {
                per_modality.push(None);
                continue;
            }
            let n_rows = rows.len();
            let rows = Tensor::from_vec(rows, n_rows, x.device())?;
            let loss = codec
                .recon_loss(x, out, groups, size_factor)?
                .index_select(&rows, 0)?
                .mean_all()?;
            let loss = (loss * self.config.loss_coefs.family_weight(codec.family()))?;
            total = Some(match total {
                Some(t) => (t + &loss)?,
                None => loss.clone(),
            });
            per_modality.push(Some(loss));
        }

        let total = match total {
            Some(t) => t,
            None => Tensor::new(0f32, groups.device())?,
        };
        Ok((total, per_modality))
    }

    /// first layer weights of the shared decoder, every encoder and
    /// every decoder
    pub fn first_layer_weights(&self) -> Vec<Tensor> {
        let mut ret = vec![];
        if let Some(w) = self.shared_decoder.first_weight() {
            ret.push(w.clone());
        }
        for codec in self.codecs.iter().flatten() {
            ret.extend(codec.first_weights());
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LossFamily;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn absent_modality_gets_no_codec() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);

        let mut config = VaeConfig::new(vec![4, 0, 3]);
        config.losses = vec![LossFamily::Gaussian; 3];
        config.z_dim = 2;
        let layout = CovariateLayout::new(&config, None)?;
        let vae = MultiVae::new(&config, &layout, vb)?;
        assert!(vae.codecs()[1].is_none());
        assert!(vm
            .data()
            .lock()
            .unwrap()
            .keys()
            .all(|k| !k.starts_with("mod1.")));

        let x = Tensor::randn(0f32, 1f32, (5, 7), &dev)?;
        let cont = Tensor::ones((5, 1), DType::F32, &dev)?;
        let inf = vae.inference(&x, None, &cont, false)?;
        assert_eq!(inf.z_joint.dims(), &[5, 2]);
        assert!(inf.z_marginal[1].is_none());
        assert_eq!(inf.masks[1].to_vec1::<u8>()?, vec![0; 5]);

        let outputs = vae.generative(&inf.z_joint, inf.cond.as_ref(), false)?;
        assert_eq!(outputs[2].as_ref().unwrap().raw().dims(), &[5, 3]);
        assert!(vae.decode(&inf.z_joint, 1, None, false).is_err());
        Ok(())
    }

    #[test]
    fn eval_latent_is_the_mean() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let config = VaeConfig::new(vec![6]);
        let layout = CovariateLayout::new(&config, None)?;
        let vae = MultiVae::new(&config, &layout, vb)?;

        let x = Tensor::randn(0f32, 1f32, (3, 6), &dev)?;
        let cont = Tensor::ones((3, 1), DType::F32, &dev)?;
        let a = vae.inference(&x, None, &cont, false)?;
        let b = vae.inference(&x, None, &cont, false)?;
        assert_eq!(
            a.z_joint.flatten_all()?.to_vec1::<f32>()?,
            b.z_joint.flatten_all()?.to_vec1::<f32>()?
        );
        assert_eq!(
            a.z_joint.flatten_all()?.to_vec1::<f32>()?,
            a.mu.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }
}
