use crate::common::*;
use crate::config::{KernelType, MmdMode};
use crate::fusion::{mask_to_rows, reparameterize};
use crate::vae::{MultiVae, VaeInference};

use candle_core::Tensor;
use std::collections::BTreeMap;

/// Sum of pairwise penalties between all groups of rows
///
/// Rows of `z` are partitioned by `labels`; every unordered pair of
/// distinct groups adds `penalty(z_a, z_b)`. A single group gives zero.
/// The magnitude grows with the number of groups in the batch.
pub fn calc_integ_loss(kernel: KernelType, z: &Tensor, labels: &[u32]) -> Result<Tensor> {
    if z.dim(0)? != labels.len() {
        return Err(MultimilError::precondition(format!(
            "{} rows but {} group labels",
            z.dim(0)?,
            labels.len()
        )));
    }

    let mut groups: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for (r, &g) in labels.iter().enumerate() {
        groups.entry(g).or_default().push(r as u32);
    }

    let parts = groups
        .into_values()
        .map(|rows| -> Result<Tensor> {
            let n = rows.len();
            Ok(z.index_select(&Tensor::from_vec(rows, n, z.device())?, 0)?)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut loss = Tensor::new(0f32, z.device())?.to_dtype(z.dtype())?;
    for a in 0..parts.len() {
        for b in (a + 1)..parts.len() {
            loss = (loss + crate::similarity::penalty(kernel, &parts[a], &parts[b])?)?;
        }
    }
    Ok(loss)
}

/// Integration penalty for the configured [`MmdMode`]
///
/// * `latent` - joint latent across integration groups
/// * `marginal` - for each modality pair, marginals of cells where both
///   are present labelled by modality; plus each modality's marginal
///   across integration groups over the cells where it is present
/// * `both` - the sum
pub fn integration_loss(
    kernel: KernelType,
    mode: MmdMode,
    inference: &VaeInference,
    groups: &[u32],
) -> Result<Tensor> {
    let z = &inference.z_joint;
    let mut loss = Tensor::new(0f32, z.device())?.to_dtype(z.dtype())?;

    if mode.on_latent() {
        loss = (loss + calc_integ_loss(kernel, z, groups)?)?;
    }

    if mode.on_marginal() {
        let present = inference
            .masks
            .iter()
            .map(|m| -> Result<Vec<bool>> {
                Ok(m.to_vec1::<u8>()?.into_iter().map(|v| v > 0).collect())
            })
            .collect::<Result<Vec<_>>>()?;

        let n_mod = inference.z_marginal.len();
        for i in 0..n_mod {
            for j in (i + 1)..n_mod {
                let (zi, zj) = match (&inference.z_marginal[i], &inference.z_marginal[j]) {
                    (Some(zi), Some(zj)) => (zi, zj),
                    _ => continue,
                };
                let both: Vec<u32> = present[i]
                    .iter()
                    .zip(present[j].iter())
                    .enumerate()
                    .filter(|(_, (&a, &b))| a && b)
                    .map(|(r, _)| r as u32)
                    .collect();
                if both.is_empty() {
                    continue;
                }
                let n = both.len();
                let rows = Tensor::from_vec(both, n, z.device())?;
                let marginals = Tensor::cat(&[zi.index_select(&rows, 0)?, zj.index_select(&rows, 0)?], 0)?;
                let mut labels = vec![i as u32; n];
                labels.extend(std::iter::repeat(j as u32).take(n));
                loss = (loss + calc_integ_loss(kernel, &marginals, &labels)?)?;
            }
        }

        for (i, z_i) in inference.z_marginal.iter().enumerate() {
            let z_i = match z_i {
                Some(z_i) => z_i,
                None => continue,
            };
            let rows = mask_to_rows(&inference.masks[i])?;
            if rows.is_empty() {
                continue;
            }
            let labels: Vec<u32> = rows.iter().map(|&r| groups[r as usize]).collect();
            let n = rows.len();
            let z_sel = z_i.index_select(&Tensor::from_vec(rows, n, z.device())?, 0)?;
            loss = (loss + calc_integ_loss(kernel, &z_sel, &labels)?)?;
        }
    }
    Ok(loss)
}

/// Modality-translation consistency loss
///
/// For each ordered pair `(i, j)` over cells where `i` is present: decode
/// the joint latent into `j`, re-encode that translation with `j` alone,
/// decode back into `i` and score against the observed `x_i` with `i`'s
/// reconstruction family. Each pair contributes its mean over cells,
/// weighted by the family coefficient.
pub fn calc_cycle_loss(
    vae: &MultiVae,
    xs: &[Option<Tensor>],
    inference: &VaeInference,
    groups: &Tensor,
    size_factor: &Tensor,
    train: bool,
) -> Result<Tensor> {
    let z = &inference.z_joint;
    let cond = inference.cond.as_ref();
    let coefs = &vae.config().loss_coefs;
    let mut loss = Tensor::new(0f32, z.device())?.to_dtype(z.dtype())?;

    for i in 0..vae.n_modality() {
        let x_i = match (&vae.codecs()[i], &xs[i]) {
            (Some(_), Some(x)) => x,
            _ => continue,
        };
        let rows = mask_to_rows(&inference.masks[i])?;
        if rows.is_empty() {
            continue;
        }
        let n = rows.len();
        let rows = Tensor::from_vec(rows, n, z.device())?;
        let z_sel = z.index_select(&rows, 0)?;
        let x_sel = x_i.index_select(&rows, 0)?;
        let cond_sel = cond.map(|c| c.index_select(&rows, 0)).transpose()?;
        let groups_sel = groups.index_select(&rows, 0)?;
        let sf_sel = size_factor.index_select(&rows, 0)?;
        let codec_i = vae.codec(i)?;

        for j in 0..vae.n_modality() {
            if j == i || vae.codecs()[j].is_none() {
                continue;
            }
            let translated = vae
                .decode(&z_sel, j, cond_sel.as_ref(), train)?
                .expected_value(&sf_sel)?;
            let (mu_j, lv_j) = vae.encode_modality(&translated, j, cond_sel.as_ref(), train)?;
            let z_j = reparameterize(&mu_j, &lv_j, train)?;
            let back = vae.decode(&z_j, i, cond_sel.as_ref(), train)?;
            let pair = codec_i
                .recon_loss(&x_sel, &back, &groups_sel, &sf_sel)?
                .mean_all()?;
            let pair = (pair * coefs.family_weight(codec_i.family()))?;
            loss = (loss + pair)?;
        }
    }
    Ok(loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn pairs_are_summed() -> Result<()> {
        let dev = Device::Cpu;
        let z = Tensor::randn(0f32, 1f32, (9, 3), &dev)?;
        let labels = vec![0, 0, 0, 1, 1, 1, 2, 2, 2];
        let total = calc_integ_loss(KernelType::Gaussian, &z, &labels)?.to_scalar::<f32>()?;

        let part = |rows: Vec<u32>| z.index_select(&Tensor::new(rows.as_slice(), &dev).unwrap(), 0);
        let (a, b, c) = (part(vec![0, 1, 2])?, part(vec![3, 4, 5])?, part(vec![6, 7, 8])?);
        let mut expected = 0f32;
        for (x, y) in [(&a, &b), (&a, &c), (&b, &c)] {
            expected += crate::similarity::gaussian_mmd(x, y)?.to_scalar::<f32>()?;
        }
        assert_abs_diff_eq!(total, expected, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn label_count_must_match_rows() -> Result<()> {
        let z = Tensor::randn(0f32, 1f32, (4, 2), &Device::Cpu)?;
        assert!(calc_integ_loss(KernelType::Gaussian, &z, &[0, 1]).is_err());
        Ok(())
    }
}
