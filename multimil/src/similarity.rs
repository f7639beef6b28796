use crate::common::*;
use crate::config::KernelType;

use candle_core::Tensor;

/// Bandwidths of the multi-scale Gaussian kernel
pub const MMD_GAMMAS: [f64; 19] = [
    1e-6, 1e-5, 1e-4, 1e-3, 1e-2, 1e-1, 1.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 100.0, 1e3,
    1e4, 1e5, 1e6,
];

/// Distributional distance between two sets of row vectors
///
/// * `x` - (n, d)
/// * `y` - (m, d), `m` may differ from `n`
///
/// Returns a scalar tensor.
pub fn penalty(kernel: KernelType, x: &Tensor, y: &Tensor) -> Result<Tensor> {
    match kernel {
        KernelType::Gaussian => gaussian_mmd(x, y),
        KernelType::MomentMatching => moment_matching(x, y),
    }
}

/// `mean(Kxx) + mean(Kyy) - 2 mean(Kxy)`; may dip slightly below zero
pub fn gaussian_mmd(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let kxx = gaussian_kernel(x, x)?.mean_all()?;
    let kyy = gaussian_kernel(y, y)?.mean_all()?;
    let kxy = gaussian_kernel(x, y)?.mean_all()?;
    Ok(((kxx + kyy)? - (kxy * 2.0)?)?)
}

/// kernel matrix (n, m) averaged over [`MMD_GAMMAS`]
pub fn gaussian_kernel(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let dist = squared_distance(x, y)?;
    let mut kern = dist.zeros_like()?;
    for gamma in MMD_GAMMAS {
        kern = (kern + (&dist * (-gamma))?.exp()?)?;
    }
    Ok((kern / MMD_GAMMAS.len() as f64)?)
}

/// pairwise squared Euclidean distance (n, m)
fn squared_distance(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let diff = x.unsqueeze(1)?.broadcast_sub(&y.unsqueeze(0)?)?;
    Ok(diff.sqr()?.sum(2)?)
}

/// squared difference of means plus squared difference of unbiased
/// covariances; non-finite with fewer than two rows on either side
pub fn moment_matching(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let (mean_x, cov_x) = mean_and_covariance(x)?;
    let (mean_y, cov_y) = mean_and_covariance(y)?;
    let mean_diff = (mean_x - mean_y)?.sqr()?.mean_all()?;
    let cov_diff = (cov_x - cov_y)?.sqr()?.mean_all()?;
    Ok((mean_diff + cov_diff)?)
}

fn mean_and_covariance(x: &Tensor) -> Result<(Tensor, Tensor)> {
    let n = x.dim(0)?;
    let mean = x.mean_keepdim(0)?;
    let centred = x.broadcast_sub(&mean)?;
    let cov = (centred.t()?.contiguous()?.matmul(&centred)? / (n as f64 - 1.0))?;
    Ok((mean, cov))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn kernel_diagonal_is_one() -> Result<()> {
        let x = Tensor::randn(0f32, 1f32, (5, 3), &Device::Cpu)?;
        let k = gaussian_kernel(&x, &x)?.to_vec2::<f32>()?;
        for (i, row) in k.iter().enumerate() {
            assert_abs_diff_eq!(row[i], 1.0, epsilon = 1e-6);
            assert!(row.iter().all(|&v| v <= 1.0 + 1e-6));
        }
        Ok(())
    }

    #[test]
    fn moment_matching_detects_shift() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (50, 4), &dev)?;
        let y = (&x + 3.0)?;
        let same = moment_matching(&x, &x)?.to_scalar::<f32>()?;
        let shifted = moment_matching(&x, &y)?.to_scalar::<f32>()?;
        assert_abs_diff_eq!(same, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(shifted, 9.0, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn moment_matching_single_row_is_not_finite() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (1, 4), &dev)?;
        let y = Tensor::randn(0f32, 1f32, (6, 4), &dev)?;
        let v = moment_matching(&x, &y)?.to_scalar::<f32>()?;
        assert!(!v.is_finite());
        Ok(())
    }
}
