use candle_core::{Result, Tensor};

const EPS: f64 = 1e-8;

/// KL divergence loss between two Gaussian distributions
///
/// -0.5 * (1 + log(sigma^2) - mu^2 - sigma^2)
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (((z_var - 1.)? + z_mean.powf(2.)?)? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// Fast lgamma approximation for tensors (Paul Mineiro's fastlgamma).
///
/// ```text
/// lgamma(x) ≈ -2.081061466 - x + 0.0833333/(x+3) - log(x*(1+x)*(2+x)) + (2.5+x)*log(x+3)
/// ```
pub fn lgamma_approx(x: &Tensor) -> Result<Tensor> {
    let x_safe = x.clamp(1e-6f32, f32::MAX)?;

    let x_plus_1 = (&x_safe + 1.0)?;
    let x_plus_2 = (&x_safe + 2.0)?;
    let logterm = ((&x_safe * &x_plus_1)? * &x_plus_2)?.log()?;

    let xp3 = (&x_safe + 3.0)?;
    let log_xp3 = xp3.log()?;

    let recip_term = (xp3.recip()? * 0.0833333)?;
    let mult_term = ((&x_safe + 2.5)? * &log_xp3)?;

    (((recip_term - 2.081061466)? - &x_safe)? - &logterm)? + &mult_term
}

/// softplus(x) = max(x, 0) + log(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    x.relu()? + (x.abs()?.neg()?.exp()? + 1.0)?.log()?
}

/// Squared error, summed over the last dimension
///
/// loss(i) = sum_w [ x(i,w) - xhat(i,w) ]^2
///
pub fn squared_error_loss(x_nd: &Tensor, hat_nd: &Tensor) -> Result<Tensor> {
    x_nd.sub(hat_nd)?.sqr()?.sum(x_nd.rank() - 1)
}

/// Binary cross entropy with logits, summed over the last dimension
///
/// loss(i) = sum_w softplus(l(i,w)) - x(i,w) * l(i,w)
///
/// * `x_nd` - observed values in [0, 1]
/// * `logits_nd` - Bernoulli logits
///
pub fn bernoulli_logit_loss(x_nd: &Tensor, logits_nd: &Tensor) -> Result<Tensor> {
    softplus(logits_nd)?
        .sub(&x_nd.mul(logits_nd)?)?
        .sum(x_nd.rank() - 1)
}

/// Negative binomial log-likelihood (mean/dispersion parameterization)
///
/// ```text
/// llik(i) = sum_w θ log(θ/(θ+μ)) + x log(μ/(θ+μ))
///               + lgamma(x+θ) - lgamma(θ) - lgamma(x+1)
/// ```
///
/// * `x_nd` - observed counts
/// * `mu_nd` - mean
/// * `theta_nd` - inverse dispersion
///
pub fn nb_likelihood(x_nd: &Tensor, mu_nd: &Tensor, theta_nd: &Tensor) -> Result<Tensor> {
    let log_theta_mu_eps = ((theta_nd + mu_nd)? + EPS)?.log()?;
    let log_theta_eps = (theta_nd + EPS)?.log()?;
    let log_mu_eps = (mu_nd + EPS)?.log()?;

    let term1 = theta_nd.mul(&(log_theta_eps - &log_theta_mu_eps)?)?;
    let term2 = x_nd.mul(&(log_mu_eps - &log_theta_mu_eps)?)?;
    let term3 = ((lgamma_approx(&(x_nd + theta_nd)?)? - lgamma_approx(theta_nd)?)?
        - lgamma_approx(&(x_nd + 1.0)?)?)?;

    ((term1 + term2)? + term3)?.sum(x_nd.rank() - 1)
}

/// Zero-inflated negative binomial log-likelihood
///
/// ```text
/// x = 0: softplus(-π + θ log(θ/(θ+μ))) - softplus(-π)
/// x > 0: -softplus(-π) - π + log NB(x; μ, θ)
/// ```
///
/// * `x_nd` - observed counts
/// * `mu_nd` - mean
/// * `theta_nd` - inverse dispersion
/// * `pi_nd` - logits of the zero-inflation probability
///
pub fn zinb_likelihood(
    x_nd: &Tensor,
    mu_nd: &Tensor,
    theta_nd: &Tensor,
    pi_nd: &Tensor,
) -> Result<Tensor> {
    let softplus_pi = softplus(&pi_nd.neg()?)?;
    let log_theta_eps = (theta_nd + EPS)?.log()?;
    let log_theta_mu_eps = ((theta_nd + mu_nd)? + EPS)?.log()?;
    let pi_theta_log = (pi_nd.neg()? + theta_nd.mul(&(log_theta_eps - &log_theta_mu_eps)?)?)?;

    let case_zero = (softplus(&pi_theta_log)? - &softplus_pi)?;
    let is_zero = x_nd.lt(EPS)?.to_dtype(x_nd.dtype())?;

    let log_mu_eps = (mu_nd + EPS)?.log()?;
    let case_non_zero = (((softplus_pi.neg()? + &pi_theta_log)?
        + x_nd.mul(&(log_mu_eps - &log_theta_mu_eps)?)?)?
        + ((lgamma_approx(&(x_nd + theta_nd)?)? - lgamma_approx(theta_nd)?)?
            - lgamma_approx(&(x_nd + 1.0)?)?)?)?;
    let is_non_zero = x_nd.gt(EPS)?.to_dtype(x_nd.dtype())?;

    (case_zero.mul(&is_zero)? + case_non_zero.mul(&is_non_zero)?)?.sum(x_nd.rank() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn kl_of_standard_normal_is_zero() -> Result<()> {
        let dev = Device::Cpu;
        let mu = Tensor::zeros((3, 4), candle_core::DType::F32, &dev)?;
        let lnvar = Tensor::zeros((3, 4), candle_core::DType::F32, &dev)?;
        let kl: Vec<f32> = gaussian_kl_loss(&mu, &lnvar)?.to_vec1()?;
        for k in kl {
            assert_abs_diff_eq!(k, 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_lgamma_approx() -> Result<()> {
        let x = Tensor::from_vec(vec![1.0f32, 2.0, 5.0, 10.0], (4,), &Device::Cpu)?;
        let vals: Vec<f32> = lgamma_approx(&x)?.to_vec1()?;
        assert!((vals[0] - 0.0).abs() < 0.1);
        assert!((vals[1] - 0.0).abs() < 0.1);
        assert!((vals[2] - 3.178).abs() < 0.2);
        assert!((vals[3] - 12.802).abs() < 0.5);
        Ok(())
    }

    #[test]
    fn softplus_matches_closed_form() -> Result<()> {
        let x = Tensor::from_vec(vec![-30f32, -1.0, 0.0, 2.0, 40.0], (5,), &Device::Cpu)?;
        let vals: Vec<f32> = softplus(&x)?.to_vec1()?;
        let expected = [0.0f32, 0.31326166, std::f32::consts::LN_2, 2.126928, 40.0];
        for (v, e) in vals.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*v, *e, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn bce_is_smallest_at_matching_logits() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::from_vec(vec![1f32, 0.0, 1.0], (1, 3), &dev)?;
        let good = Tensor::from_vec(vec![5f32, -5.0, 5.0], (1, 3), &dev)?;
        let bad = Tensor::from_vec(vec![-5f32, 5.0, -5.0], (1, 3), &dev)?;
        let l_good: Vec<f32> = bernoulli_logit_loss(&x, &good)?.to_vec1()?;
        let l_bad: Vec<f32> = bernoulli_logit_loss(&x, &bad)?.to_vec1()?;
        assert!(l_good[0] < l_bad[0]);
        assert!(l_good[0] > 0.0);
        Ok(())
    }

    #[test]
    fn nb_and_zinb_are_finite() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::from_vec(vec![0f32, 1.0, 5.0, 0.0, 12.0, 3.0], (2, 3), &dev)?;
        let mu = Tensor::from_vec(vec![0.5f32, 1.0, 4.0, 0.1, 10.0, 3.0], (2, 3), &dev)?;
        let theta = Tensor::ones((2, 3), candle_core::DType::F32, &dev)?;
        let pi = Tensor::zeros((2, 3), candle_core::DType::F32, &dev)?;

        let nb: Vec<f32> = nb_likelihood(&x, &mu, &theta)?.to_vec1()?;
        let zinb: Vec<f32> = zinb_likelihood(&x, &mu, &theta, &pi)?.to_vec1()?;
        assert_eq!(nb.len(), 2);
        assert!(nb.iter().chain(zinb.iter()).all(|v| v.is_finite() && *v < 0.0));
        Ok(())
    }
}
