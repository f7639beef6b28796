use crate::common::*;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Scalar summary of one minibatch (or the running mean over an epoch)
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LossRecord {
    pub loss: f32,
    pub recon_loss: f32,
    pub kl_loss: f32,
    pub integ_loss: f32,
    pub cycle_loss: f32,
    pub class_loss: f32,
    pub regression_loss: f32,
    pub reg_loss: f32,
    pub accuracy: Option<f32>,
}

impl LossRecord {
    /// (name, value) pairs in a fixed order; `accuracy` only with
    /// classification tasks
    pub fn terms(&self) -> Vec<(&'static str, f32)> {
        let mut ret = vec![
            ("loss", self.loss),
            ("recon_loss", self.recon_loss),
            ("kl_loss", self.kl_loss),
            ("integ_loss", self.integ_loss),
            ("cycle_loss", self.cycle_loss),
            ("class_loss", self.class_loss),
            ("regression_loss", self.regression_loss),
            ("reg_loss", self.reg_loss),
        ];
        if let Some(acc) = self.accuracy {
            ret.push(("accuracy", acc));
        }
        ret
    }
}

/// Differentiable composite loss with its per-term record
pub struct LossOutput {
    pub loss: Tensor,
    pub record: LossRecord,
}

/// Weighted terms of the composite objective before summation
pub struct LossTerms {
    pub recon: Tensor,
    /// per-cell KL divergence (n,)
    pub kl: Tensor,
    pub integ: Tensor,
    pub cycle: Tensor,
    pub classification: Tensor,
    pub regression: Tensor,
    pub reg: Tensor,
    pub accuracy: Option<f32>,
}

/// Coefficients applied by [`LossTerms::combine`]
#[derive(Clone, Debug)]
pub struct LossWeights {
    pub recon: f64,
    pub kl: f64,
    pub integ: f64,
    pub cycle: f64,
    pub class: f64,
    pub regression: f64,
    pub reg: f64,
}

impl LossTerms {
    /// ```text
    /// recon·R + kl·mean(KL) + integ·I + cycle·C
    ///   + class·CE + regression·MSE + reg·ORTH
    /// ```
    pub fn combine(self, w: &LossWeights) -> Result<LossOutput> {
        let kl = self.kl.mean_all()?;

        let mut loss = (&self.recon * w.recon)?;
        for (term, coef) in [
            (&kl, w.kl),
            (&self.integ, w.integ),
            (&self.cycle, w.cycle),
            (&self.classification, w.class),
            (&self.regression, w.regression),
            (&self.reg, w.reg),
        ] {
            loss = (loss + (term * coef)?)?;
        }

        let scalar = |t: &Tensor| -> Result<f32> {
            Ok(t.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?)
        };

        let record = LossRecord {
            loss: scalar(&loss)?,
            recon_loss: scalar(&self.recon)?,
            kl_loss: scalar(&(kl * w.kl)?)?,
            integ_loss: scalar(&self.integ)?,
            cycle_loss: scalar(&self.cycle)?,
            class_loss: scalar(&self.classification)?,
            regression_loss: scalar(&self.regression)?,
            reg_loss: scalar(&self.reg)?,
            accuracy: self.accuracy,
        };

        Ok(LossOutput { loss, record })
    }
}

/// Running means of minibatch records
#[derive(Default)]
pub struct LossAccumulator {
    sum: LossRecord,
    acc_sum: f32,
    acc_count: usize,
    count: usize,
}

impl LossAccumulator {
    pub fn add(&mut self, r: &LossRecord) {
        self.sum.loss += r.loss;
        self.sum.recon_loss += r.recon_loss;
        self.sum.kl_loss += r.kl_loss;
        self.sum.integ_loss += r.integ_loss;
        self.sum.cycle_loss += r.cycle_loss;
        self.sum.class_loss += r.class_loss;
        self.sum.regression_loss += r.regression_loss;
        self.sum.reg_loss += r.reg_loss;
        if let Some(a) = r.accuracy {
            self.acc_sum += a;
            self.acc_count += 1;
        }
        self.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> LossRecord {
        let n = self.count.max(1) as f32;
        LossRecord {
            loss: self.sum.loss / n,
            recon_loss: self.sum.recon_loss / n,
            kl_loss: self.sum.kl_loss / n,
            integ_loss: self.sum.integ_loss / n,
            cycle_loss: self.sum.cycle_loss / n,
            class_loss: self.sum.class_loss / n,
            regression_loss: self.sum.regression_loss / n,
            reg_loss: self.sum.reg_loss / n,
            accuracy: (self.acc_count > 0).then(|| self.acc_sum / self.acc_count as f32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn combine_weights_every_term() -> Result<()> {
        let dev = Device::Cpu;
        let s = |v: f32| Tensor::new(v, &dev);
        let terms = LossTerms {
            recon: s(2.0)?,
            kl: Tensor::new(&[1f32, 3.0], &dev)?,
            integ: s(5.0)?,
            cycle: s(7.0)?,
            classification: s(11.0)?,
            regression: s(13.0)?,
            reg: s(17.0)?,
            accuracy: Some(0.5),
        };
        let w = LossWeights {
            recon: 1.0,
            kl: 0.5,
            integ: 0.0,
            cycle: 1.0,
            class: 1.0,
            regression: 2.0,
            reg: 0.1,
        };
        let out = terms.combine(&w)?;
        // 2 + 0.5*2 + 0 + 7 + 11 + 26 + 1.7
        assert_abs_diff_eq!(out.record.loss, 48.7, epsilon = 1e-4);
        assert_abs_diff_eq!(out.record.kl_loss, 1.0);
        assert_eq!(out.record.terms().last().unwrap().0, "accuracy");
        Ok(())
    }

    #[test]
    fn accumulator_averages() {
        let mut acc = LossAccumulator::default();
        acc.add(&LossRecord {
            loss: 1.0,
            accuracy: Some(1.0),
            ..Default::default()
        });
        acc.add(&LossRecord {
            loss: 3.0,
            ..Default::default()
        });
        let m = acc.mean();
        assert_eq!(m.loss, 2.0);
        assert_eq!(m.accuracy, Some(1.0));
    }
}
