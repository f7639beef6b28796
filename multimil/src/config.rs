use crate::common::*;

use candle_nn::Activation;
use candle_util::candle_aux_layers::{Normalization, StackConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Output distribution of a modality; decides the decoder head and the
/// reconstruction loss
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LossFamily {
    Gaussian,
    Bernoulli,
    NegBinomial,
    Zinb,
}

impl LossFamily {
    /// name of the per-family weight in [`LossCoefs`]
    pub fn coef_name(&self) -> &'static str {
        match self {
            Self::Gaussian => "mse",
            Self::Bernoulli => "bce",
            Self::NegBinomial => "nb",
            Self::Zinb => "zinb",
        }
    }

    pub fn is_count(&self) -> bool {
        matches!(self, Self::NegBinomial | Self::Zinb)
    }
}

impl FromStr for LossFamily {
    type Err = MultimilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mse" | "gaussian" => Ok(Self::Gaussian),
            "bce" | "bernoulli" => Ok(Self::Bernoulli),
            "nb" | "negbinom" | "negative-binomial" => Ok(Self::NegBinomial),
            "zinb" | "zero-inflated-negative-binomial" => Ok(Self::Zinb),
            _ => Err(MultimilError::config(format!(
                "losses: unsupported loss family `{}` (mse, bce, nb, zinb)",
                s
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    Linear,
    LeakyRelu,
    Relu,
    Sigmoid,
}

impl OutputActivation {
    pub fn activation(&self) -> Option<Activation> {
        match self {
            Self::Linear => None,
            Self::LeakyRelu => Some(Activation::LeakyRelu(0.01)),
            Self::Relu => Some(Activation::Relu),
            Self::Sigmoid => Some(Activation::Sigmoid),
        }
    }
}

impl FromStr for OutputActivation {
    type Err = MultimilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "leakyrelu" | "leaky_relu" => Ok(Self::LeakyRelu),
            "relu" => Ok(Self::Relu),
            "sigmoid" => Ok(Self::Sigmoid),
            _ => Err(MultimilError::config(format!(
                "output_activations: unsupported activation `{}`",
                s
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationType {
    Layer,
    Batch,
    None,
}

impl From<NormalizationType> for Normalization {
    fn from(n: NormalizationType) -> Self {
        match n {
            NormalizationType::Layer => Normalization::Layer,
            NormalizationType::Batch => Normalization::Batch,
            NormalizationType::None => Normalization::None,
        }
    }
}

impl FromStr for NormalizationType {
    type Err = MultimilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "layer" => Ok(Self::Layer),
            "batch" => Ok(Self::Batch),
            "none" => Ok(Self::None),
            _ => Err(MultimilError::config(format!(
                "normalization has to be one of layer, batch, none: found `{}`",
                s
            ))),
        }
    }
}

/// Distance between two sets of latent vectors
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum KernelType {
    /// multi-bandwidth Gaussian kernel MMD
    Gaussian,
    /// difference of first and second moments
    MomentMatching,
}

impl FromStr for KernelType {
    type Err = MultimilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "gaussian" => Ok(Self::Gaussian),
            "moment-matching" | "moment_matching" | "moments" => Ok(Self::MomentMatching),
            _ => Err(MultimilError::config(format!(
                "kernel_type: unsupported kernel `{}`",
                s
            ))),
        }
    }
}

/// Which latent codes the integration penalty acts on
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MmdMode {
    Latent,
    Marginal,
    Both,
}

impl MmdMode {
    pub fn on_latent(&self) -> bool {
        matches!(self, Self::Latent | Self::Both)
    }

    pub fn on_marginal(&self) -> bool {
        matches!(self, Self::Marginal | Self::Both)
    }
}

impl FromStr for MmdMode {
    type Err = MultimilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "latent" => Ok(Self::Latent),
            "marginal" => Ok(Self::Marginal),
            "both" => Ok(Self::Both),
            _ => Err(MultimilError::config(format!(
                "mmd: unsupported mode `{}` (latent, marginal, both)",
                s
            ))),
        }
    }
}

/// How continuous covariates are squashed before embedding
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContCovType {
    Logsigm,
    Sigm,
    Linear,
    Mlp,
}

impl FromStr for ContCovType {
    type Err = MultimilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "logsigm" => Ok(Self::Logsigm),
            "sigm" => Ok(Self::Sigm),
            "linear" => Ok(Self::Linear),
            "mlp" => Ok(Self::Mlp),
            _ => Err(MultimilError::config(format!(
                "cont_cov_type: unsupported type `{}`",
                s
            ))),
        }
    }
}

/// Attention scoring of the cell-to-bag aggregator
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Scoring {
    Sum,
    Attn,
    GatedAttn,
    Mlp,
}

impl FromStr for Scoring {
    type Err = MultimilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "attn" => Ok(Self::Attn),
            "gated_attn" | "gated-attn" => Ok(Self::GatedAttn),
            "mlp" => Ok(Self::Mlp),
            _ => Err(MultimilError::config(format!(
                "scoring: unsupported scoring `{}` (sum, attn, gated_attn, mlp)",
                s
            ))),
        }
    }
}

/// Weights of the VAE loss terms
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LossCoefs {
    pub recon: f64,
    pub kl: f64,
    pub integ: f64,
    pub cycle: f64,
    pub nb: f64,
    pub zinb: f64,
    pub mse: f64,
    pub bce: f64,
}

impl Default for LossCoefs {
    fn default() -> Self {
        Self {
            recon: 1.0,
            kl: 1e-6,
            integ: 0.0,
            cycle: 0.0,
            nb: 1.0,
            zinb: 1.0,
            mse: 1.0,
            bce: 1.0,
        }
    }
}

impl LossCoefs {
    pub const NAMES: [&'static str; 8] =
        ["recon", "kl", "integ", "cycle", "nb", "zinb", "mse", "bce"];

    fn slot(&mut self, name: &str) -> Option<&mut f64> {
        match name {
            "recon" => Some(&mut self.recon),
            "kl" => Some(&mut self.kl),
            "integ" => Some(&mut self.integ),
            "cycle" => Some(&mut self.cycle),
            "nb" => Some(&mut self.nb),
            "zinb" => Some(&mut self.zinb),
            "mse" => Some(&mut self.mse),
            "bce" => Some(&mut self.bce),
            _ => None,
        }
    }

    /// Override a subset of the defaults; unknown names and negative
    /// weights are rejected
    pub fn with_overrides<'a, I>(mut self, overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        for (name, value) in overrides {
            if !(value.is_finite() && value >= 0.0) {
                return Err(MultimilError::config(format!(
                    "loss_coefs: `{}` must be a non-negative number, found {}",
                    name, value
                )));
            }
            match self.slot(name) {
                Some(slot) => *slot = value,
                None => {
                    return Err(MultimilError::config(format!(
                        "loss_coefs: unknown coefficient `{}` (expected one of {})",
                        name,
                        Self::NAMES.join(", ")
                    )))
                }
            }
        }
        Ok(self)
    }

    /// Parse `name=value` pairs
    pub fn parse_overrides(pairs: &[Box<str>]) -> Result<Self> {
        let parsed = pairs
            .iter()
            .map(|kv| {
                let (k, v) = kv.split_once('=').ok_or_else(|| {
                    MultimilError::config(format!("loss_coefs: expected name=value, found `{}`", kv))
                })?;
                let v = v.trim().parse::<f64>().map_err(|_| {
                    MultimilError::config(format!("loss_coefs: invalid number in `{}`", kv))
                })?;
                Ok((k.trim(), v))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::default().with_overrides(parsed)
    }

    pub fn family_weight(&self, family: LossFamily) -> f64 {
        match family {
            LossFamily::Gaussian => self.mse,
            LossFamily::Bernoulli => self.bce,
            LossFamily::NegBinomial => self.nb,
            LossFamily::Zinb => self.zinb,
        }
    }
}

/// Architecture of the multi-modal VAE
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VaeConfig {
    /// feature width of each modality; zero marks an absent modality
    pub modality_lengths: Vec<usize>,
    pub modality_names: Vec<String>,
    pub losses: Vec<LossFamily>,
    /// hidden layers of each modality encoder (decoders use the reverse)
    pub hiddens: Vec<Vec<usize>>,
    pub output_activations: Vec<OutputActivation>,
    pub shared_hiddens: Vec<usize>,
    pub z_dim: usize,
    pub h_dim: usize,
    pub cond_dim: usize,
    pub dropout: f32,
    pub normalization: NormalizationType,
    pub condition_encoders: bool,
    pub condition_decoders: bool,
    pub add_shared_decoder: bool,
    pub kernel_type: KernelType,
    pub mmd: MmdMode,
    pub loss_coefs: LossCoefs,
    /// number of levels of every categorical covariate column
    pub cat_covariate_dims: Vec<usize>,
    /// number of continuous covariate columns, size factor excluded
    pub n_cont_covariates: usize,
    pub cont_cov_type: ContCovType,
    pub n_layers_cont_embed: usize,
    pub n_hidden_cont_embed: usize,
    /// categorical covariate defining integration groups
    pub integrate_on_idx: Option<usize>,
}

impl VaeConfig {
    pub fn new(modality_lengths: Vec<usize>) -> Self {
        Self {
            modality_lengths,
            modality_names: vec![],
            losses: vec![],
            hiddens: vec![],
            output_activations: vec![],
            shared_hiddens: vec![],
            z_dim: 16,
            h_dim: 32,
            cond_dim: 16,
            dropout: 0.2,
            normalization: NormalizationType::Layer,
            condition_encoders: false,
            condition_decoders: true,
            add_shared_decoder: true,
            kernel_type: KernelType::Gaussian,
            mmd: MmdMode::Latent,
            loss_coefs: LossCoefs::default(),
            cat_covariate_dims: vec![],
            n_cont_covariates: 0,
            cont_cov_type: ContCovType::Logsigm,
            n_layers_cont_embed: 1,
            n_hidden_cont_embed: 16,
            integrate_on_idx: None,
        }
    }

    pub fn n_modality(&self) -> usize {
        self.modality_lengths.len()
    }

    pub fn total_features(&self) -> usize {
        self.modality_lengths.iter().sum()
    }

    /// Number of integration groups (levels of the integration covariate)
    pub fn num_groups(&self) -> usize {
        self.integrate_on_idx
            .and_then(|i| self.cat_covariate_dims.get(i).copied())
            .unwrap_or(1)
            .max(1)
    }

    pub fn stack_config(&self, output_activation: Option<Activation>) -> StackConfig {
        StackConfig {
            norm: self.normalization.into(),
            dropout: self.dropout,
            hidden_activation: Activation::LeakyRelu(0.01),
            output_activation,
            regularize_last_layer: true,
        }
    }

    /// Fill per-modality defaults for empty lists and check that every
    /// per-modality list has one entry per modality
    pub fn resolved(mut self) -> Result<Self> {
        let n = self.n_modality();
        if n == 0 {
            return Err(MultimilError::config(
                "modality_lengths: at least one modality is required",
            ));
        }
        if self.modality_lengths.iter().all(|&d| d == 0) {
            return Err(MultimilError::config(
                "modality_lengths: every modality has zero features",
            ));
        }

        if self.hiddens.is_empty() {
            self.hiddens = vec![vec![]; n];
        }
        if self.output_activations.is_empty() {
            self.output_activations = vec![OutputActivation::Linear; n];
        }
        if self.losses.is_empty() {
            self.losses = vec![LossFamily::Gaussian; n];
        }
        if self.modality_names.is_empty() {
            self.modality_names = (0..n).map(|i| format!("mod{}", i)).collect();
        }

        check_len("hiddens", self.hiddens.len(), n)?;
        check_len("output_activations", self.output_activations.len(), n)?;
        check_len("losses", self.losses.len(), n)?;
        check_len("modality_names", self.modality_names.len(), n)?;

        if self.z_dim == 0 || self.cond_dim == 0 || self.h_dim == 0 {
            return Err(MultimilError::config(
                "z_dim, h_dim and cond_dim must be positive",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(MultimilError::config(format!(
                "dropout must be in [0, 1): found {}",
                self.dropout
            )));
        }
        if let Some(g) = self.integrate_on_idx {
            if g >= self.cat_covariate_dims.len() {
                return Err(MultimilError::config(format!(
                    "integrate_on_idx {} is out of range for {} categorical covariates",
                    g,
                    self.cat_covariate_dims.len()
                )));
            }
        }
        if let Some(&d) = self.cat_covariate_dims.iter().find(|&&d| d == 0) {
            return Err(MultimilError::config(format!(
                "cat_covariate_dims: a categorical covariate needs at least one level, found {}",
                d
            )));
        }
        Ok(self)
    }
}

fn check_len(field: &str, found: usize, n_modality: usize) -> Result<()> {
    if found != n_modality {
        return Err(MultimilError::config(format!(
            "{} must be the same length as the number of modalities: n_modality = {} != {} = len({})",
            field, n_modality, found, field
        )));
    }
    Ok(())
}

/// Multiple-instance learning on top of the VAE
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MilConfig {
    /// categorical covariates to classify (excluded from conditioning)
    pub class_idx: Vec<usize>,
    /// categorical covariates to treat as ordinal targets
    pub ord_idx: Vec<usize>,
    /// continuous covariates to regress
    pub reg_idx: Vec<usize>,
    /// categorical covariate holding the bag (patient) identity
    pub patient_idx: Option<usize>,
    pub scoring: Scoring,
    pub attn_dim: usize,
    pub patient_batch_size: usize,
    pub class_loss_coef: f64,
    pub regression_loss_coef: f64,
    pub reg_coef: f64,
    pub add_patient_to_classifier: bool,
    pub hierarchical_attn: bool,
    pub regularize_cell_attn: bool,
    pub regularize_cov_attn: bool,
    pub regularize_vae: bool,
    pub attention_dropout: bool,
    pub drop_attn: bool,
    pub n_layers_cell_aggregator: usize,
    pub n_hidden_cell_aggregator: usize,
    pub n_layers_cov_aggregator: usize,
    pub n_hidden_cov_aggregator: usize,
    pub n_layers_classifier: usize,
    pub n_hidden_classifier: usize,
    pub n_layers_regressor: usize,
    pub n_hidden_regressor: usize,
    pub n_layers_mlp_attn: usize,
    pub n_hidden_mlp_attn: usize,
}

impl Default for MilConfig {
    fn default() -> Self {
        Self {
            class_idx: vec![],
            ord_idx: vec![],
            reg_idx: vec![],
            patient_idx: None,
            scoring: Scoring::GatedAttn,
            attn_dim: 16,
            patient_batch_size: 128,
            class_loss_coef: 1.0,
            regression_loss_coef: 1.0,
            reg_coef: 1.0,
            add_patient_to_classifier: false,
            hierarchical_attn: true,
            regularize_cell_attn: false,
            regularize_cov_attn: false,
            regularize_vae: false,
            attention_dropout: true,
            drop_attn: false,
            n_layers_cell_aggregator: 1,
            n_hidden_cell_aggregator: 16,
            n_layers_cov_aggregator: 1,
            n_hidden_cov_aggregator: 16,
            n_layers_classifier: 1,
            n_hidden_classifier: 16,
            n_layers_regressor: 1,
            n_hidden_regressor: 16,
            n_layers_mlp_attn: 1,
            n_hidden_mlp_attn: 16,
        }
    }
}

/// Full model description, persisted as `config.json`
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MultiMilConfig {
    pub vae: VaeConfig,
    pub mil: Option<MilConfig>,
}

/// Which covariate columns condition the VAE and which ones are
/// supervised targets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CovariateLayout {
    pub n_cat: usize,
    pub n_cont: usize,
    pub cat_cond_idx: Vec<usize>,
    pub cont_cond_idx: Vec<usize>,
    pub class_idx: Vec<usize>,
    pub ord_idx: Vec<usize>,
    pub reg_idx: Vec<usize>,
}

impl CovariateLayout {
    pub fn new(vae: &VaeConfig, mil: Option<&MilConfig>) -> Result<Self> {
        let n_cat = vae.cat_covariate_dims.len();
        let n_cont = vae.n_cont_covariates;

        let (class_idx, ord_idx, reg_idx) = match mil {
            Some(mil) => (mil.class_idx.clone(), mil.ord_idx.clone(), mil.reg_idx.clone()),
            None => (vec![], vec![], vec![]),
        };

        for (field, idx, bound) in [
            ("class_idx", &class_idx, n_cat),
            ("ord_idx", &ord_idx, n_cat),
            ("reg_idx", &reg_idx, n_cont),
        ] {
            if let Some(&bad) = idx.iter().find(|&&i| i >= bound) {
                return Err(MultimilError::config(format!(
                    "{}: index {} out of range ({} columns)",
                    field, bad, bound
                )));
            }
            let uniq: BTreeSet<usize> = idx.iter().copied().collect();
            if uniq.len() != idx.len() {
                return Err(MultimilError::config(format!("{}: duplicated index", field)));
            }
        }

        let targets: BTreeSet<usize> = class_idx.iter().chain(ord_idx.iter()).copied().collect();
        if targets.len() != class_idx.len() + ord_idx.len() {
            return Err(MultimilError::config(
                "class_idx and ord_idx must not share a covariate",
            ));
        }
        if let Some(g) = vae.integrate_on_idx {
            if targets.contains(&g) {
                return Err(MultimilError::config(format!(
                    "integrate_on_idx {} is also a prediction target",
                    g
                )));
            }
        }
        if let Some(p) = mil.and_then(|m| m.patient_idx) {
            if p >= n_cat || targets.contains(&p) {
                return Err(MultimilError::config(format!(
                    "patient_idx {} must be a conditioning categorical covariate",
                    p
                )));
            }
        }

        let cat_cond_idx = (0..n_cat).filter(|i| !targets.contains(i)).collect();
        let cont_cond_idx = (0..n_cont).filter(|i| !reg_idx.contains(i)).collect();

        Ok(Self {
            n_cat,
            n_cont,
            cat_cond_idx,
            cont_cond_idx,
            class_idx,
            ord_idx,
            reg_idx,
        })
    }

    /// width of the concatenated condition embedding
    pub fn cond_width(&self, cond_dim: usize) -> usize {
        cond_dim * (self.cat_cond_idx.len() + usize::from(!self.cont_cond_idx.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_coefs_override_subset() -> Result<()> {
        let coefs = LossCoefs::default().with_overrides([("kl", 0.1), ("integ", 2.0)])?;
        assert_eq!(coefs.kl, 0.1);
        assert_eq!(coefs.integ, 2.0);
        assert_eq!(coefs.recon, 1.0);
        assert_eq!(coefs.family_weight(LossFamily::NegBinomial), 1.0);
        Ok(())
    }

    #[test]
    fn loss_coefs_reject_unknown_and_negative() {
        let err = LossCoefs::default().with_overrides([("itneg", 1.0)]).unwrap_err();
        assert!(matches!(err, MultimilError::Configuration(ref m) if m.contains("itneg")));
        assert!(LossCoefs::default().with_overrides([("kl", -1.0)]).is_err());
        assert!(LossCoefs::parse_overrides(&["kl0.1".into()]).is_err());
        let parsed = LossCoefs::parse_overrides(&["cycle=0.5".into()]).unwrap();
        assert_eq!(parsed.cycle, 0.5);
    }

    #[test]
    fn mismatched_modality_lists_name_the_field() {
        let mut config = VaeConfig::new(vec![10, 5]);
        config.losses = vec![LossFamily::Gaussian];
        let err = config.resolved().unwrap_err();
        assert!(matches!(err, MultimilError::Configuration(ref m) if m.starts_with("losses")));

        let mut config = VaeConfig::new(vec![10, 5]);
        config.hiddens = vec![vec![8], vec![8], vec![8]];
        let err = config.resolved().unwrap_err();
        assert!(matches!(err, MultimilError::Configuration(ref m) if m.starts_with("hiddens")));
    }

    #[test]
    fn unsupported_names_are_rejected() {
        assert!("group".parse::<NormalizationType>().is_err());
        assert!("poisson".parse::<LossFamily>().is_err());
        assert_eq!("bce".parse::<LossFamily>().unwrap(), LossFamily::Bernoulli);
        assert_eq!("gated_attn".parse::<Scoring>().unwrap(), Scoring::GatedAttn);
    }

    #[test]
    fn targets_are_excluded_from_conditioning() -> Result<()> {
        let mut vae = VaeConfig::new(vec![4]);
        vae.cat_covariate_dims = vec![3, 2, 5];
        vae.n_cont_covariates = 2;
        let mil = MilConfig {
            class_idx: vec![1],
            reg_idx: vec![0],
            ..Default::default()
        };
        let layout = CovariateLayout::new(&vae, Some(&mil))?;
        assert_eq!(layout.cat_cond_idx, vec![0, 2]);
        assert_eq!(layout.cont_cond_idx, vec![1]);
        assert_eq!(layout.cond_width(16), 48);

        let bad = MilConfig {
            class_idx: vec![1],
            ord_idx: vec![1],
            ..Default::default()
        };
        assert!(CovariateLayout::new(&vae, Some(&bad)).is_err());
        Ok(())
    }
}
