use crate::common::*;
use crate::dataset::{BagLoader, DataLoader, MultimodalData};
use crate::history::History;
use crate::loss::{LossAccumulator, LossRecord};
use crate::model::MultiMil;

use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use std::collections::HashMap;

pub struct TrainConfig {
    pub num_epochs: usize,
    pub learning_rate: f32,
    pub weight_decay: f32,
    /// cells per minibatch of a VAE-only model
    pub batch_size: usize,
    /// bag slices per minibatch
    pub bags_per_batch: usize,
    /// fraction of bags held out for validation
    pub validation_split: f32,
    /// stop when `recon_loss_validation` has not improved for `patience`
    /// epochs, then restore the best parameters
    pub early_stopping: bool,
    pub patience: usize,
    /// epochs over which the KL weight ramps up linearly to one
    pub kl_warmup: Option<usize>,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_epochs: 200,
            learning_rate: 1e-3,
            weight_decay: 1e-3,
            batch_size: 256,
            bags_per_batch: 1,
            validation_split: 0.1,
            early_stopping: false,
            patience: 5,
            kl_warmup: None,
            verbose: false,
            show_progress: true,
        }
    }
}

impl TrainConfig {
    fn kl_weight(&self, epoch: usize) -> f64 {
        match self.kl_warmup {
            Some(w) if w > 0 => ((epoch + 1) as f64 / w as f64).min(1.0),
            _ => 1.0,
        }
    }
}

type Snapshot = HashMap<String, Tensor>;

fn snapshot(varmap: &VarMap) -> anyhow::Result<Snapshot> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("parameter map lock poisoned"))?;
    vars.iter()
        .map(|(k, v)| Ok((k.clone(), v.as_tensor().copy()?)))
        .collect()
}

fn restore(varmap: &VarMap, snap: &Snapshot) -> anyhow::Result<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("parameter map lock poisoned"))?;
    for (k, v) in vars.iter() {
        if let Some(t) = snap.get(k) {
            v.set(t)?;
        }
    }
    Ok(())
}

/// Mean loss record over every minibatch, no parameter update
fn evaluate<DataL: DataLoader>(
    model: &MultiMil,
    data: &DataL,
    device: &Device,
    kl_weight: f64,
) -> anyhow::Result<LossRecord> {
    let mut acc = LossAccumulator::default();
    for b in 0..data.num_minibatch() {
        let batch = data.minibatch_data(b, device)?;
        acc.add(&model.loss(&batch, false, kl_weight)?.record);
    }
    Ok(acc.mean())
}

/// Train every parameter of `model` with AdamW
///
/// Bags are split into training and validation sets once. Each epoch
/// reshuffles cells within training bags and the order of bag slices.
pub fn fit(
    model: &MultiMil,
    data: &MultimodalData,
    config: &TrainConfig,
) -> anyhow::Result<History> {
    model.check_data(data)?;
    let device = model.device();
    let stride = model.stride(config.batch_size);

    let (train_bags, valid_bags) = data.split_bags(config.validation_split)?;
    let mut train_data = BagLoader::new(data, &train_bags, stride)?;
    let valid_data = if valid_bags.is_empty() {
        None
    } else {
        let mut loader = BagLoader::new(data, &valid_bags, stride)?;
        loader.sequential_minibatch(config.bags_per_batch);
        Some(loader)
    };

    info!(
        "training on {} bags ({} cells), validating on {} bags",
        train_bags.len(),
        train_data.num_cells(),
        valid_bags.len()
    );

    let params = ParamsAdamW {
        lr: config.learning_rate as f64,
        weight_decay: config.weight_decay as f64,
        ..Default::default()
    };
    let mut adam = AdamW::new(model.varmap().all_vars(), params)?;

    let pb = ProgressBar::new(config.num_epochs as u64);
    if !config.show_progress || config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut history = History::new();
    let mut best: Option<(f32, usize, Snapshot)> = None;
    let mut since_best = 0;

    for epoch in 0..config.num_epochs {
        let kl_weight = config.kl_weight(epoch);
        train_data.shuffle_minibatch(config.bags_per_batch)?;

        let mut acc = LossAccumulator::default();
        for b in 0..train_data.num_minibatch() {
            let batch = train_data.minibatch_data(b, device)?;
            let out = model.loss(&batch, true, kl_weight)?;
            adam.backward_step(&out.loss)?;
            acc.add(&out.record);
        }
        let train_rec = acc.mean();

        let valid_rec = match valid_data.as_ref() {
            Some(v) => Some(evaluate(model, v, device, kl_weight)?),
            None => None,
        };

        history.push_epoch(&train_rec, valid_rec.as_ref());
        pb.inc(1);

        if config.verbose {
            info!(
                "[{}] loss: {:.4}, recon: {:.4}, validation recon: {}",
                epoch + 1,
                train_rec.loss,
                train_rec.recon_loss,
                valid_rec
                    .as_ref()
                    .map(|v| format!("{:.4}", v.recon_loss))
                    .unwrap_or_else(|| "-".into())
            );
        }

        if config.early_stopping {
            let monitored = valid_rec.as_ref().unwrap_or(&train_rec).recon_loss;
            let improved = match &best {
                Some((b, _, _)) => monitored < *b,
                None => true,
            };
            if improved {
                best = Some((monitored, epoch, snapshot(model.varmap())?));
                since_best = 0;
            } else {
                since_best += 1;
            }
            if since_best >= config.patience.max(1) {
                info!("early stopping after epoch {}", epoch + 1);
                break;
            }
        }
    }
    pb.finish_and_clear();

    if let Some((value, epoch, snap)) = best {
        restore(model.varmap(), &snap)?;
        info!(
            "restored the parameters of epoch {} (recon_loss {:.4})",
            epoch + 1,
            value
        );
    }

    Ok(history)
}
