use candle_util::candle_core::Device;
use multimil::common::Mat;
use multimil::config::{LossFamily, MilConfig, MmdMode, MultiMilConfig, VaeConfig};
use multimil::dataset::{MultimodalData, SetupArgs};
use multimil::simulate::{simulate, SimulateArgs};
use multimil::{LossCoefs, MultiMil, TrainConfig};

fn two_blocks(overlap: bool) -> anyhow::Result<MultimodalData> {
    // cells 0..4 carry the first block, cells 4..8 the second
    let x = Mat::from_fn(8, 7, |r, c| {
        let first = c < 4;
        let present = overlap || (first == (r < 4));
        if present {
            ((r * 7 + c) as f32 * 0.37).sin() + 1.5
        } else {
            0.0
        }
    });
    let mut data = MultimodalData::new(x, vec![4, 3]);
    data.setup(&SetupArgs {
        rna_indices_end: Some(4),
        ..Default::default()
    })?;
    Ok(data)
}

fn marginal_model() -> anyhow::Result<MultiMil> {
    let mut vae = VaeConfig::new(vec![4, 3]);
    vae.losses = vec![LossFamily::Gaussian, LossFamily::Gaussian];
    vae.z_dim = 3;
    vae.dropout = 0.0;
    vae.mmd = MmdMode::Marginal;
    vae.loss_coefs = LossCoefs {
        integ: 1.0,
        ..Default::default()
    };
    Ok(MultiMil::new(MultiMilConfig { vae, mil: None }, &Device::Cpu)?)
}

#[test]
fn marginal_pairs_need_both_blocks() -> anyhow::Result<()> {
    let model = marginal_model()?;
    let dev = Device::Cpu;
    let positions: Vec<usize> = (0..8).collect();

    let disjoint = two_blocks(false)?;
    let batch = disjoint.cell_batch(&positions, model.stride(256), &dev)?;
    let out = model.forward(&batch, false)?;
    assert_eq!(out.inference.masks[0].to_vec1::<u8>()?, vec![1, 1, 1, 1, 0, 0, 0, 0]);
    assert_eq!(out.inference.masks[1].to_vec1::<u8>()?, vec![0, 0, 0, 0, 1, 1, 1, 1]);

    // no cell holds both blocks and there is one integration group
    let record = model.loss(&batch, false, 1.0)?.record;
    assert!(record.loss.is_finite());
    assert_eq!(record.integ_loss, 0.0);

    let paired = two_blocks(true)?;
    let batch = paired.cell_batch(&positions, model.stride(256), &dev)?;
    let record = model.loss(&batch, false, 1.0)?.record;
    assert!(record.loss.is_finite());
    assert!(record.integ_loss.is_finite());
    assert!(record.integ_loss != 0.0);
    Ok(())
}

fn cycle_config(data: &MultimodalData, mmd: MmdMode) -> VaeConfig {
    let mut vae = VaeConfig::new(data.modality_lengths.clone());
    vae.modality_names = data.modality_names.clone();
    vae.losses = vec![LossFamily::NegBinomial, LossFamily::Gaussian];
    vae.z_dim = 3;
    vae.cat_covariate_dims = data.categorical_dims();
    vae.n_cont_covariates = data.n_cont_covariates();
    vae.integrate_on_idx = data.categorical_index("group");
    vae.mmd = mmd;
    vae.loss_coefs = LossCoefs {
        integ: 1.0,
        cycle: 1.0,
        ..Default::default()
    };
    vae
}

#[test]
fn cycle_and_integration_terms_train_with_missing_blocks() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let mut data = simulate(&SimulateArgs {
        bags: 3,
        cells_per_bag: 10,
        rna_features: 12,
        protein_features: 4,
        protein_missing: 0.3,
        ..Default::default()
    })?;
    data.setup(&SetupArgs {
        size_factor_key: Some("size_factor".into()),
        ..Default::default()
    })?;

    for mmd in [MmdMode::Latent, MmdMode::Marginal, MmdMode::Both] {
        let mut model = MultiMil::new(
            MultiMilConfig {
                vae: cycle_config(&data, mmd),
                mil: None,
            },
            &dev,
        )?;

        let positions: Vec<usize> = data.bag_ranges(&[0])?.into_iter().flatten().collect();
        let batch = data.cell_batch(&positions, model.stride(256), &dev)?;
        let record = model.loss(&batch, true, 1.0)?.record;
        assert!(record.cycle_loss.is_finite() && record.cycle_loss > 0.0, "{:?}", mmd);
        assert!(record.integ_loss.is_finite(), "{:?}", mmd);
        assert!(record.loss.is_finite(), "{:?}", mmd);

        let history = model.train(
            &data,
            &TrainConfig {
                num_epochs: 2,
                validation_split: 0.0,
                show_progress: false,
                ..Default::default()
            },
        )?;
        let cycle = history.column("cycle_loss_train").expect("cycle column");
        assert!(cycle.iter().all(|v| v.is_finite()));
    }
    Ok(())
}

#[test]
fn long_bags_pack_into_shared_minibatches() -> anyhow::Result<()> {
    let mut data = simulate(&SimulateArgs {
        bags: 2,
        cells_per_bag: 16,
        rna_features: 10,
        protein_features: 3,
        ..Default::default()
    })?;
    data.setup(&SetupArgs {
        size_factor_key: Some("size_factor".into()),
        ..Default::default()
    })?;

    let mut vae = VaeConfig::new(data.modality_lengths.clone());
    vae.losses = vec![LossFamily::NegBinomial, LossFamily::Gaussian];
    vae.z_dim = 3;
    vae.cat_covariate_dims = data.categorical_dims();
    vae.n_cont_covariates = data.n_cont_covariates();

    let mil = MilConfig {
        class_idx: vec![data.categorical_index("class").expect("class column")],
        patient_batch_size: 8,
        ..Default::default()
    };
    let mut model = MultiMil::new(
        MultiMilConfig {
            vae,
            mil: Some(mil),
        },
        &Device::Cpu,
    )?;

    // four stride pieces per minibatch, two from each bag, in shuffled order
    let history = model.train(
        &data,
        &TrainConfig {
            num_epochs: 20,
            bags_per_batch: 4,
            validation_split: 0.0,
            show_progress: false,
            ..Default::default()
        },
    )?;
    assert_eq!(history.num_epochs(), 20);
    let loss = history.column("loss_train").expect("loss column");
    assert!(loss.iter().all(|v| v.is_finite()));
    Ok(())
}
