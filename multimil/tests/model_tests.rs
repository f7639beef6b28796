use candle_util::candle_core::Device;
use multimil::config::{LossFamily, MilConfig, MultiMilConfig, VaeConfig};
use multimil::dataset::{MultimodalData, SetupArgs};
use multimil::simulate::{simulate, SimulateArgs};
use multimil::{LossCoefs, MultiMil, MultimilError, TrainConfig};

fn is_precondition(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<MultimilError>(),
        Some(MultimilError::Precondition(_))
    )
}

fn simulated() -> anyhow::Result<MultimodalData> {
    let mut data = simulate(&SimulateArgs {
        bags: 4,
        cells_per_bag: 6,
        rna_features: 12,
        protein_features: 4,
        protein_missing: 0.25,
        ..Default::default()
    })?;
    data.setup(&SetupArgs {
        size_factor_key: Some("size_factor".into()),
        ..Default::default()
    })?;
    Ok(data)
}

fn vae_config(data: &MultimodalData, z_dim: usize) -> VaeConfig {
    let mut vae = VaeConfig::new(data.modality_lengths.clone());
    vae.modality_names = data.modality_names.clone();
    vae.losses = vec![LossFamily::NegBinomial, LossFamily::Gaussian];
    vae.z_dim = z_dim;
    vae.dropout = 0.0;
    vae.cat_covariate_dims = data.categorical_dims();
    vae.n_cont_covariates = data.n_cont_covariates();
    vae.integrate_on_idx = data.categorical_index("group");
    vae
}

fn quick_train() -> TrainConfig {
    TrainConfig {
        num_epochs: 3,
        validation_split: 0.0,
        show_progress: false,
        ..Default::default()
    }
}

#[test]
fn two_modality_batch_reconstructs_every_block() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let mut x = multimil::common::Mat::zeros(3, 15);
    for r in 0..3 {
        for c in 0..10 {
            x[(r, c)] = (r + c) as f32 * 0.1;
        }
    }
    // the third cell has no binary block
    x[(0, 10)] = 1.0;
    x[(1, 12)] = 1.0;

    let mut data = MultimodalData::new(x, vec![10, 5]);
    data.setup(&SetupArgs {
        rna_indices_end: Some(10),
        ..Default::default()
    })?;

    let mut vae = VaeConfig::new(vec![10, 5]);
    vae.losses = vec![LossFamily::Gaussian, LossFamily::Bernoulli];
    vae.z_dim = 4;
    let model = MultiMil::new(MultiMilConfig { vae, mil: None }, &dev)?;

    let batch = data.cell_batch(&[0, 1, 2], model.stride(256), &dev)?;
    let out = model.forward(&batch, true)?;
    let widths: Vec<usize> = out
        .reconstructions
        .iter()
        .map(|r| r.as_ref().map(|o| o.raw().dims()[1]).unwrap_or(0))
        .collect();
    assert_eq!(widths, vec![10, 5]);
    for m in out.inference.masks.iter() {
        assert_eq!(m.dims(), &[3]);
    }
    assert_eq!(out.inference.masks[1].to_vec1::<u8>()?, vec![1, 1, 0]);

    let loss = model.loss(&batch, true, 1.0)?;
    assert!(loss.record.loss.is_finite());
    assert!(loss.record.recon_loss > 0.0);
    assert!(loss.record.accuracy.is_none());
    Ok(())
}

#[test]
fn inference_needs_a_trained_model() -> anyhow::Result<()> {
    let data = simulated()?;
    let model = MultiMil::new(
        MultiMilConfig {
            vae: vae_config(&data, 4),
            mil: None,
        },
        &Device::Cpu,
    )?;
    let err = model
        .get_latent_representation(&data, 8)
        .err()
        .expect("untrained model");
    assert!(is_precondition(&err));
    assert!(is_precondition(
        &model.impute(&data, "protein", None, 8).err().expect("untrained")
    ));
    Ok(())
}

#[test]
fn latent_and_imputation_cover_every_cell() -> anyhow::Result<()> {
    let data = simulated()?;
    let mut model = MultiMil::new(
        MultiMilConfig {
            vae: vae_config(&data, 3),
            mil: None,
        },
        &Device::Cpu,
    )?;
    let history = model.train(&data, &quick_train())?;
    assert_eq!(history.num_epochs(), 3);

    let latent = model.get_latent_representation(&data, 5)?;
    assert_eq!(latent.shape(), (24, 3));
    assert!(latent.iter().all(|v| v.is_finite()));

    let table = model.impute(&data, "protein", Some("bag2"), 4)?;
    assert_eq!(table.values.shape(), (6, 4));
    assert_eq!(table.source_modalities, vec!["rna".to_string()]);
    assert!(table.bags.iter().all(|b| b == "bag2"));

    assert!(is_precondition(
        &model.impute(&data, "atac", None, 4).err().expect("bad target")
    ));
    Ok(())
}

#[test]
fn saved_models_load_bit_identical() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let data = simulated()?;
    let config = MultiMilConfig {
        vae: vae_config(&data, 4),
        mil: Some(MilConfig {
            class_idx: vec![data.categorical_index("class").expect("class column")],
            patient_batch_size: 6,
            ..Default::default()
        }),
    };
    let mut model = MultiMil::new(config, &dev)?;
    model.train(&data, &quick_train())?;

    let dir = tempfile::tempdir()?;
    let dir = dir.path().to_str().expect("utf-8 path").to_string();
    model.save(&dir)?;

    let loaded = MultiMil::from_dir(&dir, &dev)?;
    assert!(loaded.is_trained());
    assert_eq!(
        loaded.history().column("loss_train"),
        model.history().column("loss_train")
    );

    let ours = model.varmap().data().lock().expect("lock");
    let theirs = loaded.varmap().data().lock().expect("lock");
    assert_eq!(ours.len(), theirs.len());
    for (name, var) in ours.iter() {
        let a: Vec<f32> = var.as_tensor().flatten_all()?.to_vec1()?;
        let b: Vec<f32> = theirs[name].as_tensor().flatten_all()?.to_vec1()?;
        assert_eq!(a, b, "{}", name);
    }
    drop(ours);
    drop(theirs);

    let pred = loaded.predict(&data)?;
    assert_eq!(pred.bags.len(), 4);
    assert_eq!(pred.tasks, vec!["class".to_string()]);

    // a different latent width does not fit the saved parameters
    let mut other = MultiMil::new(
        MultiMilConfig {
            vae: vae_config(&data, 5),
            mil: None,
        },
        &dev,
    )?;
    let err = other.load(&dir).err().expect("shape mismatch");
    assert!(is_precondition(&err));
    assert!(err.to_string().contains("parameter `"));
    Ok(())
}

#[test]
fn configuration_errors_are_raised_at_construction() {
    let mut vae = VaeConfig::new(vec![10, 5]);
    vae.losses = vec![LossFamily::Gaussian];
    let err = MultiMil::new(MultiMilConfig { vae, mil: None }, &Device::Cpu)
        .err()
        .expect("length mismatch");
    assert!(matches!(err, MultimilError::Configuration(_)));
    assert!(err.to_string().contains("losses"));

    let err = LossCoefs::parse_overrides(&["kl=1".into(), "gamma=2".into()])
        .err()
        .expect("unknown coefficient");
    assert!(matches!(err, MultimilError::Configuration(_)));

    let coefs = LossCoefs::parse_overrides(&["integ=0.5".into()]).expect("valid override");
    assert_eq!(coefs.integ, 0.5);
    assert_eq!(coefs.kl, LossCoefs::default().kl);
}

#[test]
fn data_must_match_the_model_layout() -> anyhow::Result<()> {
    let data = simulated()?;
    let mut vae = vae_config(&data, 4);
    vae.n_cont_covariates = 1;
    let mut model = MultiMil::new(MultiMilConfig { vae, mil: None }, &Device::Cpu)?;
    let err = model.train(&data, &quick_train()).err().expect("width mismatch");
    assert!(is_precondition(&err));
    Ok(())
}
