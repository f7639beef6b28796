use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{ModuleT, VarBuilder, VarMap};
use candle_util::candle_aux_layers::*;
use candle_util::candle_loss_functions::*;

#[test]
fn relu_stack_names_and_shapes() -> Result<()> {
    let dev = Device::Cpu;
    let vm = VarMap::new();
    let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);

    let mlp = stack_relu_layers(6, 4, 2, 8, Normalization::Layer, 0.0, vb.pp("cell.mlp"))?;
    assert_eq!(mlp.num_layers(), 2);
    assert_eq!(mlp.dim_in(), 6);
    assert_eq!(mlp.dim_out(), 4);

    let x = Tensor::randn(0f32, 1f32, (3, 5, 6), &dev)?;
    let h = mlp.forward_t(&x, false)?;
    assert_eq!(h.dims(), &[3, 5, 4]);

    // relu output
    let min = h.flatten_all()?.min(0)?.to_scalar::<f32>()?;
    assert!(min >= 0.0);

    let data = vm.data().lock().expect("varmap lock");
    assert!(data.contains_key("cell.mlp.fc.0.weight"));
    assert!(data.contains_key("cell.mlp.fc.1.norm.weight"));
    Ok(())
}

#[test]
fn nb_likelihood_prefers_the_true_mean() -> Result<()> {
    let dev = Device::Cpu;
    let x = Tensor::from_vec(vec![4f32, 4.0, 4.0, 4.0], (1, 4), &dev)?;
    let theta = Tensor::full(10f32, (1, 4), &dev)?;

    let llik = |m: f32| -> Result<f32> {
        let mu = Tensor::full(m, (1, 4), &dev)?;
        nb_likelihood(&x, &mu, &theta)?.sum_all()?.to_scalar::<f32>()
    };
    let at_truth = llik(4.0)?;
    assert!(at_truth > llik(1.0)?);
    assert!(at_truth > llik(16.0)?);
    Ok(())
}

#[test]
fn squared_error_sums_features() -> Result<()> {
    let dev = Device::Cpu;
    let x = Tensor::from_vec(vec![1f32, 2.0, 3.0, 0.0], (2, 2), &dev)?;
    let y = Tensor::from_vec(vec![0f32, 0.0, 1.0, 1.0], (2, 2), &dev)?;
    let se: Vec<f32> = squared_error_loss(&x, &y)?.to_vec1()?;
    assert_eq!(se, vec![5.0, 5.0]);
    Ok(())
}
