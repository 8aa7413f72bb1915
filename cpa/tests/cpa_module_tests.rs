use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{AdamW, Optimizer, VarBuilder, VarMap};
use cpa::cpa_module::*;
use cpa::*;
use std::collections::BTreeMap;

const N_GENES: usize = 50;
const N_DRUGS: usize = 3;
const N_LATENT: usize = 16;

fn config(covariates: &[(&str, usize)], likelihood: Likelihood) -> Result<CpaConfig> {
    let mut config = CpaConfig::new(N_GENES, N_DRUGS, CovariateVocab::from_pairs(covariates)?);
    config.n_latent = N_LATENT;
    config.likelihood = likelihood;
    config.autoencoder_width = 32;
    config.adversary_width = 16;
    config.adversary_depth = 2;
    Ok(config)
}

fn build(config: CpaConfig, vm: &VarMap) -> Result<CpaModule> {
    let vs = VarBuilder::from_varmap(vm, DType::F32, &Device::Cpu);
    CpaModule::new(config, vs)
}

/// two control cells and two cells on the first drug, in two batches
fn four_cells(counts: bool) -> Result<CellBatch> {
    let dev = Device::Cpu;
    let x = Tensor::rand(0f32, 5f32, (4, N_GENES), &dev)?;
    let x = if counts { x.floor()? } else { x };
    let doses = Tensor::new(
        &[
            [0f32, 0., 0.],
            [0., 0., 0.],
            [1., 0., 0.],
            [1., 0., 0.],
        ],
        &dev,
    )?;
    Ok(CellBatch::new(x, doses).with_covariate("batch", Tensor::new(&[0u32, 1, 0, 1], &dev)?))
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.max_all()?.to_scalar::<f32>()
}

#[test]
fn gaussian_forward_and_losses() -> Result<()> {
    let vm = VarMap::new();
    let model = build(config(&[("batch", 2)], Likelihood::Gaussian)?, &vm)?;
    let batch = four_cells(false)?;

    let (inference, generative) = model.forward(&batch, true)?;
    assert_eq!(inference.latent.dims(), &[4, N_LATENT]);
    assert_eq!(inference.latent_basal.dims(), &[4, N_LATENT]);
    assert!(inference.dist_qz.is_none());
    assert!(inference.library.is_none());
    assert_eq!(generative.drugs_pred().dims(), &[4, N_DRUGS]);
    assert_eq!(generative.covars_pred("batch").map(|t| t.dims().to_vec()), Some(vec![4, 2]));

    let loss = model.loss(&batch, &inference, &generative)?.to_scalar::<f32>()?;
    assert!(loss.is_finite());

    // mean over all entries of the Gaussian negative log-likelihood
    match &generative.reconstruction {
        Reconstruction::Gaussian(recon) => {
            let x = batch.genes()?;
            let var = &recon.var_nd;
            let nll = ((var.log()? * 0.5)? + ((x - &recon.mean_nd)?.sqr()? / (var * 2.)?)?)?
                .mean_all()?
                .to_scalar::<f32>()?;
            assert_abs_diff_eq!(loss, nll, epsilon = 1e-4);
        }
        _ => panic!("expected a Gaussian reconstruction"),
    }

    let (adv_loss, adv_penalty) = model.adversarial_loss(&batch, &inference, &generative)?;
    assert!(adv_loss.to_scalar::<f32>()?.is_finite());
    let penalty = adv_penalty.to_scalar::<f32>()?;
    assert!(penalty.is_finite() && penalty >= 0.);

    assert!(model.kl_divergence(&inference)?.is_none());
    Ok(())
}

#[test]
fn gaussian_expression_moments() -> Result<()> {
    let vm = VarMap::new();
    let model = build(config(&[("batch", 2)], Likelihood::Gaussian)?, &vm)?;
    let (mean, var) = model.get_expression(&four_cells(false)?)?;
    assert_eq!(mean.dims(), &[4, N_GENES]);
    assert_eq!(var.dims(), &[4, N_GENES]);
    assert!(var.min_all()?.to_scalar::<f32>()? > 0.);
    Ok(())
}

#[test]
fn count_likelihood() -> Result<()> {
    let vm = VarMap::new();
    let model = build(config(&[("batch", 2)], Likelihood::NegativeBinomial)?, &vm)?;
    let batch = four_cells(true)?;

    assert!(model.get_expression(&batch).is_err());

    let (inference, generative) = model.forward(&batch, true)?;
    assert_eq!(inference.library.as_ref().map(|l| l.dims().to_vec()), Some(vec![4, 1]));
    assert_eq!(model.dispersion().dims(), &[N_GENES]);

    let loss = model.loss(&batch, &inference, &generative)?.to_scalar::<f32>()?;
    assert!(loss.is_finite() && loss > 0.);

    let mu = generative.reconstruction.mean();
    assert_eq!(mu.dims(), &[4, N_GENES]);
    assert!(mu.min_all()?.to_scalar::<f32>()? >= 0.);
    Ok(())
}

#[test]
fn variational_kl_term() -> Result<()> {
    let vm = VarMap::new();
    let mut config = config(&[("batch", 2)], Likelihood::Gaussian)?;
    config.variational = true;
    let model = build(config, &vm)?;

    let (inference, _) = model.forward(&four_cells(false)?, true)?;
    assert!(inference.dist_qz.is_some());
    let kl = model
        .kl_divergence(&inference)?
        .map(|kl| kl.to_scalar::<f32>())
        .transpose()?;
    assert!(matches!(kl, Some(x) if x >= 0.));
    Ok(())
}

#[test]
fn composer_with_zero_one_or_many_covariates() -> Result<()> {
    let dev = Device::Cpu;
    let vocabs: [&[(&str, usize)]; 3] = [
        &[],
        &[("batch", 2)],
        &[("batch", 2), ("cell_type", 4), ("donor", 3)],
    ];

    for covariates in vocabs {
        let vm = VarMap::new();
        let model = build(config(covariates, Likelihood::Gaussian)?, &vm)?;

        let basal = Tensor::randn(0f32, 1f32, (5, N_LATENT), &dev)?;
        let doses = Tensor::rand(0f32, 2f32, (5, N_DRUGS), &dev)?;
        let mut levels = BTreeMap::new();
        for (name, n_levels) in covariates {
            let lv: Vec<u32> = (0..5).map(|i| (i % n_levels) as u32).collect();
            levels.insert(Box::<str>::from(*name), Tensor::new(lv, &dev)?);
        }

        let latent = model.compose_latent(&basal, &doses, &levels)?;
        assert_eq!(latent.dims(), &[5, N_LATENT]);

        // removing the drugs leaves exactly the linear drug term
        let zeros = Tensor::zeros((5, N_DRUGS), DType::F32, &dev)?;
        let without = model.compose_latent(&basal, &zeros, &levels)?;
        let drug_term = doses.matmul(model.drug_embeddings())?;
        assert!(max_abs_diff(&(&latent - &without)?, &drug_term)? < 1e-4);

        if covariates.is_empty() {
            assert!(max_abs_diff(&without, &basal)? < 1e-6);
        }
    }
    Ok(())
}

#[test]
fn counterfactual_keeps_basal_state() -> Result<()> {
    let dev = Device::Cpu;
    let vm = VarMap::new();
    let model = build(config(&[("batch", 2)], Likelihood::Gaussian)?, &vm)?;
    let batch = four_cells(false)?;

    let (observed_mean, _) = model.get_expression(&batch)?;

    // the observed doses reproduce the observed prediction
    let same = model.predict_counterfactual(&batch, &Counterfactual::default())?;
    assert!(max_abs_diff(same.mean(), &observed_mean)? < 1e-5);

    // withdrawing all drugs changes only the treated cells
    let untreated = Counterfactual {
        doses_nd: Some(Tensor::zeros((4, N_DRUGS), DType::F32, &dev)?),
        ..Default::default()
    };
    let recon = model.predict_counterfactual(&batch, &untreated)?;
    let controls = recon.mean().narrow(0, 0, 2)?;
    assert!(max_abs_diff(&controls, &observed_mean.narrow(0, 0, 2)?)? < 1e-5);

    // covariate overrides must be known and in range
    let mut swap = Counterfactual::default();
    swap.covariates.insert("batch".into(), Tensor::new(&[1u32, 0, 1, 0], &dev)?);
    assert_eq!(model.predict_counterfactual(&batch, &swap)?.mean().dims(), &[4, N_GENES]);

    swap.covariates.insert("batch".into(), Tensor::new(&[2u32, 0, 1, 0], &dev)?);
    assert!(model.predict_counterfactual(&batch, &swap).is_err());

    let mut unknown = Counterfactual::default();
    unknown.covariates.insert("donor".into(), Tensor::new(&[0u32, 0, 0, 0], &dev)?);
    assert!(model.predict_counterfactual(&batch, &unknown).is_err());
    Ok(())
}

#[test]
fn penalty_reaches_adversary_parameters() -> Result<()> {
    let vm = VarMap::new();
    let model = build(config(&[("batch", 2)], Likelihood::Gaussian)?, &vm)?;
    let batch = four_cells(false)?;

    let (inference, generative) = model.forward(&batch, true)?;
    let (_, penalty) = model.adversarial_loss(&batch, &inference, &generative)?;
    let grads = penalty.backward()?;

    let groups = parameter_groups(&vm)?;
    let mut n_nonzero = 0;
    for var in groups.adversary.iter() {
        if let Some(g) = grads.get(var.as_tensor()) {
            if g.abs()?.sum_all()?.to_scalar::<f32>()? > 0. {
                n_nonzero += 1;
            }
        }
    }
    assert!(n_nonzero > 0);
    Ok(())
}

#[test]
fn adversary_step_leaves_autoencoder_alone() -> Result<()> {
    let vm = VarMap::new();
    let model = build(config(&[("batch", 2)], Likelihood::Gaussian)?, &vm)?;
    let batch = four_cells(false)?;

    let groups = parameter_groups(&vm)?;
    assert_eq!(
        groups.autoencoder.len() + groups.adversary.len(),
        vm.all_vars().len()
    );
    assert!(!groups.autoencoder.is_empty() && !groups.adversary.is_empty());

    let before: Vec<Tensor> = groups
        .autoencoder
        .iter()
        .map(|v| v.as_tensor().copy())
        .collect::<Result<_>>()?;
    let adv_before: Vec<Tensor> = groups
        .adversary
        .iter()
        .map(|v| v.as_tensor().copy())
        .collect::<Result<_>>()?;

    let mut adam = AdamW::new_lr(groups.adversary.clone(), 1e-2)?;
    let (inference, generative) = model.forward(&batch, false)?;
    let (adv_loss, adv_penalty) = model.adversarial_loss(&batch, &inference, &generative)?;
    adam.backward_step(&(adv_loss + adv_penalty)?)?;

    for (var, old) in groups.autoencoder.iter().zip(before) {
        assert_eq!(max_abs_diff(var.as_tensor(), &old)?, 0.);
    }
    let mut n_changed = 0;
    for (var, old) in groups.adversary.iter().zip(adv_before) {
        if max_abs_diff(var.as_tensor(), &old)? > 0. {
            n_changed += 1;
        }
    }
    assert!(n_changed > 0);
    Ok(())
}

#[test]
fn inputs_are_coerced_to_the_module() -> Result<()> {
    let dev = Device::Cpu;
    let vm = VarMap::new();
    let model = build(config(&[("batch", 2)], Likelihood::Gaussian)?, &vm)?;

    let batch = CellBatch::new(
        Tensor::rand(0f64, 5f64, (3, N_GENES), &dev)?,
        Tensor::new(&[[0f64, 0., 0.], [0., 0.5, 0.], [0., 0., 2.]], &dev)?,
    )
    .with_covariate("batch", Tensor::new(&[[1i64], [0], [1]], &dev)?);

    let (inference, _) = model.forward(&batch, false)?;
    assert_eq!(inference.latent.dtype(), DType::F32);
    assert_eq!(inference.covariates["batch"].dtype(), DType::U32);
    Ok(())
}

#[test]
fn contract_violations_are_errors() -> Result<()> {
    let dev = Device::Cpu;
    let vm = VarMap::new();
    let model = build(config(&[("batch", 2)], Likelihood::Gaussian)?, &vm)?;

    // unknown covariate
    let batch = four_cells(false)?.with_covariate("donor", Tensor::new(&[0u32, 0, 0, 0], &dev)?);
    assert!(model.forward(&batch, true).is_err());

    // missing covariate
    let batch = CellBatch::new(
        Tensor::zeros((2, N_GENES), DType::F32, &dev)?,
        Tensor::zeros((2, N_DRUGS), DType::F32, &dev)?,
    );
    assert!(model.forward(&batch, true).is_err());

    // level out of range
    let batch = four_cells(false)?.with_covariate("batch", Tensor::new(&[0u32, 2, 0, 1], &dev)?);
    assert!(model.forward(&batch, true).is_err());

    // wrong number of genes
    let batch = CellBatch::new(
        Tensor::zeros((4, N_GENES + 1), DType::F32, &dev)?,
        Tensor::zeros((4, N_DRUGS), DType::F32, &dev)?,
    )
    .with_covariate("batch", Tensor::new(&[0u32, 1, 0, 1], &dev)?);
    assert!(model.forward(&batch, true).is_err());

    // invalid configuration
    let mut bad = config(&[("batch", 2)], Likelihood::Gaussian)?;
    bad.n_latent = 0;
    assert!(build(bad, &VarMap::new()).is_err());
    Ok(())
}

#[test]
fn groups_follow_the_leading_prefix() -> Result<()> {
    assert!(CovariateVocab::from_pairs(&[(ADVERSARY_PREFIX, 2)]).is_err());
    assert!(CovariateVocab::from_pairs(&[(AUTOENCODER_PREFIX, 2)]).is_err());

    let dev = Device::Cpu;
    let vm = VarMap::new();
    let vs = VarBuilder::from_varmap(&vm, DType::F32, &dev);
    let model = CpaModule::new(config(&[("batch", 2)], Likelihood::Gaussian)?, vs.pp("cpa"))?;

    // a later `adversary` segment must not pull a variable over
    let inner = vs
        .pp("cpa")
        .pp(AUTOENCODER_PREFIX)
        .pp(ADVERSARY_PREFIX)
        .get_with_hints(3, "weight", candle_nn::Init::Const(0.))?;

    let groups = parameter_groups(&vm)?;
    fn in_group(group: &[candle_core::Var], t: &Tensor) -> bool {
        group.iter().any(|v| v.as_tensor().id() == t.id())
    }

    assert!(in_group(&groups.autoencoder, &inner));
    assert!(!in_group(&groups.adversary, &inner));

    let batch_table = model
        .covariate_embeddings("batch")
        .ok_or_else(|| candle_core::Error::Msg("no batch table".into()))?;
    assert!(in_group(&groups.autoencoder, batch_table));
    assert!(in_group(&groups.autoencoder, model.drug_embeddings()));
    assert!(!groups.adversary.is_empty());

    let data = vm
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    for (name, var) in data.iter() {
        if name.starts_with("cpa.adversary.") {
            assert!(in_group(&groups.adversary, var.as_tensor()), "{}", name);
        }
    }
    Ok(())
}
