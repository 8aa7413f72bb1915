use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use candle_util::candle_aux_layers::*;
use candle_util::candle_loss_functions::{bce_with_logits, cross_entropy};
use std::collections::BTreeMap;

use crate::cpa_config::CovariateVocab;

/// Logits of one classifier together with the trace needed to
/// differentiate them with respect to the basal latent state
#[derive(Clone, Debug)]
pub struct ClassifierOutput {
    pub logits: Tensor,
    trace: FcTrace,
}

/// Adversary predictions from the basal latent state
#[derive(Clone, Debug)]
pub struct AdversaryPredictions {
    pub drugs: ClassifierOutput,
    pub covariates: BTreeMap<Box<str>, ClassifierOutput>,
}

pub struct AdversaryArgs<'a> {
    pub n_latent: usize,
    pub n_drugs: usize,
    pub covariates: &'a CovariateVocab,
    pub n_hidden: usize,
    pub n_layers: usize,
    pub norm: NormKind,
    pub dropout: f64,
}

/// Drug-presence classifier plus one level classifier per covariate,
/// all reading the basal latent state
pub struct AdversarialClassifiers {
    drugs: FcLayers,
    covariates: BTreeMap<Box<str>, FcLayers>,
}

impl AdversarialClassifiers {
    /// Will create `drugs.*` and `covariates.{name}.*`
    pub fn new(args: AdversaryArgs, vs: VarBuilder) -> Result<Self> {
        let classifier = |n_out: usize, vs: VarBuilder| {
            FcLayers::new(
                FcLayersArgs {
                    n_in: args.n_latent,
                    n_out: Some(n_out),
                    n_hidden: args.n_hidden,
                    n_layers: args.n_layers,
                    norm: args.norm,
                    dropout: args.dropout,
                },
                vs,
            )
        };

        let drugs = classifier(args.n_drugs, vs.pp("drugs"))?;

        let mut covariates = BTreeMap::new();
        for (name, n_levels) in args.covariates.iter() {
            let fc = classifier(n_levels, vs.pp("covariates").pp(name))?;
            covariates.insert(name.into(), fc);
        }

        Ok(Self { drugs, covariates })
    }

    pub fn forward_t(&self, latent_basal_nk: &Tensor, train: bool) -> Result<AdversaryPredictions> {
        let (logits, trace) = self.drugs.forward_trace(latent_basal_nk, train)?;
        let drugs = ClassifierOutput { logits, trace };

        let mut covariates = BTreeMap::new();
        for (name, fc) in self.covariates.iter() {
            let (logits, trace) = fc.forward_trace(latent_basal_nk, train)?;
            covariates.insert(name.clone(), ClassifierOutput { logits, trace });
        }
        Ok(AdversaryPredictions { drugs, covariates })
    }

    /// Σ_c CE(covariate c) + BCE(drug presence), where a drug counts as
    /// present iff its dose is strictly positive
    ///
    /// * `doses_nd` - observed doses (n x drugs)
    /// * `levels` - observed covariate levels, one `(n,)` per covariate
    pub fn classification_loss(
        &self,
        preds: &AdversaryPredictions,
        doses_nd: &Tensor,
        levels: &BTreeMap<Box<str>, Tensor>,
    ) -> Result<Tensor> {
        let presence_nd = doses_nd.gt(0.0)?;
        let mut loss = bce_with_logits(&preds.drugs.logits, &presence_nd)?;

        for name in self.covariates.keys() {
            let pred = preds.covariates.get(name).ok_or_else(|| {
                candle_core::Error::Msg(format!("no prediction for covariate `{}`", name))
            })?;
            let labels_n = levels
                .get(name)
                .ok_or_else(|| candle_core::Error::Msg(format!("missing covariate `{}`", name)))?;
            loss = (loss + cross_entropy(&pred.logits, labels_n)?)?;
        }
        Ok(loss)
    }

    /// Σ over classifiers of mean( (∂ Σ logits / ∂ z_basal)^2 )
    ///
    /// The gradients are assembled from ordinary tensor ops, so the
    /// penalty is itself differentiable.
    pub fn gradient_penalty(
        &self,
        preds: &AdversaryPredictions,
        latent_basal_nk: &Tensor,
    ) -> Result<Tensor> {
        let grad_nk = self
            .drugs
            .sum_input_grad(&preds.drugs.trace, latent_basal_nk)?;
        let mut penalty = grad_nk.sqr()?.mean_all()?;

        for (name, fc) in self.covariates.iter() {
            let pred = preds.covariates.get(name).ok_or_else(|| {
                candle_core::Error::Msg(format!("no prediction for covariate `{}`", name))
            })?;
            let grad_nk = fc.sum_input_grad(&pred.trace, latent_basal_nk)?;
            penalty = (penalty + grad_nk.sqr()?.mean_all()?)?;
        }
        Ok(penalty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    fn adversary(
        vm: &VarMap,
        vocab: &CovariateVocab,
        norm: NormKind,
    ) -> Result<AdversarialClassifiers> {
        let vs = VarBuilder::from_varmap(vm, DType::F32, &Device::Cpu);
        AdversarialClassifiers::new(
            AdversaryArgs {
                n_latent: 4,
                n_drugs: 3,
                covariates: vocab,
                n_hidden: 8,
                n_layers: 2,
                norm,
                dropout: 0.,
            },
            vs,
        )
    }

    #[test]
    fn penalty_matches_autograd() -> Result<()> {
        let dev = Device::Cpu;
        let vocab = CovariateVocab::from_pairs(&[("batch", 2)])?;
        let vm = VarMap::new();
        let adv = adversary(&vm, &vocab, NormKind::Layer)?;

        let z = Var::from_tensor(&Tensor::randn(0f32, 1f32, (6, 4), &dev)?)?;
        let preds = adv.forward_t(z.as_tensor(), true)?;
        let penalty = adv.gradient_penalty(&preds, z.as_tensor())?.to_scalar::<f32>()?;

        // first-order autograd, one classifier at a time
        let mut expected = 0f32;
        let mut logits = vec![preds.drugs.logits.clone()];
        logits.extend(preds.covariates.values().map(|p| p.logits.clone()));
        for l in logits {
            let grads = l.sum_all()?.backward()?;
            let g = grads
                .get(z.as_tensor())
                .ok_or_else(|| candle_core::Error::Msg("no gradient".into()))?;
            expected += g.sqr()?.mean_all()?.to_scalar::<f32>()?;
        }
        assert!((penalty - expected).abs() < 1e-4 * (1. + expected.abs()));
        assert!(penalty >= 0.);
        Ok(())
    }

    #[test]
    fn presence_uses_strictly_positive_dose() -> Result<()> {
        let dev = Device::Cpu;
        let vocab = CovariateVocab::new();
        let vm = VarMap::new();
        let adv = adversary(&vm, &vocab, NormKind::None)?;
        let z = Tensor::randn(0f32, 1f32, (2, 4), &dev)?;
        let preds = adv.forward_t(&z, false)?;

        let doses = Tensor::new(&[[0f32, 1e-6, 0.], [2., 0., 0.]], &dev)?;
        let presence = Tensor::new(&[[0f32, 1., 0.], [1., 0., 0.]], &dev)?;
        let levels = BTreeMap::new();
        let loss = adv
            .classification_loss(&preds, &doses, &levels)?
            .to_scalar::<f32>()?;
        let expected = bce_with_logits(&preds.drugs.logits, &presence)?.to_scalar::<f32>()?;
        assert!((loss - expected).abs() < 1e-6);
        Ok(())
    }
}
