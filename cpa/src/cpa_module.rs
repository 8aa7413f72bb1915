use crate::adversary::*;
use crate::covariate_embedding::CovariateEmbeddingBank;
use crate::cpa_batch::*;
use crate::cpa_config::*;
use crate::drug_network::DrugNetwork;

use candle_core::{Device, Result, Tensor, Var};
use candle_nn::{ModuleT, VarBuilder, VarMap};
use candle_util::candle_aux_layers::*;
use candle_util::candle_decoder_expression::*;
use candle_util::candle_distributions::{DiagGaussian, NegativeBinomial};
use candle_util::candle_model_encoder::*;
use candle_util::candle_model_traits::*;
use log::info;
use std::collections::BTreeMap;

/// Variables of the encoder, decoder, drug network and covariate
/// embeddings live under this prefix
pub const AUTOENCODER_PREFIX: &str = "autoencoder";
/// Variables of the adversarial classifiers live under this prefix
pub const ADVERSARY_PREFIX: &str = "adversary";

/// Output of `CpaModule::inference`
#[derive(Clone, Debug)]
pub struct InferenceOutput {
    /// basal + covariates + drugs (n x k)
    pub latent: Tensor,
    /// encoder output before any perturbation (n x k)
    pub latent_basal: Tensor,
    /// q(z_basal | x) in variational mode
    pub dist_qz: Option<DiagGaussian>,
    /// log library size (n x 1) for count likelihood
    pub library: Option<Tensor>,
    /// covariate levels as used for the embeddings (u32)
    pub covariates: BTreeMap<Box<str>, Tensor>,
}

/// Decoded observation model
#[derive(Clone, Debug)]
pub enum Reconstruction {
    Gaussian(GaussianRecon),
    NegativeBinomial(NegativeBinomial),
}

impl Reconstruction {
    pub fn negative_log_likelihood(&self, x_nd: &Tensor) -> Result<Tensor> {
        match self {
            Reconstruction::Gaussian(recon) => recon.negative_log_likelihood(x_nd),
            Reconstruction::NegativeBinomial(dist_px) => dist_px.negative_log_likelihood(x_nd),
        }
    }

    /// expected expression (n x genes) under either likelihood
    pub fn mean(&self) -> &Tensor {
        match self {
            Reconstruction::Gaussian(recon) => &recon.mean_nd,
            Reconstruction::NegativeBinomial(dist_px) => dist_px.mean(),
        }
    }
}

/// Output of `CpaModule::generative`
#[derive(Clone, Debug)]
pub struct GenerativeOutput {
    pub reconstruction: Reconstruction,
    pub adversary: AdversaryPredictions,
}

impl GenerativeOutput {
    pub fn drugs_pred(&self) -> &Tensor {
        &self.adversary.drugs.logits
    }

    pub fn covars_pred(&self, name: &str) -> Option<&Tensor> {
        self.adversary.covariates.get(name).map(|c| &c.logits)
    }
}

/// Counterfactual query: replace the doses and/or some covariate levels
/// while the basal state inferred from the observed cells stays fixed
#[derive(Clone, Debug, Default)]
pub struct Counterfactual {
    pub doses_nd: Option<Tensor>,
    pub covariates: BTreeMap<Box<str>, Tensor>,
}

enum FeatureEncoder {
    Deterministic(DeterministicEncoder),
    Variational(GaussianEncoder),
}

impl FeatureEncoder {
    fn as_encoder(&self) -> &dyn EncoderModuleT {
        match self {
            FeatureEncoder::Deterministic(enc) => enc,
            FeatureEncoder::Variational(enc) => enc,
        }
    }
}

enum ExpressionDecoder {
    Gaussian(GaussianDecoder),
    NegativeBinomial(NegBinomDecoder),
}

/// Compositional perturbation autoencoder
///
/// latent = basal(x) + Σ_c embedding_c(level_c) + drugs(doses)
///
/// The adversaries see only the basal state. The caller alternates
/// between minimizing `loss - λ adversarial_loss` over the autoencoder
/// group and `adversarial_loss + μ penalty` over the adversary group.
pub struct CpaModule {
    config: CpaConfig,
    device: Device,
    encoder: FeatureEncoder,
    library_encoder: Option<FcLayers>,
    decoder: ExpressionDecoder,
    px_r_d: Tensor,
    drug_network: DrugNetwork,
    covariate_embeddings: CovariateEmbeddingBank,
    adversary: AdversarialClassifiers,
}

impl CpaModule {
    /// Will create the variables under `autoencoder.*` (encoder,
    /// library encoder, decoder, px_r, drug network, covariate
    /// embeddings) and `adversary.*` (classifiers)
    pub fn new(config: CpaConfig, vs: VarBuilder) -> Result<Self> {
        config.validate()?;

        let device = vs.device().clone();
        let vs_ae = vs.pp(AUTOENCODER_PREFIX);

        let encoder_args = || EncoderArgs {
            n_features: config.n_genes,
            n_latent: config.n_latent,
            n_hidden: config.autoencoder_width,
            n_layers: config.autoencoder_depth,
            norm: config.norm,
            dropout: config.dropout,
        };

        let encoder = if config.variational {
            FeatureEncoder::Variational(GaussianEncoder::new(encoder_args(), vs_ae.pp("encoder"))?)
        } else {
            FeatureEncoder::Deterministic(DeterministicEncoder::new(
                encoder_args(),
                vs_ae.pp("encoder"),
            )?)
        };

        let px_r_d = vs_ae.get_with_hints(
            config.n_genes,
            "px_r",
            candle_nn::Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        )?;

        let decoder_args = DecoderArgs {
            n_features: config.n_genes,
            n_latent: config.n_latent,
            n_hidden: config.autoencoder_width,
            n_layers: config.autoencoder_depth,
            norm: config.norm,
            dropout: config.dropout,
        };

        let (decoder, library_encoder) = match config.likelihood {
            Likelihood::Gaussian => (
                ExpressionDecoder::Gaussian(GaussianDecoder::new(
                    decoder_args,
                    vs_ae.pp("decoder"),
                )?),
                None,
            ),
            Likelihood::NegativeBinomial => {
                let library_encoder = FcLayers::new(
                    FcLayersArgs {
                        n_in: config.n_genes,
                        n_out: Some(1),
                        n_hidden: config.autoencoder_width,
                        n_layers: config.autoencoder_depth,
                        norm: config.norm,
                        dropout: config.dropout,
                    },
                    vs_ae.pp("library"),
                )?;
                let decoder =
                    NegBinomDecoder::new(decoder_args, px_r_d.clone(), vs_ae.pp("decoder"))?;
                (ExpressionDecoder::NegativeBinomial(decoder), Some(library_encoder))
            }
        };

        let drug_network = DrugNetwork::new(
            config.n_drugs,
            config.n_latent,
            config.doser,
            config.doser_width,
            config.doser_depth,
            vs_ae.pp("drugs"),
        )?;

        let covariate_embeddings = CovariateEmbeddingBank::new(
            &config.covariates,
            config.n_latent,
            vs_ae.pp("covariates"),
        )?;

        let adversary = AdversarialClassifiers::new(
            AdversaryArgs {
                n_latent: config.n_latent,
                n_drugs: config.n_drugs,
                covariates: &config.covariates,
                n_hidden: config.adversary_width,
                n_layers: config.adversary_depth,
                norm: config.norm,
                dropout: config.dropout,
            },
            vs.pp(ADVERSARY_PREFIX),
        )?;

        info!(
            "CPA: {} genes, {} drugs, {} covariates, {} latent, {:?} likelihood, {:?} doser{}",
            config.n_genes,
            config.n_drugs,
            config.covariates.len(),
            config.n_latent,
            config.likelihood,
            config.doser,
            if config.variational { ", variational" } else { "" }
        );

        Ok(Self {
            config,
            device,
            encoder,
            library_encoder,
            decoder,
            px_r_d,
            drug_network,
            covariate_embeddings,
            adversary,
        })
    }

    pub fn config(&self) -> &CpaConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Gather and check `inference` arguments from a batch, moving them
    /// to this module's device
    pub fn inference_input(&self, batch: &CellBatch) -> Result<InferenceInput> {
        if let Some((unknown, _)) = batch
            .covariates()
            .find(|(name, _)| !self.config.covariates.contains(name))
        {
            candle_core::bail!("covariate `{}` is not in the vocabulary", unknown);
        }

        let n = batch.num_cells()?;
        let genes_nd = prepare_matrix(batch.genes()?, n, self.config.n_genes, &self.device, X_KEY)?;
        let doses_nd = prepare_matrix(
            batch.doses()?,
            n,
            self.config.n_drugs,
            &self.device,
            PERTURBATIONS_KEY,
        )?;
        let mut covariates = BTreeMap::new();
        for (name, n_levels) in self.config.covariates.iter() {
            let levels_n = prepare_levels(batch.get(name)?, n, n_levels, &self.device, name)?;
            covariates.insert(name.into(), levels_n);
        }
        Ok(InferenceInput {
            genes_nd,
            doses_nd,
            covariates,
        })
    }

    /// Gather `generative` arguments from the inference results
    pub fn generative_input(&self, inference: &InferenceOutput) -> GenerativeInput {
        GenerativeInput {
            latent_nk: inference.latent.clone(),
            latent_basal_nk: inference.latent_basal.clone(),
            log_library_n1: inference.library.clone(),
        }
    }

    /// basal + Σ covariate embeddings + drug embedding
    ///
    /// * `latent_basal_nk` - basal state (n x k)
    /// * `doses_nd` - doses (n x drugs)
    /// * `covariates` - u32 levels for every covariate in the vocabulary
    pub fn compose_latent(
        &self,
        latent_basal_nk: &Tensor,
        doses_nd: &Tensor,
        covariates: &BTreeMap<Box<str>, Tensor>,
    ) -> Result<Tensor> {
        let (n, k) = latent_basal_nk.dims2()?;
        check_dims(latent_basal_nk, &[n, self.config.n_latent], "basal latent")?;
        let latent_covariates_nk = self.covariate_embeddings.forward(covariates, n)?;
        let latent_drugs_nk = self.drug_network.forward(doses_nd)?;
        check_dims(&latent_drugs_nk, &[n, k], "drug embedding")?;
        (latent_basal_nk + latent_covariates_nk)? + latent_drugs_nk
    }

    pub fn inference(&self, input: &InferenceInput, train: bool) -> Result<InferenceOutput> {
        let n = input.genes_nd.dim(0)?;
        let genes_nd = to_device_dtype(&input.genes_nd, &self.device, candle_core::DType::F32)?;
        check_dims(&genes_nd, &[n, self.config.n_genes], X_KEY)?;
        let doses_nd = to_device_dtype(&input.doses_nd, &self.device, candle_core::DType::F32)?;
        check_dims(&doses_nd, &[n, self.config.n_drugs], PERTURBATIONS_KEY)?;

        let mut covariates = BTreeMap::new();
        for (name, levels_n) in input.covariates.iter() {
            let levels_n = match self.config.covariates.n_levels(name) {
                Some(n_levels) => prepare_levels(levels_n, n, n_levels, &self.device, name)?,
                None => candle_core::bail!("covariate `{}` is not in the vocabulary", name),
            };
            covariates.insert(name.clone(), levels_n);
        }

        let (latent_basal, dist_qz) = self.encoder.as_encoder().forward_t(&genes_nd, train)?;

        let library = match &self.library_encoder {
            Some(l_enc) => Some(l_enc.forward_t(&genes_nd, train)?),
            None => None,
        };

        let latent = self.compose_latent(&latent_basal, &doses_nd, &covariates)?;

        Ok(InferenceOutput {
            latent,
            latent_basal,
            dist_qz,
            library,
            covariates,
        })
    }

    pub fn generative(&self, input: &GenerativeInput, train: bool) -> Result<GenerativeOutput> {
        let adversary = self.adversary.forward_t(&input.latent_basal_nk, train)?;

        let reconstruction = match &self.decoder {
            ExpressionDecoder::Gaussian(dec) => {
                Reconstruction::Gaussian(dec.forward_t(&input.latent_nk, None, train)?)
            }
            ExpressionDecoder::NegativeBinomial(dec) => {
                let log_library_n1 = input.log_library_n1.as_ref().ok_or_else(|| {
                    candle_core::Error::Msg("count likelihood needs a library size".into())
                })?;
                Reconstruction::NegativeBinomial(dec.forward_t(
                    &input.latent_nk,
                    Some(log_library_n1),
                    train,
                )?)
            }
        };

        Ok(GenerativeOutput {
            reconstruction,
            adversary,
        })
    }

    /// inference followed by generative on the same batch
    pub fn forward(
        &self,
        batch: &CellBatch,
        train: bool,
    ) -> Result<(InferenceOutput, GenerativeOutput)> {
        let inference = self.inference(&self.inference_input(batch)?, train)?;
        let generative = self.generative(&self.generative_input(&inference), train)?;
        Ok((inference, generative))
    }

    /// Reconstruction loss: mean negative log-likelihood over all
    /// cells and genes
    pub fn loss(
        &self,
        batch: &CellBatch,
        _inference: &InferenceOutput,
        generative: &GenerativeOutput,
    ) -> Result<Tensor> {
        let n = batch.num_cells()?;
        let x_nd = prepare_matrix(batch.genes()?, n, self.config.n_genes, &self.device, X_KEY)?;
        generative.reconstruction.negative_log_likelihood(&x_nd)
    }

    /// Returns `(adversarial_loss, adversarial_penalty)`
    ///
    /// The loss sums the covariate cross entropies and the drug
    /// presence binary cross entropy; the penalty sums the mean squared
    /// gradients of each classifier's summed logits with respect to the
    /// basal latent state.
    pub fn adversarial_loss(
        &self,
        batch: &CellBatch,
        inference: &InferenceOutput,
        generative: &GenerativeOutput,
    ) -> Result<(Tensor, Tensor)> {
        let n = batch.num_cells()?;
        let doses_nd = prepare_matrix(
            batch.doses()?,
            n,
            self.config.n_drugs,
            &self.device,
            PERTURBATIONS_KEY,
        )?;

        let adv_loss = self.adversary.classification_loss(
            &generative.adversary,
            &doses_nd,
            &inference.covariates,
        )?;
        let adv_penalty = self
            .adversary
            .gradient_penalty(&generative.adversary, &inference.latent_basal)?;
        Ok((adv_loss, adv_penalty))
    }

    /// Mean over cells of KL(q(z_basal|x) || N(0, I)); `None` for the
    /// deterministic encoder. Not part of `loss`.
    pub fn kl_divergence(&self, inference: &InferenceOutput) -> Result<Option<Tensor>> {
        match &inference.dist_qz {
            Some(q_z) => Ok(Some(q_z.kl_standard_normal()?.mean_all()?)),
            None => Ok(None),
        }
    }

    /// Decoded `(means, variances)`, each (n x genes); Gaussian only
    pub fn get_expression(&self, batch: &CellBatch) -> Result<(Tensor, Tensor)> {
        if self.config.likelihood != Likelihood::Gaussian {
            candle_core::bail!(
                "expression moments are only available with the gaussian likelihood, not {:?}",
                self.config.likelihood
            );
        }
        let (_, generative) = self.forward(batch, false)?;
        match generative.reconstruction {
            Reconstruction::Gaussian(recon) => Ok((recon.mean_nd, recon.var_nd)),
            Reconstruction::NegativeBinomial(_) => candle_core::bail!(
                "expression moments are only available with the gaussian likelihood"
            ),
        }
    }

    /// Decode the observed cells under substituted doses and/or
    /// covariate levels, keeping their basal states
    pub fn predict_counterfactual(
        &self,
        batch: &CellBatch,
        counterfactual: &Counterfactual,
    ) -> Result<Reconstruction> {
        let input = self.inference_input(batch)?;
        let observed = self.inference(&input, false)?;
        let n = input.genes_nd.dim(0)?;

        let doses_nd = match &counterfactual.doses_nd {
            Some(doses_nd) => prepare_matrix(
                doses_nd,
                n,
                self.config.n_drugs,
                &self.device,
                PERTURBATIONS_KEY,
            )?,
            None => input.doses_nd.clone(),
        };

        let mut covariates = observed.covariates.clone();
        for (name, levels_n) in counterfactual.covariates.iter() {
            let n_levels = self.config.covariates.n_levels(name).ok_or_else(|| {
                candle_core::Error::Msg(format!("covariate `{}` is not in the vocabulary", name))
            })?;
            let levels_n = prepare_levels(levels_n, n, n_levels, &self.device, name)?;
            covariates.insert(name.clone(), levels_n);
        }

        let latent = self.compose_latent(&observed.latent_basal, &doses_nd, &covariates)?;
        let generative = self.generative(
            &GenerativeInput {
                latent_nk: latent,
                latent_basal_nk: observed.latent_basal,
                log_library_n1: observed.library,
            },
            false,
        )?;
        Ok(generative.reconstruction)
    }

    /// latent direction of each drug (n_drugs x n_latent)
    pub fn drug_embeddings(&self) -> &Tensor {
        self.drug_network.drug_embeddings()
    }

    /// dose response s(dose) per cell and drug
    pub fn dose_response(&self, doses_nd: &Tensor) -> Result<Tensor> {
        let doses_nd = to_device_dtype(doses_nd, &self.device, candle_core::DType::F32)?;
        self.drug_network.dose_response(&doses_nd)
    }

    /// embedding table (levels x n_latent) of a covariate
    pub fn covariate_embeddings(&self, name: &str) -> Option<&Tensor> {
        self.covariate_embeddings.table(name)
    }

    /// learned per-gene log inverse dispersion (n_genes)
    pub fn dispersion(&self) -> &Tensor {
        &self.px_r_d
    }
}

/// Trainable variables split for the two alternating optimizers
pub struct ParameterGroups {
    pub autoencoder: Vec<Var>,
    pub adversary: Vec<Var>,
}

/// Split the variables of `vm` by the first name segment that is
/// either `autoencoder` or `adversary`; variables with neither go to
/// the autoencoder group
pub fn parameter_groups(vm: &VarMap) -> Result<ParameterGroups> {
    let data = vm
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("variable map lock: {}", e)))?;

    let mut groups = ParameterGroups {
        autoencoder: vec![],
        adversary: vec![],
    };

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    for name in names {
        let var = data[name].clone();
        let group = name
            .split('.')
            .find(|&s| s == AUTOENCODER_PREFIX || s == ADVERSARY_PREFIX);
        if group == Some(ADVERSARY_PREFIX) {
            groups.adversary.push(var);
        } else {
            groups.autoencoder.push(var);
        }
    }
    Ok(groups)
}
