use candle_core::Result;
use candle_util::candle_aux_layers::NormKind;
use clap::ValueEnum;
use std::collections::BTreeMap;

use crate::cpa_batch::{PERTURBATIONS_KEY, X_KEY};
use crate::cpa_module::{ADVERSARY_PREFIX, AUTOENCODER_PREFIX};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Likelihood {
    #[value(name = "gauss")]
    Gaussian,
    #[value(name = "nb")]
    NegativeBinomial,
}

/// Dose-response curve family; every curve maps dose 0 to 0
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoserType {
    /// s(d) = d
    Linear,
    /// s(d) = σ(β d + b) - σ(b)
    #[value(name = "sigm")]
    Sigmoid,
    /// s(d) = σ(β log(1 + d) + b) - σ(b)
    #[value(name = "logsigm")]
    LogSigmoid,
    /// s(d) = g(d) - g(0), g a monotone network per drug
    Mlp,
}

/// Covariate name -> number of distinct levels
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CovariateVocab {
    sizes: BTreeMap<Box<str>, usize>,
}

impl CovariateVocab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<S: AsRef<str>>(pairs: &[(S, usize)]) -> Result<Self> {
        let mut ret = Self::new();
        for (name, n_levels) in pairs {
            ret.insert(name.as_ref(), *n_levels)?;
        }
        Ok(ret)
    }

    pub fn insert(&mut self, name: &str, n_levels: usize) -> Result<()> {
        if [X_KEY, PERTURBATIONS_KEY, AUTOENCODER_PREFIX, ADVERSARY_PREFIX].contains(&name) {
            candle_core::bail!("covariate name `{}` is reserved", name);
        }
        if n_levels == 0 {
            candle_core::bail!("covariate `{}` needs at least one level", name);
        }
        if self.sizes.contains_key(name) {
            candle_core::bail!("duplicate covariate `{}`", name);
        }
        self.sizes.insert(name.into(), n_levels);
        Ok(())
    }

    pub fn n_levels(&self, name: &str) -> Option<usize> {
        self.sizes.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sizes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sizes.keys().map(|k| k.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.sizes.iter().map(|(k, &v)| (k.as_ref(), v))
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// Construction-time settings of a `CpaModule`
#[derive(Clone, Debug)]
pub struct CpaConfig {
    pub n_genes: usize,
    pub n_drugs: usize,
    pub covariates: CovariateVocab,
    pub n_latent: usize,
    pub likelihood: Likelihood,
    pub doser: DoserType,
    pub autoencoder_width: usize,
    pub autoencoder_depth: usize,
    pub adversary_width: usize,
    pub adversary_depth: usize,
    pub doser_width: usize,
    pub doser_depth: usize,
    pub norm: NormKind,
    pub dropout: f64,
    pub variational: bool,
}

impl CpaConfig {
    pub fn new(n_genes: usize, n_drugs: usize, covariates: CovariateVocab) -> Self {
        Self {
            n_genes,
            n_drugs,
            covariates,
            n_latent: 256,
            likelihood: Likelihood::Gaussian,
            doser: DoserType::Linear,
            autoencoder_width: 256,
            autoencoder_depth: 2,
            adversary_width: 128,
            adversary_depth: 3,
            doser_width: 64,
            doser_depth: 2,
            norm: NormKind::Batch,
            dropout: 0.,
            variational: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_genes == 0 || self.n_drugs == 0 || self.n_latent == 0 {
            candle_core::bail!(
                "need positive dimensions: genes {}, drugs {}, latent {}",
                self.n_genes,
                self.n_drugs,
                self.n_latent
            );
        }
        if self.doser == DoserType::Mlp && (self.doser_width == 0 || self.doser_depth == 0) {
            candle_core::bail!("the mlp doser needs positive width and depth");
        }
        if !(0. ..1.).contains(&self.dropout) {
            candle_core::bail!("dropout rate {} is not in [0, 1)", self.dropout);
        }
        Ok(())
    }
}
