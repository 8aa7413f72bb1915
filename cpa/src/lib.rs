pub mod adversary;
pub mod covariate_embedding;
pub mod cpa_batch;
pub mod cpa_config;
pub mod cpa_module;
pub mod drug_network;
pub mod simulate;

pub use cpa_batch::{CellBatch, PERTURBATIONS_KEY, X_KEY};
pub use cpa_config::{CovariateVocab, CpaConfig, DoserType, Likelihood};
pub use cpa_module::{parameter_groups, Counterfactual, CpaModule, ParameterGroups};
