use crate::cpa_config::CovariateVocab;
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};
use std::collections::BTreeMap;

/// One embedding table (levels x n_latent) per covariate
pub struct CovariateEmbeddingBank {
    n_latent: usize,
    vocab: CovariateVocab,
    tables: BTreeMap<Box<str>, Embedding>,
    dtype: DType,
    device: Device,
}

impl CovariateEmbeddingBank {
    /// Will create `{name}.weight` for each covariate in the vocabulary
    pub fn new(vocab: &CovariateVocab, n_latent: usize, vs: VarBuilder) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for (name, n_levels) in vocab.iter() {
            let emb = candle_nn::embedding(n_levels, n_latent, vs.pp(name))?;
            tables.insert(name.into(), emb);
        }
        Ok(Self {
            n_latent,
            vocab: vocab.clone(),
            tables,
            dtype: vs.dtype(),
            device: vs.device().clone(),
        })
    }

    /// Look up `levels_n` (u32) in the table of `name` (n x k)
    pub fn embed(&self, name: &str, levels_n: &Tensor) -> Result<Tensor> {
        let table = self
            .tables
            .get(name)
            .ok_or_else(|| candle_core::Error::Msg(format!("unknown covariate `{}`", name)))?;
        table.forward(levels_n)
    }

    /// Sum of all covariate embeddings (n x k); zeros without covariates
    ///
    /// Every supplied name must be in the vocabulary and every name in
    /// the vocabulary must be supplied.
    pub fn forward(
        &self,
        covariates: &BTreeMap<Box<str>, Tensor>,
        n_cells: usize,
    ) -> Result<Tensor> {
        if let Some(unknown) = covariates.keys().find(|k| !self.vocab.contains(k)) {
            candle_core::bail!("covariate `{}` is not in the vocabulary", unknown);
        }

        let mut sum_nk = Tensor::zeros((n_cells, self.n_latent), self.dtype, &self.device)?;
        for name in self.vocab.names() {
            let levels_n = covariates
                .get(name)
                .ok_or_else(|| candle_core::Error::Msg(format!("missing covariate `{}`", name)))?;
            sum_nk = (sum_nk + self.embed(name, levels_n)?)?;
        }
        Ok(sum_nk)
    }

    /// embedding table of `name` (levels x k)
    pub fn table(&self, name: &str) -> Option<&Tensor> {
        self.tables.get(name).map(|emb| emb.embeddings())
    }

    pub fn vocab(&self) -> &CovariateVocab {
        &self.vocab
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn bank(vm: &VarMap) -> Result<CovariateEmbeddingBank> {
        let vocab = CovariateVocab::from_pairs(&[("batch", 2), ("cell_type", 5)])?;
        let vs = VarBuilder::from_varmap(vm, DType::F32, &Device::Cpu);
        CovariateEmbeddingBank::new(&vocab, 6, vs)
    }

    #[test]
    fn tables_have_one_row_per_level() -> Result<()> {
        let vm = VarMap::new();
        let bank = bank(&vm)?;
        assert_eq!(bank.table("batch").map(|t| t.dims().to_vec()), Some(vec![2, 6]));
        assert_eq!(bank.table("cell_type").map(|t| t.dims().to_vec()), Some(vec![5, 6]));
        assert!(bank.table("donor").is_none());
        Ok(())
    }

    #[test]
    fn lookup_is_deterministic() -> Result<()> {
        let vm = VarMap::new();
        let bank = bank(&vm)?;
        let levels = Tensor::new(&[4u32, 4, 0], &Device::Cpu)?;
        let a = bank.embed("cell_type", &levels)?.to_vec2::<f32>()?;
        let b = bank.embed("cell_type", &levels)?.to_vec2::<f32>()?;
        assert_eq!(a, b);
        assert_eq!(a[0], a[1]);
        assert_ne!(a[0], a[2]);
        Ok(())
    }

    #[test]
    fn covariate_names_must_match_vocabulary() -> Result<()> {
        let vm = VarMap::new();
        let bank = bank(&vm)?;
        let dev = Device::Cpu;
        let mut covs: BTreeMap<Box<str>, Tensor> = BTreeMap::new();
        covs.insert("batch".into(), Tensor::new(&[0u32, 1], &dev)?);
        assert!(bank.forward(&covs, 2).is_err());

        covs.insert("cell_type".into(), Tensor::new(&[3u32, 1], &dev)?);
        assert_eq!(bank.forward(&covs, 2)?.dims(), &[2, 6]);

        covs.insert("donor".into(), Tensor::new(&[0u32, 0], &dev)?);
        assert!(bank.forward(&covs, 2).is_err());
        Ok(())
    }
}
