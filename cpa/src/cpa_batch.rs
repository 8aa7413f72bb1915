use candle_core::{DType, Device, Result, Tensor};
use log::debug;
use std::collections::{BTreeMap, HashMap};

/// gene expression matrix (cells x genes)
pub const X_KEY: &str = "X";
/// dose matrix (cells x drugs), zero for absent drugs
pub const PERTURBATIONS_KEY: &str = "drugs_doses";

/// A minibatch of cells as named tensors: `X`, `drugs_doses` and one
/// level vector per covariate keyed by the covariate name
#[derive(Clone, Debug, Default)]
pub struct CellBatch {
    tensors: HashMap<Box<str>, Tensor>,
}

impl CellBatch {
    pub fn new(genes_nd: Tensor, doses_nd: Tensor) -> Self {
        let mut tensors = HashMap::new();
        tensors.insert(X_KEY.into(), genes_nd);
        tensors.insert(PERTURBATIONS_KEY.into(), doses_nd);
        Self { tensors }
    }

    pub fn with_covariate(mut self, name: &str, levels_n: Tensor) -> Self {
        self.insert(name, levels_n);
        self
    }

    pub fn insert(&mut self, name: &str, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| candle_core::Error::Msg(format!("batch has no tensor `{}`", name)))
    }

    pub fn genes(&self) -> Result<&Tensor> {
        self.get(X_KEY)
    }

    pub fn doses(&self) -> Result<&Tensor> {
        self.get(PERTURBATIONS_KEY)
    }

    /// every tensor that is neither expression nor doses
    pub fn covariates(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors
            .iter()
            .filter(|(k, _)| k.as_ref() != X_KEY && k.as_ref() != PERTURBATIONS_KEY)
            .map(|(k, v)| (k.as_ref(), v))
    }

    pub fn num_cells(&self) -> Result<usize> {
        self.genes()?.dim(0)
    }
}

/// Arguments of `CpaModule::inference`
#[derive(Clone, Debug)]
pub struct InferenceInput {
    pub genes_nd: Tensor,
    pub doses_nd: Tensor,
    pub covariates: BTreeMap<Box<str>, Tensor>,
}

/// Arguments of `CpaModule::generative`
#[derive(Clone, Debug)]
pub struct GenerativeInput {
    pub latent_nk: Tensor,
    pub latent_basal_nk: Tensor,
    pub log_library_n1: Option<Tensor>,
}

/// Move to `device` unless already there, then cast to `dtype`
pub fn to_device_dtype(x: &Tensor, device: &Device, dtype: DType) -> Result<Tensor> {
    let x = if x.device().same_device(device) {
        x.clone()
    } else {
        debug!("moving {:?} tensor to {:?}", x.dims(), device);
        x.to_device(device)?
    };
    if x.dtype() == dtype {
        Ok(x)
    } else {
        x.to_dtype(dtype)
    }
}

pub(crate) fn check_dims(x: &Tensor, expected: &[usize], what: &str) -> Result<()> {
    if x.dims() != expected {
        candle_core::bail!("{} has shape {:?}, expected {:?}", what, x.dims(), expected);
    }
    Ok(())
}

/// Non-negative real matrix of shape `nrow x ncol` in f32 on `device`
pub(crate) fn prepare_matrix(
    x: &Tensor,
    nrow: usize,
    ncol: usize,
    device: &Device,
    what: &str,
) -> Result<Tensor> {
    let x = to_device_dtype(x, device, DType::F32)?;
    check_dims(&x, &[nrow, ncol], what)?;
    if nrow > 0 && x.min_all()?.to_scalar::<f32>()? < 0. {
        candle_core::bail!("{} must be non-negative", what);
    }
    Ok(x)
}

/// Integer levels in `[0, n_levels)` as a flat u32 vector on `device`;
/// accepts `(n,)` or `(n, 1)` of any numeric dtype
pub(crate) fn prepare_levels(
    levels: &Tensor,
    n_cells: usize,
    n_levels: usize,
    device: &Device,
    what: &str,
) -> Result<Tensor> {
    let levels = to_device_dtype(levels, device, DType::F32)?.flatten_all()?;
    check_dims(&levels, &[n_cells], what)?;
    if n_cells > 0 {
        let lo = levels.min_all()?.to_scalar::<f32>()?;
        let hi = levels.max_all()?.to_scalar::<f32>()?;
        if lo < 0. || hi >= n_levels as f32 {
            candle_core::bail!(
                "{} levels span [{}, {}], outside of [0, {})",
                what,
                lo,
                hi,
                n_levels
            );
        }
    }
    levels.to_dtype(DType::U32)
}
