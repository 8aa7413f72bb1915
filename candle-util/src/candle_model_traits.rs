use crate::candle_distributions::DiagGaussian;
use candle_core::{Result, Tensor};

pub trait EncoderModuleT {
    /// An encoder that spits out the latent state and, if variational,
    /// the posterior it was drawn from
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `train` - whether to use dropout/batchnorm or not
    ///
    /// # Returns `(z_nk, q_z)`
    /// * `z_nk` - latent inference (n x k)
    /// * `q_z` - posterior N(mean, var) for variational encoders
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, Option<DiagGaussian>)>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

/// Parameters of an observation model that can score data
pub trait ReconstructionT {
    /// negative log-likelihood averaged over all entries (up to constants)
    fn negative_log_likelihood(&self, x_nd: &Tensor) -> Result<Tensor>;
}

pub trait DecoderModuleT {
    type Recon: ReconstructionT;

    /// A decoder that spits out observation model parameters
    /// * `z_nk` - latent states
    /// * `log_library_n1` - log library size, used by count models
    /// * `train` - whether to use dropout/batchnorm or not
    fn forward_t(
        &self,
        z_nk: &Tensor,
        log_library_n1: Option<&Tensor>,
        train: bool,
    ) -> Result<Self::Recon>;

    /// decode and evaluate the reconstruction loss against `x_nd`
    fn forward_with_nll(
        &self,
        z_nk: &Tensor,
        log_library_n1: Option<&Tensor>,
        x_nd: &Tensor,
        train: bool,
    ) -> Result<(Self::Recon, Tensor)> {
        let recon = self.forward_t(z_nk, log_library_n1, train)?;
        let nll = recon.negative_log_likelihood(x_nd)?;
        Ok((recon, nll))
    }

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}
