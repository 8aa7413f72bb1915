use crate::candle_loss_functions::{gaussian_kl_loss, negative_binomial_log_prob};
use candle_core::{Result, Tensor};

/// Diagonal Gaussian N(mean, var) over the last dimension
#[derive(Clone, Debug)]
pub struct DiagGaussian {
    mean: Tensor,
    var: Tensor,
}

impl DiagGaussian {
    pub fn new(mean: Tensor, var: Tensor) -> Self {
        Self { mean, var }
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn variance(&self) -> &Tensor {
        &self.var
    }

    pub fn scale(&self) -> Result<Tensor> {
        self.var.sqrt()
    }

    /// z = mu + sigma * eps, eps ~ N(0, 1)
    pub fn rsample(&self) -> Result<Tensor> {
        let eps = Tensor::randn_like(&self.mean, 0., 1.)?;
        &self.mean + (self.scale()? * eps)?
    }

    /// KL(q || N(0, I)) summed over the last dimension (n)
    pub fn kl_standard_normal(&self) -> Result<Tensor> {
        gaussian_kl_loss(&self.mean, &self.var.log()?)
    }
}

/// Negative Binomial with mean `mu` and inverse dispersion `theta`
///
/// Var(x) = mu + mu^2 / theta
#[derive(Clone, Debug)]
pub struct NegativeBinomial {
    mu: Tensor,
    theta: Tensor,
}

impl NegativeBinomial {
    pub fn new(mu: Tensor, theta: Tensor) -> Self {
        Self { mu, theta }
    }

    pub fn mean(&self) -> &Tensor {
        &self.mu
    }

    pub fn theta(&self) -> &Tensor {
        &self.theta
    }

    pub fn variance(&self) -> Result<Tensor> {
        let theta = self.theta.broadcast_as(self.mu.shape())?;
        &self.mu + self.mu.sqr()?.div(&theta)?
    }

    pub fn log_prob(&self, x_nd: &Tensor) -> Result<Tensor> {
        negative_binomial_log_prob(x_nd, &self.mu, &self.theta)
    }
}
