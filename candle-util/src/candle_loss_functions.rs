use candle_core::{Result, Tensor};

/// KL divergence loss between N(mu, sigma^2) and N(0, 1)
///
/// -0.5 * (1 + log(sigma^2) - mu^2 - sigma^2)
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
///
/// Returns the KL summed over the last dimension
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.powf(2.)? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// Negative Gaussian log-likelihood up to the constant, averaged over
/// all entries
///
/// nll(i,g) = 0.5 * log var(i,g) + (x(i,g) - mean(i,g))^2 / (2 var(i,g))
///
/// * `x_nd` - observed data
/// * `mean_nd` - reconstructed mean
/// * `var_nd` - reconstructed variance
/// * `var_floor` - variance is clamped from below before log and division
pub fn gaussian_nll(
    x_nd: &Tensor,
    mean_nd: &Tensor,
    var_nd: &Tensor,
    var_floor: f64,
) -> Result<Tensor> {
    let var_nd = var_nd.clamp(var_floor, f64::INFINITY)?;
    let term1 = (var_nd.log()? * 0.5)?;
    let term2 = x_nd.sub(mean_nd)?.sqr()?.div(&(&var_nd * 2.)?)?;
    (term1 + term2)?.mean_all()
}

/// log(1 + exp(x)) without overflow
///
/// softplus(x) = max(x, 0) + log(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()? + tail
}

/// Binary cross entropy on logits, averaged over all entries
///
/// bce(i,j) = max(x, 0) - x * y + log(1 + exp(-|x|))
///
/// * `logits_nk` - unnormalized scores
/// * `target_nk` - 0/1 targets of the same shape
pub fn bce_with_logits(logits_nk: &Tensor, target_nk: &Tensor) -> Result<Tensor> {
    let target_nk = target_nk.to_dtype(logits_nk.dtype())?;
    let tail = (logits_nk.abs()?.neg()?.exp()? + 1.)?.log()?;
    logits_nk
        .relu()?
        .sub(&logits_nk.mul(&target_nk)?)?
        .add(&tail)?
        .mean_all()
}

/// Categorical cross entropy on logits, averaged over samples
///
/// * `logits_nk` - unnormalized class scores
/// * `labels_n` - class index per sample (any integer-valued dtype)
pub fn cross_entropy(logits_nk: &Tensor, labels_n: &Tensor) -> Result<Tensor> {
    let labels_n = labels_n
        .flatten_all()?
        .to_dtype(candle_core::DType::U32)?;
    candle_nn::loss::cross_entropy(logits_nk, &labels_n)
}

/// Fast lgamma approximation for tensors (Paul Mineiro's fastlgamma).
///
/// ```text
/// lgamma(x) ≈ -2.081061466 - x + 0.0833333/(x+3) - log(x*(1+x)*(2+x)) + (2.5+x)*log(x+3)
/// ```
pub fn lgamma_approx(x: &Tensor) -> Result<Tensor> {
    let x_safe = x.clamp(1e-6f32, f32::MAX)?;

    let x_plus_1 = (&x_safe + 1.0)?;
    let x_plus_2 = (&x_safe + 2.0)?;
    let logterm = ((&x_safe * &x_plus_1)? * &x_plus_2)?.log()?;

    let xp3 = (&x_safe + 3.0)?;
    let recip_term = (xp3.recip()? * 0.0833333)?;
    let mult_term = ((&x_safe + 2.5)? * xp3.log()?)?;

    (((recip_term - 2.081061466)? - &x_safe)? - &logterm)? + &mult_term
}

/// Negative Binomial log-likelihood, elementwise
///
/// ```text
/// log P(x | μ, θ) = lgamma(x + θ) - lgamma(θ) - lgamma(x + 1)
///                 + θ log(θ / (θ + μ)) + x log(μ / (θ + μ))
/// ```
///
/// * `x_nd` - observed counts
/// * `mu_nd` - mean
/// * `theta` - inverse dispersion, `n x d` or broadcastable `d`
pub fn negative_binomial_log_prob(x_nd: &Tensor, mu_nd: &Tensor, theta: &Tensor) -> Result<Tensor> {
    let eps = 1e-8;
    let theta_nd = theta.broadcast_as(mu_nd.shape())?;
    let log_theta_mu = ((&theta_nd + mu_nd)? + eps)?.log()?;

    let res = theta_nd
        .mul(&((&theta_nd + eps)?.log()? - &log_theta_mu)?)?
        .add(&x_nd.mul(&((mu_nd + eps)?.log()? - &log_theta_mu)?)?)?;

    let lgammas = ((lgamma_approx(&(x_nd + &theta_nd)?)? - lgamma_approx(&theta_nd)?)?
        - lgamma_approx(&(x_nd + 1.)?)?)?;

    res + lgammas
}
