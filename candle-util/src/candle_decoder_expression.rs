use crate::candle_aux_layers::*;
use crate::candle_distributions::NegativeBinomial;
use crate::candle_loss_functions::{gaussian_nll, softplus};
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{ops, Linear, ModuleT, VarBuilder};

/// Variance is clamped to this floor before log/division in the loss
pub const GAUSSIAN_VAR_FLOOR: f64 = 1e-6;

pub struct DecoderArgs {
    pub n_features: usize,
    pub n_latent: usize,
    pub n_hidden: usize,
    pub n_layers: usize,
    pub norm: NormKind,
    pub dropout: f64,
}

impl DecoderArgs {
    fn fc_args(&self) -> FcLayersArgs {
        FcLayersArgs {
            n_in: self.n_latent,
            n_out: None,
            n_hidden: self.n_hidden,
            n_layers: self.n_layers,
            norm: self.norm,
            dropout: self.dropout,
        }
    }
}

//////////////////////
// Gaussian decoder //
//////////////////////

/// Per-gene Gaussian moments
#[derive(Clone, Debug)]
pub struct GaussianRecon {
    pub mean_nd: Tensor,
    pub var_nd: Tensor,
}

impl ReconstructionT for GaussianRecon {
    fn negative_log_likelihood(&self, x_nd: &Tensor) -> Result<Tensor> {
        gaussian_nll(x_nd, &self.mean_nd, &self.var_nd, GAUSSIAN_VAR_FLOOR)
    }
}

/// z -> fc -> (mean, softplus(.) + 1e-3)
pub struct GaussianDecoder {
    n_features: usize,
    n_latent: usize,
    fc: FcLayers,
    x_mean: Linear,
    x_var: Linear,
}

impl GaussianDecoder {
    /// Will create `fc.{j}.*`, `x.mean.*` and `x.var.*`
    pub fn new(args: DecoderArgs, vs: VarBuilder) -> Result<Self> {
        let fc = FcLayers::new(args.fc_args(), vs.clone())?;
        let prev_dim = fc.dim_out();
        let x_mean = candle_nn::linear(prev_dim, args.n_features, vs.pp("x.mean"))?;
        let x_var = candle_nn::linear(prev_dim, args.n_features, vs.pp("x.var"))?;
        Ok(Self {
            n_features: args.n_features,
            n_latent: args.n_latent,
            fc,
            x_mean,
            x_var,
        })
    }
}

impl DecoderModuleT for GaussianDecoder {
    type Recon = GaussianRecon;

    fn forward_t(
        &self,
        z_nk: &Tensor,
        _log_library_n1: Option<&Tensor>,
        train: bool,
    ) -> Result<GaussianRecon> {
        let h_nl = self.fc.forward_t(z_nk, train)?;
        let mean_nd = self.x_mean.forward_t(&h_nl, train)?;
        let var_nd = (softplus(&self.x_var.forward_t(&h_nl, train)?)? + 1e-3)?;
        Ok(GaussianRecon { mean_nd, var_nd })
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

///////////////////////////////////////
// Negative Binomial (count) decoder //
///////////////////////////////////////

impl ReconstructionT for NegativeBinomial {
    fn negative_log_likelihood(&self, x_nd: &Tensor) -> Result<Tensor> {
        self.log_prob(x_nd)?.mean_all()?.neg()
    }
}

/// z -> fc -> softmax gene proportions; mean = exp(library) * proportion,
/// inverse dispersion = exp(px_r) shared across cells
pub struct NegBinomDecoder {
    n_features: usize,
    n_latent: usize,
    fc: FcLayers,
    x_scale: Linear,
    px_r_d: Tensor,
}

impl NegBinomDecoder {
    /// Will create `fc.{j}.*` and `x.scale.*`, and share `px_r_d`
    /// (n_features) as the log inverse dispersion
    pub fn new(args: DecoderArgs, px_r_d: Tensor, vs: VarBuilder) -> Result<Self> {
        if px_r_d.dims() != [args.n_features] {
            candle_core::bail!(
                "dispersion has shape {:?}, expected [{}]",
                px_r_d.dims(),
                args.n_features
            );
        }
        let fc = FcLayers::new(args.fc_args(), vs.clone())?;
        let prev_dim = fc.dim_out();
        let x_scale = candle_nn::linear(prev_dim, args.n_features, vs.pp("x.scale"))?;
        Ok(Self {
            n_features: args.n_features,
            n_latent: args.n_latent,
            fc,
            x_scale,
            px_r_d,
        })
    }

    pub fn log_dispersion(&self) -> &Tensor {
        &self.px_r_d
    }
}

impl DecoderModuleT for NegBinomDecoder {
    type Recon = NegativeBinomial;

    fn forward_t(
        &self,
        z_nk: &Tensor,
        log_library_n1: Option<&Tensor>,
        train: bool,
    ) -> Result<NegativeBinomial> {
        let h_nl = self.fc.forward_t(z_nk, train)?;
        let scale_nd = ops::softmax_last_dim(&self.x_scale.forward_t(&h_nl, train)?)?;
        let mu_nd = match log_library_n1 {
            Some(log_lib) => scale_nd.broadcast_mul(&log_lib.clamp(-20f32, 20f32)?.exp()?)?,
            None => scale_nd,
        };
        Ok(NegativeBinomial::new(mu_nd, self.px_r_d.exp()?))
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn args() -> DecoderArgs {
        DecoderArgs {
            n_features: 7,
            n_latent: 3,
            n_hidden: 8,
            n_layers: 1,
            norm: NormKind::Batch,
            dropout: 0.,
        }
    }

    #[test]
    fn gaussian_decoder_moments() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let dec = GaussianDecoder::new(args(), VarBuilder::from_varmap(&vm, DType::F32, &dev))?;
        let z = Tensor::randn(0f32, 1f32, (5, 3), &dev)?;
        let x = Tensor::rand(0f32, 3f32, (5, 7), &dev)?;
        let (recon, nll) = dec.forward_with_nll(&z, None, &x, true)?;
        assert_eq!(recon.mean_nd.dims(), &[5, 7]);
        assert_eq!(recon.var_nd.dims(), &[5, 7]);
        assert!(recon.var_nd.min_all()?.to_scalar::<f32>()? > 0.);
        assert!(nll.to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn negbinom_decoder_library_scaling() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vs = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let px_r = vs.get_with_hints(7, "px_r", candle_nn::Init::Randn { mean: 0., stdev: 1. })?;
        let dec = NegBinomDecoder::new(args(), px_r, vs.pp("dec"))?;
        let z = Tensor::randn(0f32, 1f32, (5, 3), &dev)?;
        let log_lib = Tensor::full(100f32.ln(), (5, 1), &dev)?;
        let x = Tensor::rand(0f32, 30f32, (5, 7), &dev)?.floor()?;
        let (recon, nll) = dec.forward_with_nll(&z, Some(&log_lib), &x, false)?;

        // proportions sum to one, so the means sum to the library size
        let totals = recon.mean().sum(1)?.to_vec1::<f32>()?;
        for t in totals {
            assert!((t - 100.).abs() < 1e-2);
        }
        assert_eq!(recon.theta().dims(), &[7]);
        assert!(nll.to_scalar::<f32>()?.is_finite());
        Ok(())
    }
}
