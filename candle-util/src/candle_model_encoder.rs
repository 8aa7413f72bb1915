use crate::candle_aux_layers::*;
use crate::candle_distributions::DiagGaussian;
use crate::candle_loss_functions::softplus;
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, ModuleT, VarBuilder};

pub struct EncoderArgs {
    pub n_features: usize,
    pub n_latent: usize,
    pub n_hidden: usize,
    pub n_layers: usize,
    pub norm: NormKind,
    pub dropout: f64,
}

//////////////////////////
// deterministic encoder //
//////////////////////////

/// x -> fc -> z, a direct projection without a posterior
pub struct DeterministicEncoder {
    n_features: usize,
    n_latent: usize,
    fc: FcLayers,
}

impl DeterministicEncoder {
    /// Will create `fc.{j}.*` hidden blocks and an `out.*` projection
    pub fn new(args: EncoderArgs, vs: VarBuilder) -> Result<Self> {
        let fc = FcLayers::new(
            FcLayersArgs {
                n_in: args.n_features,
                n_out: Some(args.n_latent),
                n_hidden: args.n_hidden,
                n_layers: args.n_layers,
                norm: args.norm,
                dropout: args.dropout,
            },
            vs,
        )?;
        Ok(Self {
            n_features: args.n_features,
            n_latent: args.n_latent,
            fc,
        })
    }
}

impl EncoderModuleT for DeterministicEncoder {
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, Option<DiagGaussian>)> {
        Ok((self.fc.forward_t(x_nd, train)?, None))
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

/////////////////////////
// variational encoder //
/////////////////////////

/// x -> fc -> (mean, var) with var = softplus(.) + eps
pub struct GaussianEncoder {
    n_features: usize,
    n_latent: usize,
    fc: FcLayers,
    z_mean: Linear,
    z_var: Linear,
    var_eps: f64,
}

impl GaussianEncoder {
    /// Will create these variables:
    /// * `fc.{j}.*` for each hidden block j
    /// * `z.mean.weight`, `z.mean.bias`
    /// * `z.var.weight`, `z.var.bias`
    pub fn new(args: EncoderArgs, vs: VarBuilder) -> Result<Self> {
        let fc = FcLayers::new(
            FcLayersArgs {
                n_in: args.n_features,
                n_out: None,
                n_hidden: args.n_hidden,
                n_layers: args.n_layers,
                norm: args.norm,
                dropout: args.dropout,
            },
            vs.clone(),
        )?;
        let prev_dim = fc.dim_out();
        let z_mean = candle_nn::linear(prev_dim, args.n_latent, vs.pp("z.mean"))?;
        let z_var = candle_nn::linear(prev_dim, args.n_latent, vs.pp("z.var"))?;

        Ok(Self {
            n_features: args.n_features,
            n_latent: args.n_latent,
            fc,
            z_mean,
            z_var,
            var_eps: 1e-4,
        })
    }

    /// Evaluate the posterior q(z|x) = N(mean(x), var(x))
    pub fn posterior(&self, x_nd: &Tensor, train: bool) -> Result<DiagGaussian> {
        let h_nl = self.fc.forward_t(x_nd, train)?;
        let mean_nk = self.z_mean.forward_t(&h_nl, train)?;
        let var_nk = (softplus(&self.z_var.forward_t(&h_nl, train)?)? + self.var_eps)?;
        Ok(DiagGaussian::new(mean_nk, var_nk))
    }
}

impl EncoderModuleT for GaussianEncoder {
    /// z is sampled while training and set to the posterior mean otherwise
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, Option<DiagGaussian>)> {
        let q_z = self.posterior(x_nd, train)?;
        let z_nk = if train {
            q_z.rsample()?
        } else {
            q_z.mean().clone()
        };
        Ok((z_nk, Some(q_z)))
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

    fn args() -> EncoderArgs {
        EncoderArgs {
            n_features: 10,
            n_latent: 3,
            n_hidden: 8,
            n_layers: 2,
            norm: NormKind::Layer,
            dropout: 0.,
        }
    }

    #[test]
    fn deterministic_encoder_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vs = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let enc = DeterministicEncoder::new(args(), vs)?;
        let x = Tensor::rand(0f32, 5f32, (4, 10), &dev)?;
        let (z, q) = enc.forward_t(&x, true)?;
        assert_eq!(z.dims(), &[4, 3]);
        assert!(q.is_none());
        Ok(())
    }

    #[test]
    fn gaussian_encoder_positive_variance() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let enc = GaussianEncoder::new(args(), VarBuilder::from_varmap(&vm, DType::F32, &dev))?;
        let x = Tensor::rand(0f32, 5f32, (4, 10), &dev)?;
        let (z, q) = enc.forward_t(&x, false)?;
        let q = q.ok_or_else(|| candle_core::Error::Msg("no posterior".into()))?;
        assert_eq!(z.dims(), &[4, 3]);
        assert!(q.variance().min_all()?.to_scalar::<f32>()? > 0.);
        // posterior mean in evaluation mode
        let diff = (z - q.mean())?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.);
        Ok(())
    }
}
