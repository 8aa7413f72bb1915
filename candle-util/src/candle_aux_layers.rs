use candle_core::{Result, Tensor, Var};
use candle_nn::{Linear, ModuleT, VarBuilder};
use clap::ValueEnum;

/// Normalization applied after each hidden linear layer
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
pub enum NormKind {
    Batch,
    Layer,
    None,
}

//////////////////////////////////
// batch and layer normalization //
//////////////////////////////////

/// Batch normalization over the first (sample) dimension with running
/// statistics for evaluation mode.
pub struct BatchNorm1d {
    weight_d: Tensor,
    bias_d: Tensor,
    running_mean_d: Var,
    running_var_d: Var,
    eps: f64,
    momentum: f64,
}

/// Layer normalization over the last (feature) dimension without an
/// elementwise affine transformation.
pub struct LayerNorm1d {
    eps: f64,
}

pub enum Normalization {
    Batch(BatchNorm1d),
    Layer(LayerNorm1d),
}

/// What the input gradient needs to remember from a normalization step
#[derive(Clone, Debug)]
pub enum NormTrace {
    BatchTrain {
        xhat_nd: Tensor,
        inv_std_1d: Tensor,
        weight_d: Tensor,
    },
    BatchEval {
        inv_std_d: Tensor,
        weight_d: Tensor,
    },
    Layer {
        xhat_nd: Tensor,
        inv_std_n1: Tensor,
    },
}

impl BatchNorm1d {
    pub fn new(dim: usize, vs: VarBuilder) -> Result<Self> {
        let weight_d = vs.get_with_hints(dim, "weight", candle_nn::Init::Const(1.))?;
        let bias_d = vs.get_with_hints(dim, "bias", candle_nn::Init::Const(0.))?;
        let running_mean_d = vs.get_with_hints(dim, "running_mean", candle_nn::Init::Const(0.))?;
        let running_var_d = vs.get_with_hints(dim, "running_var", candle_nn::Init::Const(1.))?;
        Ok(Self {
            weight_d,
            bias_d,
            running_mean_d: Var::from_tensor(&running_mean_d)?,
            running_var_d: Var::from_tensor(&running_var_d)?,
            eps: 1e-3,
            momentum: 0.01,
        })
    }

    fn forward_trace(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, NormTrace)> {
        if train {
            let mean_1d = x_nd.mean_keepdim(0)?;
            let xc_nd = x_nd.broadcast_sub(&mean_1d)?;
            let var_1d = xc_nd.sqr()?.mean_keepdim(0)?;
            let inv_std_1d = (var_1d.clone() + self.eps)?.sqrt()?.recip()?;
            let xhat_nd = xc_nd.broadcast_mul(&inv_std_1d)?;

            // running statistics are copied by value, outside of the graph
            let m = self.momentum;
            let rm = ((self.running_mean_d.as_tensor() * (1. - m))?
                + (mean_1d.flatten_all()? * m)?)?;
            let rv = ((self.running_var_d.as_tensor() * (1. - m))?
                + (var_1d.flatten_all()? * m)?)?;
            self.running_mean_d.set(&rm)?;
            self.running_var_d.set(&rv)?;

            let y_nd = xhat_nd
                .broadcast_mul(&self.weight_d)?
                .broadcast_add(&self.bias_d)?;
            Ok((
                y_nd,
                NormTrace::BatchTrain {
                    xhat_nd,
                    inv_std_1d,
                    weight_d: self.weight_d.clone(),
                },
            ))
        } else {
            // running statistics are buffers, not trained
            let inv_std_d = (self.running_var_d.as_tensor().detach() + self.eps)?
                .sqrt()?
                .recip()?;
            let y_nd = x_nd
                .broadcast_sub(&self.running_mean_d.as_tensor().detach())?
                .broadcast_mul(&inv_std_d)?
                .broadcast_mul(&self.weight_d)?
                .broadcast_add(&self.bias_d)?;
            Ok((
                y_nd,
                NormTrace::BatchEval {
                    inv_std_d,
                    weight_d: self.weight_d.clone(),
                },
            ))
        }
    }
}

impl LayerNorm1d {
    pub fn new() -> Self {
        Self { eps: 1e-5 }
    }

    fn forward_trace(&self, x_nd: &Tensor) -> Result<(Tensor, NormTrace)> {
        let mean_n1 = x_nd.mean_keepdim(1)?;
        let xc_nd = x_nd.broadcast_sub(&mean_n1)?;
        let var_n1 = xc_nd.sqr()?.mean_keepdim(1)?;
        let inv_std_n1 = (var_n1 + self.eps)?.sqrt()?.recip()?;
        let xhat_nd = xc_nd.broadcast_mul(&inv_std_n1)?;
        Ok((
            xhat_nd.clone(),
            NormTrace::Layer {
                xhat_nd,
                inv_std_n1,
            },
        ))
    }
}

impl Default for LayerNorm1d {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalization {
    fn forward_trace(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, NormTrace)> {
        match self {
            Normalization::Batch(bn) => bn.forward_trace(x_nd, train),
            Normalization::Layer(ln) => ln.forward_trace(x_nd),
        }
    }
}

/// Backpropagate `g` through `xhat = (x - mean) * inv_std` where the
/// statistics were taken along `dim`
///
/// dx = inv_std / m * (m * g - Σ g - xhat * Σ (g * xhat))
fn standardize_vjp(
    g_nd: &Tensor,
    xhat_nd: &Tensor,
    inv_std: &Tensor,
    dim: usize,
) -> Result<Tensor> {
    let m = xhat_nd.dim(dim)? as f64;
    let g_sum = g_nd.sum_keepdim(dim)?;
    let gx_sum = (g_nd * xhat_nd)?.sum_keepdim(dim)?;
    let inner = (g_nd * m)?
        .broadcast_sub(&g_sum)?
        .sub(&xhat_nd.broadcast_mul(&gx_sum)?)?;
    inner.broadcast_mul(inv_std)? / m
}

impl NormTrace {
    fn vjp(&self, g_nd: &Tensor) -> Result<Tensor> {
        match self {
            NormTrace::BatchTrain {
                xhat_nd,
                inv_std_1d,
                weight_d,
            } => {
                let g_nd = g_nd.broadcast_mul(weight_d)?;
                standardize_vjp(&g_nd, xhat_nd, inv_std_1d, 0)
            }
            NormTrace::BatchEval {
                inv_std_d,
                weight_d,
            } => g_nd.broadcast_mul(&(inv_std_d * weight_d)?),
            NormTrace::Layer {
                xhat_nd,
                inv_std_n1,
            } => standardize_vjp(g_nd, xhat_nd, inv_std_n1, 1),
        }
    }
}

///////////////////////////////
// fully connected layers    //
///////////////////////////////

/// Hidden block: linear -> normalization -> relu -> dropout
struct FcBlock {
    linear: Linear,
    norm: Option<Normalization>,
    hidden: bool,
    dropout: f64,
}

#[derive(Clone, Debug)]
struct BlockTrace {
    norm: Option<NormTrace>,
    relu_mask: Option<Tensor>,
    dropout_mask: Option<Tensor>,
}

/// Intermediate quantities of one forward pass, enough to replay the
/// pass backward with respect to its input
#[derive(Clone, Debug)]
pub struct FcTrace {
    blocks: Vec<BlockTrace>,
    n_out: usize,
    n_samples: usize,
}

impl FcTrace {
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }
}

/// A stack of `n_layers` hidden blocks of width `n_hidden`, optionally
/// followed by a plain linear output layer
pub struct FcLayers {
    blocks: Vec<FcBlock>,
    n_in: usize,
    n_out: usize,
}

pub struct FcLayersArgs {
    pub n_in: usize,
    pub n_out: Option<usize>,
    pub n_hidden: usize,
    pub n_layers: usize,
    pub norm: NormKind,
    pub dropout: f64,
}

impl FcBlock {
    fn forward_trace(&self, x: &Tensor, train: bool) -> Result<(Tensor, BlockTrace)> {
        let mut h = self.linear.forward_t(x, train)?;
        let mut trace = BlockTrace {
            norm: None,
            relu_mask: None,
            dropout_mask: None,
        };

        if let Some(norm) = &self.norm {
            let (h_norm, norm_trace) = norm.forward_trace(&h, train)?;
            h = h_norm;
            trace.norm = Some(norm_trace);
        }

        if self.hidden {
            let mask = h.gt(0.0)?.to_dtype(h.dtype())?;
            h = h.relu()?;
            trace.relu_mask = Some(mask);

            if train && self.dropout > 0. {
                let keep = 1. - self.dropout;
                let mask = (Tensor::rand_like(&h, 0., 1.)?
                    .ge(self.dropout)?
                    .to_dtype(h.dtype())?
                    / keep)?;
                h = (h * &mask)?;
                trace.dropout_mask = Some(mask);
            }
        }
        Ok((h, trace))
    }

    fn vjp(&self, trace: &BlockTrace, g: &Tensor) -> Result<Tensor> {
        let mut g = g.clone();
        if let Some(mask) = &trace.dropout_mask {
            g = (g * mask)?;
        }
        if let Some(mask) = &trace.relu_mask {
            g = (g * mask)?;
        }
        if let Some(norm) = &trace.norm {
            g = norm.vjp(&g)?;
        }
        // y = x W' + b  =>  dx = dy W
        g.matmul(self.linear.weight())
    }
}

impl FcLayers {
    /// Will create these variables:
    /// * `fc.{j}.weight`, `fc.{j}.bias` for each hidden block j
    /// * `fc.{j}.norm.*` when batch normalization is requested
    /// * `out.weight`, `out.bias` if `n_out` is given
    pub fn new(args: FcLayersArgs, vs: VarBuilder) -> Result<Self> {
        let mut blocks = Vec::with_capacity(args.n_layers + 1);
        let mut prev_dim = args.n_in;

        for j in 0..args.n_layers {
            let vs_j = vs.pp(format!("fc.{}", j));
            let linear = candle_nn::linear(prev_dim, args.n_hidden, vs_j.clone())?;
            let norm = match args.norm {
                NormKind::Batch => Some(Normalization::Batch(BatchNorm1d::new(
                    args.n_hidden,
                    vs_j.pp("norm"),
                )?)),
                NormKind::Layer => Some(Normalization::Layer(LayerNorm1d::new())),
                NormKind::None => None,
            };
            blocks.push(FcBlock {
                linear,
                norm,
                hidden: true,
                dropout: args.dropout,
            });
            prev_dim = args.n_hidden;
        }

        if let Some(n_out) = args.n_out {
            blocks.push(FcBlock {
                linear: candle_nn::linear(prev_dim, n_out, vs.pp("out"))?,
                norm: None,
                hidden: false,
                dropout: 0.,
            });
            prev_dim = n_out;
        }

        log::debug!(
            "fc layers: {} -> {} x {} -> {}",
            args.n_in,
            args.n_layers,
            args.n_hidden,
            prev_dim
        );

        Ok(Self {
            blocks,
            n_in: args.n_in,
            n_out: prev_dim,
        })
    }

    pub fn dim_in(&self) -> usize {
        self.n_in
    }

    pub fn dim_out(&self) -> usize {
        self.n_out
    }

    pub fn forward_trace(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, FcTrace)> {
        let mut h = x_nd.clone();
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.iter() {
            let (h_next, trace) = block.forward_trace(&h, train)?;
            h = h_next;
            blocks.push(trace);
        }
        Ok((
            h,
            FcTrace {
                blocks,
                n_out: self.n_out,
                n_samples: x_nd.dim(0)?,
            },
        ))
    }

    /// Vector-Jacobian product `g' ∂f/∂x` replayed from a trace with
    /// ordinary tensor ops, so the result stays differentiable with
    /// respect to both the parameters and the input
    ///
    /// * `trace` - from `forward_trace` on the same input
    /// * `g_nk` - upstream gradient with the output shape
    pub fn input_grad(&self, trace: &FcTrace, g_nk: &Tensor) -> Result<Tensor> {
        if trace.blocks.len() != self.blocks.len() {
            candle_core::bail!(
                "trace has {} blocks, but the stack has {}",
                trace.blocks.len(),
                self.blocks.len()
            );
        }
        let mut g = g_nk.clone();
        for (block, block_trace) in self.blocks.iter().zip(trace.blocks.iter()).rev() {
            g = block.vjp(block_trace, &g)?;
        }
        Ok(g)
    }

    /// Gradient of `Σ f(x)` with respect to `x`
    pub fn sum_input_grad(&self, trace: &FcTrace, like: &Tensor) -> Result<Tensor> {
        let ones = Tensor::ones(
            (trace.n_samples, trace.n_out),
            like.dtype(),
            like.device(),
        )?;
        self.input_grad(trace, &ones)
    }
}

impl ModuleT for FcLayers {
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.forward_trace(x_nd, train)?.0)
    }
}
