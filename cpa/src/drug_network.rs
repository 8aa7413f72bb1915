use crate::cpa_config::DoserType;
use candle_core::{Result, Tensor};
use candle_nn::{ops, VarBuilder};

/// Per-drug monotone network g: R+ -> R with positive weights and tanh
/// activations, applied to all drugs at once
///
/// * `log_w_in_dw`, `b_in_dw` - 1 -> width
/// * `log_w_hidden`, `b_hidden` - width -> width, (d x w x w), (d x w)
/// * `log_w_out_dw` - width -> 1
struct MonotoneDoser {
    log_w_in_dw: Tensor,
    b_in_dw: Tensor,
    log_w_hidden: Vec<(Tensor, Tensor)>,
    log_w_out_dw: Tensor,
}

impl MonotoneDoser {
    fn new(n_drugs: usize, width: usize, depth: usize, vs: VarBuilder) -> Result<Self> {
        let small = |mean: f64| candle_nn::Init::Randn { mean, stdev: 0.1 };
        let log_width = -(width as f64).ln();

        let log_w_in_dw = vs.get_with_hints((n_drugs, width), "in.log_weight", small(0.))?;
        let b_in_dw = vs.get_with_hints((n_drugs, width), "in.bias", small(0.))?;

        let mut log_w_hidden = vec![];
        for j in 1..depth {
            let vs_j = vs.pp(format!("hidden.{}", j));
            let w = vs_j.get_with_hints((n_drugs, width, width), "log_weight", small(log_width))?;
            let b = vs_j.get_with_hints((n_drugs, width), "bias", small(0.))?;
            log_w_hidden.push((w, b));
        }

        let log_w_out_dw = vs.get_with_hints((n_drugs, width), "out.log_weight", small(log_width))?;

        Ok(Self {
            log_w_in_dw,
            b_in_dw,
            log_w_hidden,
            log_w_out_dw,
        })
    }

    /// g(dose) for each cell and drug (n x d)
    fn forward(&self, doses_nd: &Tensor) -> Result<Tensor> {
        let (n, d) = doses_nd.dims2()?;

        // n x d x w
        let mut h_ndw = doses_nd
            .unsqueeze(2)?
            .broadcast_mul(&self.log_w_in_dw.exp()?.unsqueeze(0)?)?
            .broadcast_add(&self.b_in_dw.unsqueeze(0)?)?
            .tanh()?;

        for (log_w_dww, b_dw) in self.log_w_hidden.iter() {
            let h_dnw = h_ndw.transpose(0, 1)?.contiguous()?;
            h_ndw = h_dnw
                .matmul(&log_w_dww.exp()?)?
                .transpose(0, 1)?
                .broadcast_add(&b_dw.unsqueeze(0)?)?
                .tanh()?;
        }

        let out_nd = h_ndw
            .broadcast_mul(&self.log_w_out_dw.exp()?.unsqueeze(0)?)?
            .sum(2)?;
        debug_assert_eq!(out_nd.dims(), &[n, d]);
        Ok(out_nd)
    }
}

enum Doser {
    Linear,
    Sigmoid { beta_d: Tensor, bias_d: Tensor },
    LogSigmoid { beta_d: Tensor, bias_d: Tensor },
    Mlp(MonotoneDoser),
}

/// Maps doses (n x drugs) to one latent perturbation per cell (n x k):
/// each drug's latent direction is scaled by its dose response and the
/// drugs present in a cell are summed
pub struct DrugNetwork {
    n_drugs: usize,
    n_latent: usize,
    doser: Doser,
    drug_embedding_dk: Tensor,
}

impl DrugNetwork {
    /// Will create these variables:
    /// * `embedding` (n_drugs x n_latent)
    /// * `doser.beta`, `doser.bias` for sigmoid curves
    /// * `doser.{in,hidden.j,out}.*` for the monotone network
    pub fn new(
        n_drugs: usize,
        n_latent: usize,
        doser_type: DoserType,
        doser_width: usize,
        doser_depth: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        let drug_embedding_dk = vs.get_with_hints(
            (n_drugs, n_latent),
            "embedding",
            candle_nn::Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        )?;

        let vs_doser = vs.pp("doser");
        let sigmoid_params = || -> Result<(Tensor, Tensor)> {
            let beta_d = vs_doser.get_with_hints(n_drugs, "beta", candle_nn::Init::Const(1.))?;
            let bias_d = vs_doser.get_with_hints(n_drugs, "bias", candle_nn::Init::Const(0.))?;
            Ok((beta_d, bias_d))
        };

        let doser = match doser_type {
            DoserType::Linear => Doser::Linear,
            DoserType::Sigmoid => {
                let (beta_d, bias_d) = sigmoid_params()?;
                Doser::Sigmoid { beta_d, bias_d }
            }
            DoserType::LogSigmoid => {
                let (beta_d, bias_d) = sigmoid_params()?;
                Doser::LogSigmoid { beta_d, bias_d }
            }
            DoserType::Mlp => Doser::Mlp(MonotoneDoser::new(
                n_drugs,
                doser_width,
                doser_depth,
                vs_doser.clone(),
            )?),
        };

        Ok(Self {
            n_drugs,
            n_latent,
            doser,
            drug_embedding_dk,
        })
    }

    /// Dose response s(dose) per cell and drug (n x d); s(0) = 0
    pub fn dose_response(&self, doses_nd: &Tensor) -> Result<Tensor> {
        match &self.doser {
            Doser::Linear => Ok(doses_nd.clone()),
            Doser::Sigmoid { beta_d, bias_d } => shifted_sigmoid(doses_nd, beta_d, bias_d),
            Doser::LogSigmoid { beta_d, bias_d } => {
                shifted_sigmoid(&(doses_nd + 1.)?.log()?, beta_d, bias_d)
            }
            Doser::Mlp(mlp) => {
                let zero_1d = Tensor::zeros(
                    (1, doses_nd.dim(1)?),
                    doses_nd.dtype(),
                    doses_nd.device(),
                )?;
                mlp.forward(doses_nd)?.broadcast_sub(&mlp.forward(&zero_1d)?)
            }
        }
    }

    /// Combined latent perturbation (n x k) = s(dose) * embedding
    pub fn forward(&self, doses_nd: &Tensor) -> Result<Tensor> {
        if doses_nd.dim(0)? == 0 {
            return Tensor::zeros(
                (0, self.n_latent),
                self.drug_embedding_dk.dtype(),
                self.drug_embedding_dk.device(),
            );
        }
        self.dose_response(doses_nd)?.matmul(&self.drug_embedding_dk)
    }

    /// latent direction of each drug (n_drugs x n_latent)
    pub fn drug_embeddings(&self) -> &Tensor {
        &self.drug_embedding_dk
    }

    pub fn n_drugs(&self) -> usize {
        self.n_drugs
    }
}

/// σ(β x + b) - σ(b), monotone in x and zero at x = 0
fn shifted_sigmoid(x_nd: &Tensor, beta_d: &Tensor, bias_d: &Tensor) -> Result<Tensor> {
    let at_x = ops::sigmoid(&x_nd.broadcast_mul(beta_d)?.broadcast_add(bias_d)?)?;
    at_x.broadcast_sub(&ops::sigmoid(bias_d)?)
}
