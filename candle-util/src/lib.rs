pub mod candle_aux_layers;
pub mod candle_decoder_expression;
pub mod candle_distributions;
pub mod candle_loss_functions;
pub mod candle_model_encoder;
pub mod candle_model_traits;

pub use candle_core;
pub use candle_nn;
