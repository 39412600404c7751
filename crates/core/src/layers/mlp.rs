use candle_core::{Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use super::wrapped;

/// SwiGLU feed-forward: `w2(silu(w1 x) * w3 x)`.
pub struct SwiGluMlp {
    w1: Linear,
    w2: Linear,
    w3: Linear,
}

impl SwiGluMlp {
    /// Load `w1`/`w2`/`w3` from their wrapped native paths under `vb`.
    pub fn new(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        let w1 = linear_no_bias(hidden_size, intermediate_size, wrapped(&vb, "w1"))?;
        let w2 = linear_no_bias(intermediate_size, hidden_size, wrapped(&vb, "w2"))?;
        let w3 = linear_no_bias(hidden_size, intermediate_size, wrapped(&vb, "w3"))?;
        Ok(Self { w1, w2, w3 })
    }

    /// Gate, down and up projection weights.
    pub fn weights(&self) -> [&Tensor; 3] {
        [self.w1.weight(), self.w2.weight(), self.w3.weight()]
    }
}

impl Module for SwiGluMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self.w1.forward(xs)?.apply(&candle_nn::Activation::Silu)?;
        let up = self.w3.forward(xs)?;
        (gate * up)?.apply(&self.w2)
    }
}
