pub mod attention;
pub mod mlp;
pub mod normalization;
pub mod rotary;

use candle_nn::VarBuilder;

pub use attention::{causal_attention, causal_mask};
pub use mlp::SwiGluMlp;
pub use normalization::RmsNorm;
pub use rotary::RotaryEmbedding;

/// Path of a dense sublayer in the native module tree, which wraps every
/// projection twice: `{name}.module.module`.
pub fn wrapped<'a>(vb: &VarBuilder<'a>, name: &str) -> VarBuilder<'a> {
    vb.pp(name).pp("module").pp("module")
}
