//! Medusa prediction head.
//!
//! Each head is a stack of residual SiLU blocks followed by its own
//! vocabulary projection. Head `h` is trained to predict the token `h + 2`
//! positions after the current one (the base model covers `+1`).

use candle_core::{Module, Tensor};
use candle_nn::Linear;

use super::tiny::SeededInit;
use crate::error::Result;

/// `x + silu(W x + b)`
#[derive(Debug, Clone)]
struct ResBlock {
    linear: Linear,
}

impl ResBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = candle_nn::ops::silu(&self.linear.forward(x)?)?;
        Ok((x + h)?)
    }
}

/// A single Medusa head.
#[derive(Debug, Clone)]
pub struct MedusaHead {
    blocks: Vec<ResBlock>,
    lm_head: Linear,
}

impl MedusaHead {
    /// Creates a head with seeded random weights.
    pub(crate) fn new_random(
        hidden_size: usize,
        vocab_size: usize,
        num_layers: usize,
        init: &mut SeededInit,
    ) -> Result<Self> {
        let blocks = (0..num_layers)
            .map(|_| {
                Ok(ResBlock {
                    linear: init.linear(hidden_size, hidden_size, true)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let lm_head = init.linear(hidden_size, vocab_size, false)?;

        Ok(Self { blocks, lm_head })
    }

    /// Number of residual blocks.
    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// `[seq_len, hidden_size]` -> `[seq_len, vocab_size]`
    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let mut h = hidden_states.clone();
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        Ok(self.lm_head.forward(&h)?)
    }
}
