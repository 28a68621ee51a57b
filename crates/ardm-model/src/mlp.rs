//! Feed-forward block with ReLU² activation

use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::{Linear, Module, ReLU};

/// Position-wise feed-forward layer
///
/// Expansion to 4x the embedding width, ReLU² activation, projection
/// back down.
pub struct FeedForward {
    c_fc: Linear,
    c_proj: Linear,
    relu: ReLU,
}

impl FeedForward {
    /// Create a new feed-forward layer
    pub fn new(n_embd: usize) -> Self {
        Self {
            c_fc: Linear::new(n_embd, 4 * n_embd),
            c_proj: Linear::new(4 * n_embd, n_embd),
            relu: ReLU::new(),
        }
    }

    /// Forward pass: [batch, seq_len, n_embd] -> [batch, seq_len, n_embd]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.c_fc.forward(x);

        // ReLU²: relu(x) squared elementwise
        let x = self.relu.forward(&x);
        let x_data = x.data();
        let squared: Vec<f32> = x_data.iter().map(|&v| v * v).collect();
        let x = Tensor::new(&squared, x.shape());

        Ok(self.c_proj.forward(&x))
    }
}

impl Module for FeedForward {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.forward(input).expect("FeedForward forward pass failed")
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = Vec::new();
        params.extend(self.c_fc.parameters());
        params.extend(self.c_proj.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::new();
        params.extend(self.c_fc.parameters_mut());
        params.extend(self.c_proj.parameters_mut());
        params
    }
}
