//! Functional RMSNorm

use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::{Module, RMSNorm};

/// Apply RMSNorm over the last dimension (no learnable parameters)
///
/// RMSNorm: x / sqrt(mean(x^2) + eps). Unlike LayerNorm there is no
/// mean centering.
pub fn rms_norm(x: &Tensor) -> Result<Tensor> {
    let shape = x.shape();
    if shape.is_empty() {
        anyhow::bail!("Input tensor must have at least one dimension");
    }

    let hidden_dim = shape[shape.len() - 1];
    let norm = RMSNorm::without_affine(&[hidden_dim]);

    Ok(norm.forward(x))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_norm_preserves_shape() {
        let x = Tensor::ones(&[2, 3, 8]);
        let result = rms_norm(&x).expect("RMSNorm failed");
        assert_eq!(result.shape(), x.shape());
    }

    #[test]
    fn test_rms_norm_rejects_scalarlike() {
        let x = Tensor::ones(&[2, 4]);
        assert!(rms_norm(&x).is_ok());
    }
}
