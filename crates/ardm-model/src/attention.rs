//! Multi-head causal self-attention with a dialogue cache
//!
//! Turns of a fragment are fed through the backbone one at a time; the
//! [`DialogCache`] carries each layer's keys and values forward so later
//! turns attend over the whole preceding context.

use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::{Dropout, Linear, Module};

/// Reshape for attention: [batch, seq, embed] -> [batch, heads, seq, head_dim]
fn split_heads(x: &Tensor, batch: usize, seq_len: usize, n_head: usize, head_dim: usize) -> Tensor {
    let mut output = vec![0.0; batch * n_head * seq_len * head_dim];
    let x_data = x.data();

    for b in 0..batch {
        for s in 0..seq_len {
            for h in 0..n_head {
                for d in 0..head_dim {
                    let in_idx =
                        b * seq_len * (n_head * head_dim) + s * (n_head * head_dim) + h * head_dim + d;
                    let out_idx =
                        b * n_head * seq_len * head_dim + h * seq_len * head_dim + s * head_dim + d;
                    output[out_idx] = x_data[in_idx];
                }
            }
        }
    }

    Tensor::new(&output, &[batch, n_head, seq_len, head_dim])
}

/// Reshape from attention: [batch, heads, seq, head_dim] -> [batch, seq, embed]
fn merge_heads(x: &Tensor, batch: usize, seq_len: usize, n_head: usize, head_dim: usize) -> Tensor {
    let embed = n_head * head_dim;
    let mut output = vec![0.0; batch * seq_len * embed];
    let x_data = x.data();

    for b in 0..batch {
        for s in 0..seq_len {
            for h in 0..n_head {
                for d in 0..head_dim {
                    let in_idx =
                        b * n_head * seq_len * head_dim + h * seq_len * head_dim + s * head_dim + d;
                    let out_idx = b * seq_len * embed + s * embed + h * head_dim + d;
                    output[out_idx] = x_data[in_idx];
                }
            }
        }
    }

    Tensor::new(&output, &[batch, seq_len, embed])
}

/// Transpose the last two dimensions
fn transpose_last_two(x: &Tensor) -> Tensor {
    let shape = x.shape();
    let ndim = shape.len();

    let last = shape[ndim - 1];
    let second_last = shape[ndim - 2];

    let mut new_shape = shape.to_vec();
    new_shape[ndim - 2] = last;
    new_shape[ndim - 1] = second_last;

    let batch_size: usize = shape[..ndim - 2].iter().product();
    let matrix_size = last * second_last;

    let x_data = x.data();
    let mut output = vec![0.0; x_data.len()];

    for b in 0..batch_size {
        let offset = b * matrix_size;
        for i in 0..second_last {
            for j in 0..last {
                output[offset + j * second_last + i] = x_data[offset + i * last + j];
            }
        }
    }

    Tensor::new(&output, &new_shape)
}

/// Batched matrix multiplication for 4D tensors
fn matmul_batched_4d(a: &Tensor, b: &Tensor) -> Tensor {
    let a_shape = a.shape();
    let b_shape = b.shape();

    let (batch, heads, m, k) = (a_shape[0], a_shape[1], a_shape[2], a_shape[3]);
    let n = b_shape[3];

    let mut output = vec![0.0; batch * heads * m * n];
    let a_data = a.data();
    let b_data = b.data();

    for b_idx in 0..batch {
        for h in 0..heads {
            for i in 0..m {
                for j in 0..n {
                    let mut sum = 0.0;
                    for k_idx in 0..k {
                        let a_idx = b_idx * heads * m * k + h * m * k + i * k + k_idx;
                        let b_off = b_idx * heads * b_shape[2] * n + h * b_shape[2] * n;
                        sum += a_data[a_idx] * b_data[b_off + k_idx * n + j];
                    }
                    output[b_idx * heads * m * n + h * m * n + i * n + j] = sum;
                }
            }
        }
    }

    Tensor::new(&output, &[batch, heads, m, n])
}

/// Softmax over the last dimension
fn softmax_last_dim(x: &Tensor) -> Tensor {
    let shape = x.shape();
    let last_dim = shape[shape.len() - 1];
    let batch_size: usize = shape[..shape.len() - 1].iter().product();

    let x_data = x.data();
    let mut output = vec![0.0; x_data.len()];

    for b in 0..batch_size {
        let offset = b * last_dim;
        let slice = &x_data[offset..offset + last_dim];

        let max_val = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp_vals: Vec<f32> = slice.iter().map(|&v| (v - max_val).exp()).collect();
        let sum: f32 = exp_vals.iter().sum();

        for i in 0..last_dim {
            output[offset + i] = if sum > 0.0 { exp_vals[i] / sum } else { 0.0 };
        }
    }

    Tensor::new(&output, shape)
}

/// Causal mask for cached attention
///
/// Query position `q` (the `past_len + q`-th token of the running
/// context) may attend keys `0..=past_len + q`; everything later gets
/// negative infinity.
fn causal_mask(q_len: usize, k_len: usize, past_len: usize) -> Vec<f32> {
    let mut mask = vec![0.0; q_len * k_len];
    for q in 0..q_len {
        for k in 0..k_len {
            if k > past_len + q {
                mask[q * k_len + k] = f32::NEG_INFINITY;
            }
        }
    }
    mask
}

/// Per-layer key/value memory spanning the turns of one fragment
///
/// A fresh cache is created for every training fragment and dropped
/// after the step.
pub struct DialogCache {
    /// Cached (keys, values) per layer, shape [batch, heads, cached_len, head_dim]
    cache: Vec<Option<(Tensor, Tensor)>>,
}

impl DialogCache {
    /// Create an empty cache for `n_layer` layers
    pub fn new(n_layer: usize) -> Self {
        let mut cache = Vec::with_capacity(n_layer);
        for _ in 0..n_layer {
            cache.push(None);
        }
        Self { cache }
    }

    /// Number of cached positions (same across layers)
    pub fn cached_len(&self) -> usize {
        match self.cache.first() {
            Some(Some((k, _))) => k.shape()[2],
            _ => 0,
        }
    }

    /// Append keys/values for one layer and return the full (k, v) context
    ///
    /// Shapes are [batch, heads, seq_len, head_dim]; the concatenation
    /// runs along the sequence dimension.
    pub fn append(&mut self, layer_idx: usize, k: Tensor, v: Tensor) -> Result<(Tensor, Tensor)> {
        if layer_idx >= self.cache.len() {
            anyhow::bail!(
                "Layer index {} out of range for cache with {} layers",
                layer_idx,
                self.cache.len()
            );
        }

        let merged = match self.cache[layer_idx].take() {
            None => (k, v),
            Some((cached_k, cached_v)) => {
                let k_shape = cached_k.shape().to_vec();
                let new_shape = k.shape();
                if k_shape[0] != new_shape[0]
                    || k_shape[1] != new_shape[1]
                    || k_shape[3] != new_shape[3]
                {
                    anyhow::bail!(
                        "Cache shape mismatch: cached {:?} vs new {:?}",
                        k_shape,
                        new_shape
                    );
                }

                let total_len = k_shape[2] + new_shape[2];

                let mut k_data = cached_k.data().to_vec();
                k_data.extend_from_slice(k.data());
                let k_concat =
                    Tensor::new(&k_data, &[k_shape[0], k_shape[1], total_len, k_shape[3]]);

                let mut v_data = cached_v.data().to_vec();
                v_data.extend_from_slice(v.data());
                let v_concat =
                    Tensor::new(&v_data, &[k_shape[0], k_shape[1], total_len, k_shape[3]]);

                (k_concat, v_concat)
            }
        };

        self.cache[layer_idx] = Some((merged.0.clone(), merged.1.clone()));
        Ok(merged)
    }
}

/// Multi-head causal self-attention
pub struct CausalSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    n_head: usize,
    head_dim: usize,
    dropout_layer: Option<Dropout>,
}

impl CausalSelfAttention {
    /// Create a new attention layer
    ///
    /// # Arguments
    /// * `n_embd` - Embedding dimension
    /// * `n_head` - Number of attention heads
    /// * `dropout_p` - Dropout probability (None or 0.0 = no dropout)
    /// * `seed` - Optional seed for the dropout mask
    pub fn new(n_embd: usize, n_head: usize, dropout_p: Option<f32>, seed: Option<u64>) -> Self {
        let head_dim = n_embd / n_head;

        let dropout_layer = match (dropout_p, seed) {
            (Some(p), Some(s)) if p > 0.0 => Some(Dropout::with_seed(p, s)),
            (Some(p), None) if p > 0.0 => Some(Dropout::new(p)),
            _ => None,
        };

        Self {
            q_proj: Linear::new(n_embd, n_embd),
            k_proj: Linear::new(n_embd, n_embd),
            v_proj: Linear::new(n_embd, n_embd),
            out_proj: Linear::new(n_embd, n_embd),
            n_head,
            head_dim,
            dropout_layer,
        }
    }

    /// Number of attention heads
    pub fn n_head(&self) -> usize {
        self.n_head
    }

    /// Forward pass over one turn, attending across the cached context
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, seq_len, n_embd]
    /// * `cache` - Dialogue cache carrying keys/values of earlier turns
    /// * `layer_idx` - This layer's slot in the cache
    pub fn forward(
        &self,
        x: &Tensor,
        cache: &mut DialogCache,
        layer_idx: usize,
    ) -> Result<Tensor> {
        let shape = x.shape();
        if shape.len() != 3 {
            anyhow::bail!(
                "Expected 3D tensor [batch, seq_len, n_embd], got shape {:?}",
                shape
            );
        }

        let batch = shape[0];
        let seq_len = shape[1];
        let past_len = cache.cached_len();

        let q = self.q_proj.forward(x);
        let k = self.k_proj.forward(x);
        let v = self.v_proj.forward(x);

        let q = split_heads(&q, batch, seq_len, self.n_head, self.head_dim);
        let k = split_heads(&k, batch, seq_len, self.n_head, self.head_dim);
        let v = split_heads(&v, batch, seq_len, self.n_head, self.head_dim);

        let (k_ctx, v_ctx) = cache.append(layer_idx, k, v)?;
        let total_len = k_ctx.shape()[2];

        // Scores: Q @ K^T / sqrt(head_dim), causally masked against the
        // running context, softmaxed over keys.
        let scale = 1.0 / (self.head_dim as f32).sqrt();
        let k_t = transpose_last_two(&k_ctx);
        let scores = matmul_batched_4d(&q, &k_t);

        let mask = causal_mask(seq_len, total_len, past_len);
        let scores_data = scores.data();
        let mut masked = vec![0.0; scores_data.len()];
        for b in 0..batch {
            for h in 0..self.n_head {
                for qi in 0..seq_len {
                    for ki in 0..total_len {
                        let idx = b * self.n_head * seq_len * total_len
                            + h * seq_len * total_len
                            + qi * total_len
                            + ki;
                        masked[idx] = scores_data[idx] * scale + mask[qi * total_len + ki];
                    }
                }
            }
        }
        let scores = Tensor::new(&masked, &[batch, self.n_head, seq_len, total_len]);

        let attn_weights = softmax_last_dim(&scores);
        let attn_weights = match &self.dropout_layer {
            Some(dropout) => dropout.forward(&attn_weights),
            None => attn_weights,
        };

        let attn_output = matmul_batched_4d(&attn_weights, &v_ctx);
        let attn_output = merge_heads(&attn_output, batch, seq_len, self.n_head, self.head_dim);

        Ok(self.out_proj.forward(&attn_output))
    }
}

impl Module for CausalSelfAttention {
    fn forward(&self, input: &Tensor) -> Tensor {
        let mut cache = DialogCache::new(1);
        self.forward(input, &mut cache, 0)
            .expect("Attention forward failed")
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = Vec::new();
        params.extend(self.q_proj.parameters());
        params.extend(self.k_proj.parameters());
        params.extend(self.v_proj.parameters());
        params.extend(self.out_proj.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::new();
        params.extend(self.q_proj.parameters_mut());
        params.extend(self.k_proj.parameters_mut());
        params.extend(self.v_proj.parameters_mut());
        params.extend(self.out_proj.parameters_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_blocks_future() {
        let mask = causal_mask(2, 5, 3);
        // first query (context position 3) sees keys 0..=3
        assert_eq!(mask[3], 0.0);
        assert_eq!(mask[4], f32::NEG_INFINITY);
        // second query (context position 4) sees everything
        assert_eq!(mask[5 + 4], 0.0);
    }

    #[test]
    fn test_forward_shape() {
        let attn = CausalSelfAttention::new(16, 2, None, None);
        let x = Tensor::ones(&[1, 4, 16]);
        let mut cache = DialogCache::new(1);

        let out = attn.forward(&x, &mut cache, 0).unwrap();
        assert_eq!(out.shape(), &[1, 4, 16]);
        assert_eq!(cache.cached_len(), 4);
    }

    #[test]
    fn test_cache_accumulates_across_turns() {
        let attn = CausalSelfAttention::new(16, 2, None, None);
        let mut cache = DialogCache::new(1);

        let turn1 = Tensor::ones(&[1, 3, 16]);
        let turn2 = Tensor::ones(&[1, 2, 16]);

        attn.forward(&turn1, &mut cache, 0).unwrap();
        attn.forward(&turn2, &mut cache, 0).unwrap();

        assert_eq!(cache.cached_len(), 5);
    }

    #[test]
    fn test_attention_weights_sum_to_one() {
        let x = Tensor::new(&[0.5, -0.2, 1.0, 0.3], &[1, 1, 4]);
        let scores = softmax_last_dim(&x);
        let sum: f32 = scores.data().iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }
}
