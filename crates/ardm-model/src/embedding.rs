//! Token and position embedding tables

use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::Module;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Sample a normal-distributed weight table via the Box-Muller transform
///
/// Matches the initialization approach used for the backbone's linear
/// layers: `StdRng` seeding keeps runs reproducible when a seed is set.
fn init_embedding_weight(rows: usize, cols: usize, std: f32, seed: Option<u64>) -> Tensor {
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    let mut data = Vec::with_capacity(rows * cols);
    for _ in 0..rows * cols {
        let u1: f32 = rng.gen_range(0.0001_f32..1.0_f32);
        let u2: f32 = rng.gen_range(0.0_f32..1.0_f32);
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
        data.push(z * std);
    }

    Tensor::new(&data, &[rows, cols])
}

/// Lookup table mapping integer ids to embedding rows
///
/// Used for both token embeddings (vocab rows) and the learned absolute
/// position embeddings (`n_positions` rows) that consume the collator's
/// randomized position ids.
pub struct Embedding {
    weight: Tensor,
    num_embeddings: usize,
    dim: usize,
}

impl Embedding {
    /// Create a new embedding table with normal(0, std) initialization
    pub fn new(num_embeddings: usize, dim: usize, std: f32, seed: Option<u64>) -> Self {
        Self {
            weight: init_embedding_weight(num_embeddings, dim, std, seed),
            num_embeddings,
            dim,
        }
    }

    /// Number of rows in the table
    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    /// Embedding dimension
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Look up a batch of ids: [1, len] -> [1, len, dim]
    ///
    /// Ids arrive as an f32 tensor (the collator stores token and
    /// position ids that way); each is rounded to the nearest row index.
    pub fn lookup(&self, ids: &Tensor) -> Result<Tensor> {
        let shape = ids.shape();
        if shape.len() != 2 {
            anyhow::bail!("Expected 2D id tensor [batch, len], got shape {:?}", shape);
        }
        let batch = shape[0];
        let len = shape[1];

        let ids_data = ids.data();
        let weight_data = self.weight.data();

        let mut out = vec![0.0; batch * len * self.dim];
        for (i, &raw) in ids_data.iter().enumerate() {
            let id = raw as usize;
            if id >= self.num_embeddings {
                anyhow::bail!(
                    "Id {} out of range for embedding table with {} rows",
                    id,
                    self.num_embeddings
                );
            }
            let row = &weight_data[id * self.dim..(id + 1) * self.dim];
            out[i * self.dim..(i + 1) * self.dim].copy_from_slice(row);
        }

        Ok(Tensor::new(&out, &[batch, len, self.dim]))
    }
}

impl Module for Embedding {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.lookup(input).expect("Embedding lookup failed")
    }

    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_shape() {
        let emb = Embedding::new(10, 4, 0.02, Some(7));
        let ids = Tensor::new(&[0.0, 3.0, 9.0], &[1, 3]);

        let out = emb.lookup(&ids).unwrap();
        assert_eq!(out.shape(), &[1, 3, 4]);
    }

    #[test]
    fn test_lookup_out_of_range() {
        let emb = Embedding::new(10, 4, 0.02, Some(7));
        let ids = Tensor::new(&[10.0], &[1, 1]);

        assert!(emb.lookup(&ids).is_err());
    }

    #[test]
    fn test_seeded_init_is_deterministic() {
        let a = Embedding::new(6, 3, 0.02, Some(1));
        let b = Embedding::new(6, 3, 0.02, Some(1));

        assert_eq!(
            a.parameters()[0].data().to_vec(),
            b.parameters()[0].data().to_vec()
        );
    }
}
