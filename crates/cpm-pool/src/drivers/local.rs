//! In-process deterministic embedding driver.
//!
//! Computes hashed-projection embeddings: each token lands on a sha256-chosen
//! axis with a sha256-chosen sign. The output depends only on the model name,
//! the text and the configured width, so replicas and cache entries agree
//! across processes and platforms. Real model inference belongs to the
//! subprocess or HTTP drivers.

use sha2::{Digest, Sha256};

use cpm_core::errors::CpmResult;
use cpm_core::matrix::Matrix;

use crate::types::EmbedRequestOptions;

use super::EmbedDriver;

pub struct LocalDriver {
    model_name: String,
    dim: usize,
}

impl LocalDriver {
    pub fn new(model_name: &str, dim: usize) -> Self {
        Self {
            model_name: model_name.to_string(),
            dim: dim.max(1),
        }
    }

    fn embed_one(&self, text: &str, max_tokens: usize, normalize: bool) -> Vec<f32> {
        let mut row = vec![0.0f32; self.dim];
        for token in text.split_whitespace().take(max_tokens.max(1)) {
            let mut hasher = Sha256::new();
            hasher.update(self.model_name.as_bytes());
            hasher.update(b"\x00");
            hasher.update(token.to_lowercase().as_bytes());
            let digest = hasher.finalize();
            let index = u64::from_le_bytes(digest[0..8].try_into().expect("8 bytes"))
                as usize
                % self.dim;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            row[index] += sign;
        }
        if normalize {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in row.iter_mut() {
                    *v /= norm;
                }
            }
        }
        row
    }
}

impl EmbedDriver for LocalDriver {
    fn warmup(&mut self) -> CpmResult<()> {
        Ok(())
    }

    fn embed(&mut self, texts: &[String], options: &EmbedRequestOptions) -> CpmResult<Matrix> {
        let max_tokens = options.max_seq_length.unwrap_or(1024) as usize;
        let normalize = options.normalize.unwrap_or(true);
        let mut matrix = Matrix::new(self.dim);
        for text in texts {
            matrix.push_row(&self.embed_one(text, max_tokens, normalize))?;
        }
        Ok(matrix)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_per_model_and_text() {
        let mut driver = LocalDriver::new("m", 16);
        let options = EmbedRequestOptions::default();
        let a = driver.embed(&["hello world".to_string()], &options).unwrap();
        let b = driver.embed(&["hello world".to_string()], &options).unwrap();
        assert_eq!(a.row(0), b.row(0));

        let mut other = LocalDriver::new("different", 16);
        let c = other.embed(&["hello world".to_string()], &options).unwrap();
        assert_ne!(a.row(0), c.row(0));
    }

    #[test]
    fn rows_are_unit_norm_by_default() {
        let mut driver = LocalDriver::new("m", 32);
        let m = driver
            .embed(&["some words to embed".to_string()], &EmbedRequestOptions::default())
            .unwrap();
        let norm: f32 = m.row(0).iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn max_seq_length_truncates() {
        let mut driver = LocalDriver::new("m", 8);
        let options = EmbedRequestOptions {
            max_seq_length: Some(1),
            normalize: Some(false),
            ..Default::default()
        };
        let long = driver.embed(&["one two three".to_string()], &options).unwrap();
        let short = driver.embed(&["one".to_string()], &options).unwrap();
        assert_eq!(long.row(0), short.row(0));
    }
}
